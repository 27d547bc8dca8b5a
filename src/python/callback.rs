use std::sync::Arc;

use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;

use super::gil::ExecutionGate;
use super::view::{self, LeaseOutcome, ViewLease};
use crate::buffer::AudioBuffer;
use crate::diagnostics::{Diagnostics, LogLevel, TracingDiagnostics};
use crate::error::ProcessError;
use crate::processor::FrameProcessor;

/// Runs a Python callable once per period as
/// `callback(input, output, frames, in_channels, out_channels)`.
///
/// Holds the only strong reference the stream takes to the callable. It is
/// dropped together with the processor, which the stream only does after the
/// driver thread has stopped calling it.
pub struct PyCallbackProcessor {
    callback: Py<PyAny>,
    gate: Arc<ExecutionGate>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl PyCallbackProcessor {
    pub fn new(callback: &Bound<'_, PyAny>) -> PyResult<Self> {
        if !callback.is_callable() {
            return Err(PyTypeError::new_err(format!(
                "audio callback must be callable, got {}",
                callback.get_type().name()?
            )));
        }
        Ok(PyCallbackProcessor {
            callback: callback.clone().unbind(),
            gate: Arc::new(ExecutionGate::new()),
            diagnostics: Arc::new(TracingDiagnostics),
        })
    }

    /// Where escaped-view warnings go.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn gate(&self) -> Arc<ExecutionGate> {
        Arc::clone(&self.gate)
    }

    /// One invocation. `adapt_output` builds the output view; leases already
    /// taken are released whichever step fails.
    fn call<F>(
        &self,
        py: Python<'_>,
        input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
        adapt_output: F,
    ) -> Result<(), ProcessError>
    where
        F: for<'py, 'b, 'a> FnOnce(
            Python<'py>,
            &'b mut AudioBuffer<'a>,
        ) -> PyResult<ViewLease<'py, 'b>>,
    {
        let frames = output.frames();
        let (in_channels, out_channels) = (input.channels(), output.channels());

        let input_view = view::adapt(py, input).map_err(|err| marshal_error(py, err))?;
        let output_view = match adapt_output(py, output) {
            Ok(lease) => lease,
            Err(err) => {
                self.settle(input_view);
                return Err(marshal_error(py, err));
            }
        };

        let result = match (input_view.view(), output_view.view()) {
            (Some(i), Some(o)) => (i, o, frames, in_channels, out_channels)
                .into_pyobject(py)
                .map_err(|err| marshal_error(py, err))
                .and_then(|args| {
                    self.callback
                        .bind(py)
                        .call1(args)
                        .map(drop)
                        .map_err(|err| ProcessError::Callback(describe(py, &err)))
                }),
            _ => Err(ProcessError::Marshal("buffer view was not built".to_string())),
        };

        self.settle(input_view);
        self.settle(output_view);
        result
    }

    fn settle(&self, lease: ViewLease<'_, '_>) {
        if let LeaseOutcome::Escaped(reason) = lease.release() {
            self.diagnostics.report(
                LogLevel::Warning,
                &format!("buffer view escaped the audio callback: {reason}"),
            );
        }
    }
}

impl FrameProcessor for PyCallbackProcessor {
    fn process(
        &mut self,
        input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
    ) -> Result<(), ProcessError> {
        self.gate
            .enter(|py| self.call(py, input, output, view::adapt_mut))?
    }
}

fn marshal_error(py: Python<'_>, err: PyErr) -> ProcessError {
    ProcessError::Marshal(describe(py, &err))
}

/// The exception with its traceback, the way Python would print it.
fn describe(py: Python<'_>, err: &PyErr) -> String {
    let traceback = err
        .traceback(py)
        .and_then(|tb| tb.format().ok())
        .unwrap_or_default();
    format!("{traceback}{err}")
}
