use std::sync::Arc;

use parking_lot::Mutex;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::wrap_pyfunction;

use super::callback::PyCallbackProcessor;
use super::gil::ExecutionGate;
use super::view::SampleBlock;
use crate::bridge::{self, BridgeStats, FailurePolicy};
use crate::buffer::SAMPLE_FORMAT;
use crate::config::{
    StreamConfig, BUFFER_SIZE_DEFAULT, NUM_BUFFERS_DEFAULT, NUM_CHANNELS_DEFAULT,
    SAMPLE_RATE_DEFAULT,
};
use crate::diagnostics::{self, LogLevel, TracingDiagnostics};
use crate::driver::DriverKind;
use crate::error::{ConfigError, StreamError};
use crate::processor::FrameProcessor;
use crate::stream::{AudioStream, StateMonitor, StreamState};
use crate::utils;

// ============ Errors exposed to Python ============

impl From<ConfigError> for PyErr {
    fn from(error: ConfigError) -> Self {
        PyValueError::new_err(error.to_string())
    }
}

impl From<StreamError> for PyErr {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::Config(error) => error.into(),
            other => PyRuntimeError::new_err(other.to_string()),
        }
    }
}

// ============ AudioStream wrapper ============

/// An audio stream calling a Python function once per buffer period.
///
/// The driver thread stops calling the function before `stop()` or
/// `shutdown()` return. Both release the GIL while they wait, and neither
/// may be called from the callback itself.
#[pyclass(name = "AudioStream", module = "chuckpy")]
pub struct PyAudioStream {
    /// Only locked with the GIL released: the driver thread may need the GIL
    /// to finish the period a control call is waiting for.
    inner: Mutex<Option<AudioStream>>,
    monitor: StateMonitor,
    config: StreamConfig,
    driver: &'static str,
    stats: Arc<BridgeStats>,
    gate: Arc<ExecutionGate>,
}

impl PyAudioStream {
    fn control<R, F>(&self, py: Python<'_>, action: &'static str, f: F) -> PyResult<R>
    where
        R: Send,
        F: FnOnce(&mut AudioStream) -> Result<R, StreamError> + Send,
    {
        if bridge::in_callback() {
            return Err(StreamError::InCallback(action).into());
        }
        py.allow_threads(|| {
            let mut guard = self.inner.lock();
            match guard.as_mut() {
                Some(stream) => f(stream),
                None => Err(StreamError::InvalidState("closed", action)),
            }
        })
        .map_err(PyErr::from)
    }

    /// Close the stream with the GIL released and hand back the processor,
    /// to be dropped by the caller while it holds the GIL.
    fn close(&self, py: Python<'_>) -> Option<Box<dyn FrameProcessor>> {
        py.allow_threads(|| self.inner.lock().take().and_then(AudioStream::close))
    }
}

#[pymethods]
impl PyAudioStream {
    #[new]
    #[pyo3(signature = (
        callback,
        sample_rate = SAMPLE_RATE_DEFAULT,
        input_channels = NUM_CHANNELS_DEFAULT,
        output_channels = NUM_CHANNELS_DEFAULT,
        buffer_size = BUFFER_SIZE_DEFAULT,
        num_buffers = NUM_BUFFERS_DEFAULT,
        realtime = true,
        driver = "simulated",
        on_error = "leave",
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        py: Python<'_>,
        callback: &Bound<'_, PyAny>,
        sample_rate: u32,
        input_channels: u32,
        output_channels: u32,
        buffer_size: u32,
        num_buffers: u32,
        realtime: bool,
        driver: &str,
        on_error: &str,
    ) -> PyResult<Self> {
        let kind = DriverKind::parse(driver)
            .ok_or_else(|| PyValueError::new_err(format!("unknown audio driver `{driver}`")))?;
        let on_callback_error = match on_error {
            "leave" => FailurePolicy::Leave,
            "silence" => FailurePolicy::Silence,
            _ => return Err(PyValueError::new_err("on_error must be 'leave' or 'silence'")),
        };
        let config = StreamConfig {
            sample_rate,
            input_channels,
            output_channels,
            buffer_size,
            num_buffers,
            realtime_hint: realtime,
            on_callback_error,
            ..StreamConfig::default()
        };
        let processor = PyCallbackProcessor::new(callback)?;
        let gate = processor.gate();

        // opening a hardware driver can block; the callback is not running yet
        let stream = py.allow_threads(move || {
            AudioStream::initialize_with(
                &config,
                Box::new(processor),
                kind.create(),
                Arc::new(TracingDiagnostics),
            )
        })?;
        Ok(PyAudioStream {
            monitor: stream.monitor(),
            config: stream.config().clone(),
            driver: stream.driver_name(),
            stats: stream.shared_stats(),
            gate,
            inner: Mutex::new(Some(stream)),
        })
    }

    fn start(&self, py: Python<'_>) -> PyResult<()> {
        self.control(py, "start", AudioStream::start)
    }

    fn stop(&self, py: Python<'_>) -> PyResult<()> {
        self.control(py, "stop", AudioStream::stop)
    }

    /// Stop the stream for good and drop the callback. Safe to call twice.
    fn shutdown(&self, py: Python<'_>) -> PyResult<()> {
        if bridge::in_callback() {
            return Err(StreamError::InCallback("shut down").into());
        }
        drop(self.close(py));
        Ok(())
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    #[pyo3(signature = (*_args))]
    fn __exit__(&self, py: Python<'_>, _args: &Bound<'_, pyo3::types::PyTuple>) -> PyResult<bool> {
        self.shutdown(py)?;
        Ok(false)
    }

    #[getter]
    fn state(&self) -> &'static str {
        self.monitor.state().name()
    }

    #[getter]
    fn running(&self) -> bool {
        self.monitor.state() == StreamState::Running
    }

    #[getter]
    fn halted(&self) -> bool {
        self.monitor.state() == StreamState::Halted
    }

    #[getter]
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    #[getter]
    fn input_channels(&self) -> u32 {
        self.config.input_channels
    }

    #[getter]
    fn output_channels(&self) -> u32 {
        self.config.output_channels
    }

    /// Frames per period, after rounding to a power of two.
    #[getter]
    fn buffer_size(&self) -> u32 {
        self.config.buffer_size
    }

    #[getter]
    fn num_buffers(&self) -> u32 {
        self.config.num_buffers
    }

    #[getter]
    fn realtime(&self) -> bool {
        self.config.realtime_hint
    }

    #[getter]
    fn driver(&self) -> &'static str {
        self.driver
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let snapshot = self.stats.snapshot();
        let dict = PyDict::new(py);
        dict.set_item("invocations", snapshot.invocations)?;
        dict.set_item("failures", snapshot.failures)?;
        dict.set_item("panics", snapshot.panics)?;
        dict.set_item("gil_acquired", self.gate.acquired())?;
        dict.set_item("gil_released", self.gate.released())?;
        Ok(dict)
    }

    fn config_json(&self) -> String {
        self.config.to_json()
    }

    fn __repr__(&self) -> String {
        format!(
            "AudioStream(driver='{}', sample_rate={}, buffer_size={}, in={}, out={}, state='{}')",
            self.driver,
            self.config.sample_rate,
            self.config.buffer_size,
            self.config.input_channels,
            self.config.output_channels,
            self.state()
        )
    }
}

impl Drop for PyAudioStream {
    fn drop(&mut self) {
        let Some(stream) = self.inner.get_mut().take() else {
            return;
        };
        if bridge::in_callback() {
            // the driver thread cannot join itself
            let closer = std::thread::Builder::new()
                .name("chuckpy-close".into())
                .spawn(move || drop(stream));
            if let Err(err) = closer {
                tracing::error!("cannot close audio stream from its callback: {err}");
            }
            return;
        }
        Python::with_gil(|py| {
            let processor = py.allow_threads(move || stream.close());
            drop(processor);
        });
    }
}

// ============ Diagnostics ============

#[pyfunction]
fn set_log_level(level: u64) {
    diagnostics::set_log_level(LogLevel::from_number(level));
}

#[pyfunction]
fn get_log_level() -> u8 {
    diagnostics::log_level().as_number()
}

// ============ Audio math ============

#[pyfunction]
fn nextpow2(n: u64) -> u64 {
    utils::next_pow2(n)
}

#[pyfunction]
fn ensurepow2(n: u64) -> u64 {
    utils::ensure_pow2(n)
}

#[pyfunction]
fn mtof(midi: f64) -> f64 {
    utils::mtof(midi)
}

#[pyfunction]
fn ftom(freq: f64) -> f64 {
    utils::ftom(freq)
}

#[pyfunction]
fn powtodb(power: f64) -> f64 {
    utils::powtodb(power)
}

#[pyfunction]
fn rmstodb(rms: f64) -> f64 {
    utils::rmstodb(rms)
}

#[pyfunction]
fn dbtopow(db: f64) -> f64 {
    utils::dbtopow(db)
}

#[pyfunction]
fn dbtorms(db: f64) -> f64 {
    utils::dbtorms(db)
}

// ============ Public registration hook ============

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAudioStream>()?;
    m.add_class::<SampleBlock>()?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(get_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(nextpow2, m)?)?;
    m.add_function(wrap_pyfunction!(ensurepow2, m)?)?;
    m.add_function(wrap_pyfunction!(mtof, m)?)?;
    m.add_function(wrap_pyfunction!(ftom, m)?)?;
    m.add_function(wrap_pyfunction!(powtodb, m)?)?;
    m.add_function(wrap_pyfunction!(rmstodb, m)?)?;
    m.add_function(wrap_pyfunction!(dbtopow, m)?)?;
    m.add_function(wrap_pyfunction!(dbtorms, m)?)?;
    for level in LogLevel::ALL {
        m.add(format!("LOG_{}", level.name()), level.as_number())?;
    }
    m.add("SAMPLE_FORMAT", SAMPLE_FORMAT)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
