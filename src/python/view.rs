//! Zero-copy `memoryview`s over driver buffers.
//!
//! Driver memory reaches Python through [`SampleBlock`], a buffer exporter
//! that counts the views taken from it. The callback receives a `memoryview`
//! of the block. When the call ends, [`ViewLease`] releases that view and
//! closes the block: no new view can be taken from it, and a view that is
//! still alive (a slice, `memoryview(out)`, a NumPy array) is reported as
//! escaped. An escaped view still points at driver memory. It is reported,
//! not revoked.

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use pyo3::exceptions::PyBufferError;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyMemoryView;

use crate::buffer::{AudioBuffer, Sample};

#[cfg(not(feature = "double-samples"))]
const FORMAT: &CStr = c"f";
#[cfg(feature = "double-samples")]
const FORMAT: &CStr = c"d";

const ITEM_SIZE: ffi::Py_ssize_t = std::mem::size_of::<Sample>() as ffi::Py_ssize_t;

thread_local! {
    static OPEN_LEASES: Cell<usize> = const { Cell::new(0) };
}

/// Leases opened on the calling thread and not yet released.
pub fn open_leases() -> usize {
    OPEN_LEASES.with(Cell::get)
}

/// Exports one driver buffer to Python for the length of one callback.
#[pyclass(frozen, module = "chuckpy")]
pub struct SampleBlock {
    addr: usize,
    bytes: ffi::Py_ssize_t,
    ndim: c_int,
    shape: [ffi::Py_ssize_t; 2],
    strides: [ffi::Py_ssize_t; 2],
    readonly: bool,
    open: AtomicBool,
    exports: AtomicUsize,
}

impl SampleBlock {
    fn new(buffer: &AudioBuffer<'_>, readonly: bool) -> PyResult<SampleBlock> {
        let size = |n: usize| {
            ffi::Py_ssize_t::try_from(n)
                .map_err(|_| PyBufferError::new_err("buffer too large for a memoryview"))
        };
        let bytes = size(buffer.byte_len())?;
        // empty buffers stay flat
        let (ndim, shape, strides) = if buffer.is_empty() {
            (1, [0, 0], [ITEM_SIZE, 0])
        } else {
            let channels = size(buffer.channels())?;
            let shape = [size(buffer.frames())?, channels];
            (2, shape, [channels * ITEM_SIZE, ITEM_SIZE])
        };
        Ok(SampleBlock {
            addr: buffer.as_ptr() as usize,
            bytes,
            ndim,
            shape,
            strides,
            readonly,
            open: AtomicBool::new(true),
            exports: AtomicUsize::new(0),
        })
    }

    /// Refuse further exports. Returns how many are still alive.
    fn close(&self) -> usize {
        self.open.store(false, Ordering::Release);
        self.exports.load(Ordering::Acquire)
    }

    fn f_contiguous(&self) -> bool {
        self.ndim == 1 || self.shape[0] <= 1 || self.shape[1] <= 1
    }
}

#[pymethods]
impl SampleBlock {
    unsafe fn __getbuffer__(
        slf: Bound<'_, Self>,
        view: *mut ffi::Py_buffer,
        flags: c_int,
    ) -> PyResult<()> {
        if view.is_null() {
            return Err(PyBufferError::new_err("view is null"));
        }
        let block = slf.get();
        if !block.open.load(Ordering::Acquire) {
            return Err(PyBufferError::new_err(
                "audio buffers are only valid during the callback",
            ));
        }
        if flags & ffi::PyBUF_WRITABLE == ffi::PyBUF_WRITABLE && block.readonly {
            return Err(PyBufferError::new_err("the input buffer is read-only"));
        }
        if flags & ffi::PyBUF_F_CONTIGUOUS == ffi::PyBUF_F_CONTIGUOUS && !block.f_contiguous() {
            return Err(PyBufferError::new_err("audio buffers are C-contiguous"));
        }

        (*view).obj = slf.clone().into_any().into_ptr();
        (*view).buf = block.addr as *mut c_void;
        (*view).len = block.bytes;
        (*view).readonly = c_int::from(block.readonly);
        (*view).itemsize = ITEM_SIZE;
        (*view).format = if flags & ffi::PyBUF_FORMAT == ffi::PyBUF_FORMAT {
            FORMAT.as_ptr() as *mut c_char
        } else {
            ptr::null_mut()
        };
        if flags & ffi::PyBUF_ND == ffi::PyBUF_ND {
            (*view).ndim = block.ndim;
            (*view).shape = block.shape.as_ptr() as *mut ffi::Py_ssize_t;
        } else {
            (*view).ndim = 1;
            (*view).shape = ptr::null_mut();
        }
        (*view).strides = if flags & ffi::PyBUF_STRIDES == ffi::PyBUF_STRIDES {
            block.strides.as_ptr() as *mut ffi::Py_ssize_t
        } else {
            ptr::null_mut()
        };
        (*view).suboffsets = ptr::null_mut();
        (*view).internal = ptr::null_mut();

        block.exports.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    unsafe fn __releasebuffer__(&self, _view: *mut ffi::Py_buffer) {
        self.exports.fetch_sub(1, Ordering::AcqRel);
    }

    #[getter]
    fn readonly(&self) -> bool {
        self.readonly
    }
}

/// What happened when a lease gave its view back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseOutcome {
    Released,
    /// User code still holds a view of the buffer (a slice, an export, a
    /// NumPy array made from it) after the callback returned.
    Escaped(String),
}

/// A view over one buffer, released on every exit path.
pub struct ViewLease<'py, 'buf> {
    block: Option<Bound<'py, SampleBlock>>,
    view: Option<Bound<'py, PyAny>>,
    _buffer: PhantomData<&'buf mut ()>,
}

impl<'py, 'buf> ViewLease<'py, 'buf> {
    pub fn view(&self) -> Option<&Bound<'py, PyAny>> {
        self.view.as_ref()
    }

    pub fn release(mut self) -> LeaseOutcome {
        self.release_views()
    }

    fn release_views(&mut self) -> LeaseOutcome {
        let Some(block) = self.block.take() else {
            return LeaseOutcome::Released;
        };
        OPEN_LEASES.with(|n| n.set(n.get().saturating_sub(1)));

        let mut outcome = LeaseOutcome::Released;
        if let Some(view) = self.view.take() {
            if let Err(err) = view.call_method0("release") {
                outcome = LeaseOutcome::Escaped(err.to_string());
            }
        }
        let alive = block.get().close();
        if alive > 0 && outcome == LeaseOutcome::Released {
            outcome = LeaseOutcome::Escaped(format!("{alive} view(s) still alive"));
        }
        outcome
    }
}

impl Drop for ViewLease<'_, '_> {
    fn drop(&mut self) {
        if let LeaseOutcome::Escaped(reason) = self.release_views() {
            tracing::warn!("buffer view escaped the callback: {reason}");
        }
    }
}

/// A read-only `(frames, channels)` view of `buffer`.
pub fn adapt<'py, 'buf>(
    py: Python<'py>,
    buffer: &'buf AudioBuffer<'_>,
) -> PyResult<ViewLease<'py, 'buf>> {
    lease(py, buffer, true)
}

/// A writable `(frames, channels)` view of `buffer`.
pub fn adapt_mut<'py, 'buf>(
    py: Python<'py>,
    buffer: &'buf mut AudioBuffer<'_>,
) -> PyResult<ViewLease<'py, 'buf>> {
    lease(py, buffer, false)
}

/// The block exports `buffer`'s memory until the lease closes it, which
/// happens before `'buf` ends.
fn lease<'py, 'buf>(
    py: Python<'py>,
    buffer: &AudioBuffer<'_>,
    readonly: bool,
) -> PyResult<ViewLease<'py, 'buf>> {
    let block = Bound::new(py, SampleBlock::new(buffer, readonly)?)?;
    let view = match PyMemoryView::from(block.as_any()) {
        Ok(view) => view,
        Err(err) => {
            block.get().close();
            return Err(err);
        }
    };
    OPEN_LEASES.with(|n| n.set(n.get() + 1));
    Ok(ViewLease {
        block: Some(block),
        view: Some(view.into_any()),
        _buffer: PhantomData,
    })
}
