use std::sync::atomic::{AtomicU64, Ordering};

use pyo3::prelude::*;

use crate::error::ProcessError;

/// Entry point into the interpreter for threads Python does not own.
///
/// Every [`enter`](Self::enter) acquires the GIL (registering the calling
/// thread with the interpreter the first time it is seen) and releases it
/// when the closure returns or unwinds. Acquiring while the GIL is already
/// held by the same thread is fine. The gate counts both sides so callers
/// can check the two stay balanced.
#[derive(Debug, Default)]
pub struct ExecutionGate {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Proof that the gate was entered. Counts the release on drop, unwinding
/// included.
struct Permit<'g> {
    gate: &'g ExecutionGate,
}

impl<'g> Permit<'g> {
    fn new(gate: &'g ExecutionGate) -> Self {
        gate.acquired.fetch_add(1, Ordering::AcqRel);
        Permit { gate }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.released.fetch_add(1, Ordering::AcqRel);
    }
}

impl ExecutionGate {
    pub const fn new() -> Self {
        ExecutionGate {
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Run `f` with the GIL held.
    ///
    /// Fails with [`ProcessError::RuntimeUnavailable`] if the interpreter was
    /// never initialized or has been finalized.
    pub fn enter<F, R>(&self, f: F) -> Result<R, ProcessError>
    where
        F: for<'py> FnOnce(Python<'py>) -> R,
    {
        if !runtime_available() {
            return Err(ProcessError::RuntimeUnavailable(
                "the Python interpreter is not initialized".to_string(),
            ));
        }
        Ok(Python::with_gil(|py| {
            let _permit = Permit::new(self);
            f(py)
        }))
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// No thread is inside [`enter`](Self::enter).
    pub fn is_balanced(&self) -> bool {
        self.acquired() == self.released()
    }
}

pub fn runtime_available() -> bool {
    // SAFETY: may be called at any time, with or without the GIL.
    unsafe { pyo3::ffi::Py_IsInitialized() != 0 }
}

/// Whether the calling thread holds the GIL right now.
pub fn gil_held() -> bool {
    // SAFETY: as above; only meaningful once the interpreter is up.
    runtime_available() && unsafe { pyo3::ffi::PyGILState_Check() != 0 }
}
