/// Non-owning views over driver sample memory
pub mod buffer;

/// The real-time callback bridge
pub mod bridge;

/// Stream configuration
pub mod config;

/// Leveled diagnostic channel
pub mod diagnostics;

/// Audio drivers
pub mod driver;

/// Error types
pub mod error;

/// Frame processors
pub mod processor;

/// Python bindings for maturin
pub mod python;

/// Audio stream lifecycle
pub mod stream;

/// Utilities
pub mod utils;

pub use bridge::{bridge_callback, Bridge, CallbackStatus, FailurePolicy};
pub use buffer::{AudioBuffer, Sample};
pub use config::StreamConfig;
pub use processor::FrameProcessor;
pub use stream::{AudioStream, StreamState};

use pyo3::prelude::*;

#[pymodule]
fn chuckpy(m: &Bound<'_, PyModule>) -> PyResult<()> {
    diagnostics::init_tracing();
    python::register(m)
}
