/// GIL entry for driver threads
pub mod gil;

/// Zero-copy buffer views
pub mod view;

/// Python callables as frame processors
pub mod callback;

/// Classes and functions of the `chuckpy` module
pub mod module;

pub use callback::PyCallbackProcessor;
pub use gil::ExecutionGate;
pub use module::register;
