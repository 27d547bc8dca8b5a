//! The real-time callback bridge.
//!
//! A native driver thread hands raw interleaved buffers to [`bridge_callback`]
//! once per buffer period. The bridge wraps them, runs the stream's
//! [`FrameProcessor`] and turns every failure (processor error or Rust panic)
//! into a diagnostic plus a status code. Nothing unwinds into the driver.
//!
//! Callback errors degrade the affected period to whatever the driver
//! pre-filled the output with (normally silence), or to forced silence under
//! [`FailurePolicy::Silence`]. Only a fatal error, the managed runtime being
//! gone, asks the driver to halt the stream.
//!
//! No timeout is imposed on the processor: a slow callback shows up as an
//! audible underrun, not as a crash.

use std::any::Any;
use std::cell::Cell;
use std::ffi::{c_int, c_ulong, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{AudioBuffer, Sample};
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::error::ProcessError;
use crate::processor::FrameProcessor;

/// Raw driver callback signature:
/// `(input, output, frames, in_channels, out_channels, user_data) -> status`.
pub type DriverCallback = unsafe extern "C" fn(
    *mut Sample,
    *mut Sample,
    c_ulong,
    c_ulong,
    c_ulong,
    *mut c_void,
) -> c_int;

/// What the driver should do after a callback returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CallbackStatus {
    Continue = 0,
    Halt = 1,
}

impl CallbackStatus {
    pub fn from_raw(code: c_int) -> CallbackStatus {
        if code == CallbackStatus::Continue as c_int {
            CallbackStatus::Continue
        } else {
            CallbackStatus::Halt
        }
    }
}

/// Output produced for a period whose callback failed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave the output as the driver pre-filled it (and as far as the
    /// callback got before failing).
    #[default]
    Leave,
    /// Overwrite the output with silence.
    Silence,
}

/// Counters shared between the driver thread and observers.
#[derive(Debug, Default)]
pub struct BridgeStats {
    invocations: AtomicU64,
    failures: AtomicU64,
    panics: AtomicU64,
}

impl BridgeStats {
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Periods that produced no output from the processor, panics included.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            invocations: self.invocations(),
            failures: self.failures(),
            panics: self.panics(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub invocations: u64,
    pub failures: u64,
    pub panics: u64,
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is running a processor for some bridge.
///
/// Stream control that waits for the driver thread (stop, shutdown) must not
/// be attempted from there: the driver would be waiting on itself.
pub fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// Marks the current thread as inside a callback until dropped.
struct CallbackScope {
    outer: bool,
}

impl CallbackScope {
    fn enter() -> CallbackScope {
        CallbackScope {
            outer: IN_CALLBACK.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(self.outer));
    }
}

pub struct Bridge {
    processor: Box<dyn FrameProcessor>,
    diagnostics: Arc<dyn Diagnostics>,
    policy: FailurePolicy,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    pub fn new(
        processor: impl FrameProcessor + 'static,
        diagnostics: Arc<dyn Diagnostics>,
        policy: FailurePolicy,
    ) -> Bridge {
        Bridge::from_boxed(Box::new(processor), diagnostics, policy)
    }

    pub fn from_boxed(
        processor: Box<dyn FrameProcessor>,
        diagnostics: Arc<dyn Diagnostics>,
        policy: FailurePolicy,
    ) -> Bridge {
        Bridge {
            processor,
            diagnostics,
            policy,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Give the processor back, e.g. to release the callback it holds.
    pub fn into_processor(self) -> Box<dyn FrameProcessor> {
        self.processor
    }

    /// Run the processor for one period.
    pub fn invoke(
        &mut self,
        input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
    ) -> CallbackStatus {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);

        let processor = &mut self.processor;
        let result = {
            let _scope = CallbackScope::enter();
            catch_unwind(AssertUnwindSafe(|| processor.process(input, &mut *output)))
        };

        match result {
            Ok(Ok(())) => CallbackStatus::Continue,
            Ok(Err(err)) => self.fail(&err, output),
            Err(payload) => {
                self.stats.panics.fetch_add(1, Ordering::Relaxed);
                let err = ProcessError::Callback(format!("panic: {}", panic_message(payload)));
                self.fail(&err, output)
            }
        }
    }

    fn fail(&self, err: &ProcessError, output: &mut AudioBuffer<'_>) -> CallbackStatus {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        if self.policy == FailurePolicy::Silence {
            output.fill(0.0);
        }
        if err.is_fatal() {
            self.diagnostics
                .report(LogLevel::Core, &format!("halting audio stream: {err}"));
            CallbackStatus::Halt
        } else {
            self.diagnostics
                .report(LogLevel::Severe, &format!("audio callback failed: {err}"));
            CallbackStatus::Continue
        }
    }

    /// Arguments could not be turned into buffers at all.
    fn reject(&self, message: String) -> CallbackStatus {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        let err = ProcessError::Marshal(message);
        self.diagnostics
            .report(LogLevel::Severe, &format!("audio callback failed: {err}"));
        CallbackStatus::Continue
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("policy", &self.policy)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Extract a human-readable message from a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// Driver-facing entry point. `user_data` is the stream's `*mut Bridge`.
///
/// Returns `0` to keep the stream running and `1` when it must be halted.
///
/// # Safety
///
/// * `user_data` is null or points to a [`Bridge`] that no other thread uses
///   for the duration of the call.
/// * `input` and `output` each point to `frames × channels` samples that stay
///   valid, and are not accessed elsewhere, until the call returns. The two
///   regions must not overlap. Either may be null when its length is zero.
pub unsafe extern "C" fn bridge_callback(
    input: *mut Sample,
    output: *mut Sample,
    frames: c_ulong,
    in_channels: c_ulong,
    out_channels: c_ulong,
    user_data: *mut c_void,
) -> c_int {
    let Some(bridge) = (user_data as *mut Bridge).as_mut() else {
        return CallbackStatus::Halt as c_int;
    };
    let frames = frames as usize;
    let (in_channels, out_channels) = (in_channels as usize, out_channels as usize);

    let Some(input) = AudioBuffer::from_raw_parts(input, frames, in_channels) else {
        let message = format!("invalid input buffer ({frames} x {in_channels})");
        return bridge.reject(message) as c_int;
    };
    let Some(mut output) = AudioBuffer::from_raw_parts(output, frames, out_channels) else {
        let message = format!("invalid output buffer ({frames} x {out_channels})");
        return bridge.reject(message) as c_int;
    };

    bridge.invoke(&input, &mut output) as c_int
}
