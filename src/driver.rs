use std::ffi::{c_ulong, c_void};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::bridge::{bridge_callback, Bridge, CallbackStatus, DriverCallback};
use crate::buffer::Sample;
use crate::config::{InputSignal, StreamConfig};
use crate::error::StreamError;

/// Timer-driven driver running on a dedicated thread
pub mod simulated;

/// Hardware output through cpal
#[cfg(feature = "cpal")]
pub mod cpal;

pub use simulated::SimulatedDriver;

/// The audio I/O collaborator that owns the driver thread.
///
/// A driver receives the stream's [`Bridge`] when it is opened and calls it
/// once per buffer period between `start` and `stop`. `close` drains any
/// in-flight period, ends the driver thread and hands the bridge back.
pub trait Driver: Send {
    fn name(&self) -> &'static str;

    /// Returns the sample rate the device actually runs at, which may differ
    /// from the requested one unless `force_sample_rate` is set.
    fn open(&mut self, config: &StreamConfig, bridge: Bridge) -> Result<u32, StreamError>;

    fn start(&mut self) -> Result<(), StreamError>;

    /// Returns once no period is in flight.
    fn stop(&mut self) -> Result<(), StreamError>;

    fn close(&mut self) -> Option<Bridge>;

    /// Set once the bridge asked for the stream to be halted.
    fn is_halted(&self) -> bool;

    /// The flag behind [`is_halted`](Self::is_halted), for observers that
    /// must not borrow the driver.
    fn halt_flag(&self) -> Arc<AtomicBool>;

    /// Output devices by index, as accepted by `StreamConfig::output_device`.
    fn devices(&self) -> Vec<String>;
}

/// Which driver a stream should be opened with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverKind {
    Simulated,
    #[cfg(feature = "cpal")]
    Cpal,
}

impl DriverKind {
    pub fn parse(name: &str) -> Option<DriverKind> {
        match name {
            "simulated" | "fake" => Some(DriverKind::Simulated),
            #[cfg(feature = "cpal")]
            "cpal" | "realtime" => Some(DriverKind::Cpal),
            _ => None,
        }
    }

    pub fn create(self) -> Box<dyn Driver> {
        match self {
            DriverKind::Simulated => Box::new(SimulatedDriver::new()),
            #[cfg(feature = "cpal")]
            DriverKind::Cpal => Box::new(cpal::CpalDriver::new()),
        }
    }
}

/// Buffers for one stream plus the bridge they are handed to. Runs whole
/// periods of exactly `buffer_size` frames through the raw callback.
pub(crate) struct PeriodRunner {
    bridge: Box<Bridge>,
    callback: DriverCallback,
    input: Vec<Sample>,
    output: Vec<Sample>,
    frames: usize,
    input_channels: usize,
    output_channels: usize,
    signal: InputSignal,
    rng: ChaCha8Rng,
    /// Read position into `output` for drivers whose blocks differ from the period.
    cursor: usize,
}

impl PeriodRunner {
    pub(crate) fn new(config: &StreamConfig, bridge: Bridge) -> PeriodRunner {
        let seed = match config.input_signal {
            InputSignal::Noise { seed, .. } => seed,
            InputSignal::Silence => 0,
        };
        let output = vec![0.0; config.output_len()];
        PeriodRunner {
            bridge: Box::new(bridge),
            callback: bridge_callback,
            input: vec![0.0; config.input_len()],
            cursor: output.len(),
            output,
            frames: config.buffer_size as usize,
            input_channels: config.input_channels as usize,
            output_channels: config.output_channels as usize,
            signal: config.input_signal,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Pre-fill, call the bridge, leave the result in `output`.
    pub(crate) fn run_period(&mut self) -> CallbackStatus {
        self.output.fill(0.0);
        match self.signal {
            InputSignal::Silence => self.input.fill(0.0),
            InputSignal::Noise { amplitude, .. } => {
                let amplitude = if amplitude.is_finite() { amplitude.abs() } else { 0.0 };
                for sample in self.input.iter_mut() {
                    *sample = self.rng.gen_range(-amplitude..=amplitude) as Sample;
                }
            }
        }
        let user_data = &mut *self.bridge as *mut Bridge as *mut c_void;
        // SAFETY: both vectors are sized for `frames` of their channel count,
        // are distinct, and are not touched until the call returns.
        let code = unsafe {
            (self.callback)(
                self.input.as_mut_ptr(),
                self.output.as_mut_ptr(),
                self.frames as c_ulong,
                self.input_channels as c_ulong,
                self.output_channels as c_ulong,
                user_data,
            )
        };
        self.cursor = 0;
        CallbackStatus::from_raw(code)
    }

    pub(crate) fn output(&self) -> &[Sample] {
        &self.output
    }

    /// Copy interleaved output into a device block of any length, running
    /// new periods as needed. Stops early and silences the rest on halt.
    #[cfg_attr(not(feature = "cpal"), allow(dead_code))]
    pub(crate) fn fill_block(&mut self, block: &mut [f32]) -> CallbackStatus {
        let mut written = 0;
        while written < block.len() {
            if self.cursor >= self.output.len() {
                if self.output.is_empty() || self.run_period() == CallbackStatus::Halt {
                    block[written..].fill(0.0);
                    return CallbackStatus::Halt;
                }
            }
            let n = (self.output.len() - self.cursor).min(block.len() - written);
            for (dst, src) in block[written..written + n]
                .iter_mut()
                .zip(&self.output[self.cursor..self.cursor + n])
            {
                *dst = *src as f32;
            }
            self.cursor += n;
            written += n;
        }
        CallbackStatus::Continue
    }

    pub(crate) fn into_bridge(self) -> Bridge {
        *self.bridge
    }
}

/// Ask the OS for real-time scheduling of the calling thread. Best effort:
/// refusal (no privileges) is logged and otherwise ignored.
pub(crate) fn apply_realtime_hint() {
    #[cfg(unix)]
    {
        // SAFETY: plain libc calls on the current thread.
        let result = unsafe {
            let mut param: libc::sched_param = std::mem::zeroed();
            param.sched_priority = 70;
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if result != 0 {
            tracing::debug!(errno = result, "real-time scheduling not granted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FailurePolicy;
    use crate::diagnostics::testing::RecordingDiagnostics;
    use crate::processor::process_fn;
    use std::sync::Arc;

    fn config(buffer_size: u32) -> StreamConfig {
        StreamConfig {
            buffer_size,
            input_channels: 1,
            output_channels: 2,
            ..StreamConfig::default()
        }
    }

    fn capture_inputs() -> (Bridge, crossbeam_channel::Receiver<Vec<Sample>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bridge = Bridge::new(
            process_fn(move |input, _| {
                tx.send(input.as_slice().to_vec()).ok();
                Ok(())
            }),
            Arc::new(RecordingDiagnostics::default()),
            FailurePolicy::Leave,
        );
        (bridge, rx)
    }

    #[test]
    fn noise_input_is_seeded_and_bounded() {
        let cfg = StreamConfig {
            input_signal: InputSignal::Noise { amplitude: 0.5, seed: 9 },
            ..config(64)
        };
        let (bridge, rx) = capture_inputs();
        PeriodRunner::new(&cfg, bridge).run_period();
        let first = rx.recv().unwrap();
        assert_eq!(first.len(), 64);
        assert!(first.iter().all(|s| s.abs() <= 0.5));
        assert!(first.iter().any(|s| *s != 0.0));

        let (bridge, rx) = capture_inputs();
        PeriodRunner::new(&cfg, bridge).run_period();
        assert_eq!(rx.recv().unwrap(), first);
    }

    #[test]
    fn device_blocks_are_served_from_whole_periods() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut counter = 0.0;
        let bridge = Bridge::new(
            process_fn(move |_, output| {
                tx.send(output.frames()).ok();
                counter += 1.0;
                output.fill(counter);
                Ok(())
            }),
            Arc::new(RecordingDiagnostics::default()),
            FailurePolicy::Leave,
        );
        let mut runner = PeriodRunner::new(&config(4), bridge);
        // one period is 4 frames x 2 channels = 8 samples
        let mut block = [0.0f32; 6];
        runner.fill_block(&mut block);
        assert_eq!(block, [1.0; 6]);
        runner.fill_block(&mut block);
        assert_eq!(block, [1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![4, 4]);
    }

    #[test]
    fn halt_silences_the_rest_of_the_block() {
        let bridge = Bridge::new(
            process_fn(|_, _| Err(crate::error::ProcessError::RuntimeUnavailable("gone".into()))),
            Arc::new(RecordingDiagnostics::default()),
            FailurePolicy::Leave,
        );
        let mut runner = PeriodRunner::new(&config(4), bridge);
        let mut block = [0.7f32; 8];
        assert_eq!(runner.fill_block(&mut block), CallbackStatus::Halt);
        assert_eq!(block, [0.0; 8]);
    }

    #[test]
    fn driver_names_parse() {
        assert_eq!(DriverKind::parse("simulated"), Some(DriverKind::Simulated));
        assert_eq!(DriverKind::parse("bogus"), None);
        assert_eq!(DriverKind::Simulated.create().name(), "simulated");
    }
}
