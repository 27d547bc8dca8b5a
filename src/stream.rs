use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::bridge::{self, Bridge, BridgeStats, StatsSnapshot};
use crate::config::StreamConfig;
use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::driver::Driver;
use crate::error::StreamError;
use crate::processor::FrameProcessor;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Initialized,
    Running,
    Stopped,
    /// The bridge reported a fatal error; the driver no longer calls it.
    Halted,
    Closed,
}

impl StreamState {
    const ALL: [StreamState; 5] = [
        StreamState::Initialized,
        StreamState::Running,
        StreamState::Stopped,
        StreamState::Halted,
        StreamState::Closed,
    ];

    fn from_u8(raw: u8) -> StreamState {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(StreamState::Closed)
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamState::Initialized => "initialized",
            StreamState::Running => "running",
            StreamState::Stopped => "stopped",
            StreamState::Halted => "halted",
            StreamState::Closed => "closed",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reads a stream's state without borrowing the stream, so it can be
/// polled from any thread, including while `stop` waits for the driver.
#[derive(Clone, Debug)]
pub struct StateMonitor {
    state: Arc<AtomicU8>,
    halted: Arc<AtomicBool>,
}

impl StateMonitor {
    fn new(halted: Arc<AtomicBool>) -> StateMonitor {
        StateMonitor {
            state: Arc::new(AtomicU8::new(StreamState::Initialized as u8)),
            halted,
        }
    }

    fn set(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The last state set by the stream, ignoring the halt flag.
    fn recorded(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn state(&self) -> StreamState {
        match self.recorded() {
            StreamState::Running if self.halted.load(Ordering::Acquire) => StreamState::Halted,
            state => state,
        }
    }
}

/// One audio stream: its configuration, the driver running it and, through
/// the driver, the bridge holding the stream's processor.
///
/// The processor is only ever invoked between [`start`](Self::start) and
/// [`stop`](Self::stop)/[`shutdown`](Self::shutdown). Shutting down joins the
/// driver thread before the processor (and whatever callback it holds) is
/// dropped. None of the control methods may be called from the processor
/// itself; they fail with [`StreamError::InCallback`] there.
pub struct AudioStream {
    config: StreamConfig,
    driver: Box<dyn Driver>,
    monitor: StateMonitor,
    stats: Arc<BridgeStats>,
}

impl AudioStream {
    /// Validate `config` (rounding the buffer size up to a power of two) and
    /// open `driver` with a bridge around `processor`. Diagnostics go to
    /// `tracing`. The stream's config carries the sample rate the driver
    /// settled on.
    pub fn initialize(
        config: &StreamConfig,
        processor: impl FrameProcessor + 'static,
        driver: Box<dyn Driver>,
    ) -> Result<AudioStream, StreamError> {
        let diagnostics = Arc::new(TracingDiagnostics);
        Self::initialize_with(config, Box::new(processor), driver, diagnostics)
    }

    pub fn initialize_with(
        config: &StreamConfig,
        processor: Box<dyn FrameProcessor>,
        mut driver: Box<dyn Driver>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<AudioStream, StreamError> {
        let mut config = config.normalized()?;
        let bridge = Bridge::from_boxed(processor, diagnostics, config.on_callback_error);
        let stats = bridge.stats();
        let sample_rate = driver.open(&config, bridge)?;
        if sample_rate != config.sample_rate {
            tracing::warn!(
                driver = driver.name(),
                requested = config.sample_rate,
                actual = sample_rate,
                "driver runs at a different sample rate"
            );
            config.sample_rate = sample_rate;
        }
        tracing::info!(
            driver = driver.name(),
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            input_channels = config.input_channels,
            output_channels = config.output_channels,
            "audio stream initialized"
        );
        let monitor = StateMonitor::new(driver.halt_flag());
        Ok(AudioStream {
            config,
            driver,
            monitor,
            stats,
        })
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        if bridge::in_callback() {
            return Err(StreamError::InCallback("start"));
        }
        match self.state() {
            StreamState::Running => Ok(()),
            StreamState::Initialized | StreamState::Stopped => {
                self.driver.start()?;
                self.monitor.set(StreamState::Running);
                Ok(())
            }
            state => Err(StreamError::InvalidState(state.name(), "start")),
        }
    }

    /// Returns once no period is in flight. Stopping a halted stream is
    /// allowed and leaves it halted.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        if bridge::in_callback() {
            return Err(StreamError::InCallback("stop"));
        }
        match self.state() {
            StreamState::Initialized | StreamState::Stopped => Ok(()),
            StreamState::Running => {
                self.driver.stop()?;
                self.monitor.set(StreamState::Stopped);
                Ok(())
            }
            StreamState::Halted => {
                self.driver.stop()?;
                Ok(())
            }
            StreamState::Closed => Err(StreamError::InvalidState("closed", "stop")),
        }
    }

    /// Stop the driver, join its thread and drop the processor. Idempotent.
    ///
    /// From inside the processor this only logs an error: the driver thread
    /// cannot join itself.
    pub fn shutdown(&mut self) {
        if let Some(bridge) = self.close_driver() {
            drop(bridge);
            tracing::info!(
                driver = self.driver.name(),
                stats = ?self.stats.snapshot(),
                "audio stream closed"
            );
        }
    }

    /// Like [`shutdown`](Self::shutdown), but hands the processor back.
    pub fn close(mut self) -> Option<Box<dyn FrameProcessor>> {
        self.close_driver().map(Bridge::into_processor)
    }

    fn close_driver(&mut self) -> Option<Bridge> {
        if self.monitor.recorded() == StreamState::Closed {
            return None;
        }
        if bridge::in_callback() {
            tracing::error!("{}", StreamError::InCallback("shut down"));
            return None;
        }
        let bridge = self.driver.close();
        self.monitor.set(StreamState::Closed);
        bridge
    }

    pub fn state(&self) -> StreamState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> StateMonitor {
        self.monitor.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    pub fn is_halted(&self) -> bool {
        self.driver.is_halted()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shared_stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("driver", &self.driver.name())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Sample;
    use crate::diagnostics::testing::RecordingDiagnostics;
    use crate::driver::SimulatedDriver;
    use crate::error::{ConfigError, ProcessError};
    use crate::processor::process_fn;
    use std::time::{Duration, Instant};

    fn quick(buffer_size: u32) -> StreamConfig {
        StreamConfig {
            buffer_size,
            realtime_hint: false,
            ..StreamConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn lifecycle_transitions() {
        let mut stream = AudioStream::initialize(
            &quick(64),
            process_fn(|_, _| Ok(())),
            Box::new(SimulatedDriver::new()),
        )
        .unwrap();
        assert_eq!(stream.state(), StreamState::Initialized);
        stream.start().unwrap();
        assert!(stream.is_running());
        assert!(wait_for(|| stream.stats().invocations > 0));
        stream.stop().unwrap();
        assert_eq!(stream.state(), StreamState::Stopped);
        stream.start().unwrap();
        stream.stop().unwrap();
        stream.shutdown();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(matches!(stream.start(), Err(StreamError::InvalidState("closed", "start"))));
        stream.shutdown();
    }

    #[test]
    fn processor_sees_rounded_buffer_size() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut stream = AudioStream::initialize(
            &quick(300),
            process_fn(move |_, out| {
                tx.send(out.frames()).ok();
                Ok(())
            }),
            Box::new(SimulatedDriver::new()),
        )
        .unwrap();
        assert_eq!(stream.config().buffer_size, 512);
        stream.start().unwrap();
        let frames = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        stream.shutdown();
        assert_eq!(frames, 512);
        assert!(rx.try_iter().all(|n| n == 512));
    }

    #[test]
    fn invalid_config_never_opens_the_driver() {
        let err = AudioStream::initialize(
            &StreamConfig {
                output_channels: 0,
                ..quick(64)
            },
            process_fn(|_, _| Ok(())),
            Box::new(SimulatedDriver::new()),
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Config(ConfigError::NoOutputChannels)));
    }

    #[test]
    fn fatal_error_halts_and_stop_still_works() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let mut stream = AudioStream::initialize_with(
            &quick(32),
            Box::new(process_fn(|_, _| {
                Err(ProcessError::RuntimeUnavailable("finalized".into()))
            })),
            Box::new(SimulatedDriver::new()),
            diagnostics.clone(),
        )
        .unwrap();
        stream.start().unwrap();
        assert!(wait_for(|| stream.is_halted()));
        assert_eq!(stream.state(), StreamState::Halted);
        assert!(matches!(stream.start(), Err(StreamError::InvalidState("halted", "start"))));
        stream.stop().unwrap();
        assert_eq!(stream.stats().invocations, 1);
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn monitor_follows_the_stream_without_borrowing_it() {
        let mut stream = AudioStream::initialize(
            &quick(32),
            process_fn(|_, _| Ok(())),
            Box::new(SimulatedDriver::new()),
        )
        .unwrap();
        let monitor = stream.monitor();
        assert_eq!(monitor.state(), StreamState::Initialized);
        stream.start().unwrap();
        assert_eq!(monitor.state(), StreamState::Running);
        stream.stop().unwrap();
        assert_eq!(monitor.state(), StreamState::Stopped);
        drop(stream);
        assert_eq!(monitor.state(), StreamState::Closed);
    }

    #[test]
    fn control_from_inside_a_processor_is_refused() {
        let other = Arc::new(parking_lot::Mutex::new(
            AudioStream::initialize(
                &quick(32),
                process_fn(|_, _| Ok(())),
                Box::new(SimulatedDriver::new()),
            )
            .unwrap(),
        ));
        let (tx, rx) = crossbeam_channel::unbounded();
        let target = Arc::clone(&other);
        let mut stream = AudioStream::initialize(
            &quick(32),
            process_fn(move |_, _| {
                if let Some(mut other) = target.try_lock() {
                    tx.send((other.start().err(), other.stop().err())).ok();
                    other.shutdown();
                }
                Ok(())
            }),
            Box::new(SimulatedDriver::new()),
        )
        .unwrap();
        stream.start().unwrap();
        let (start, stop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        stream.shutdown();
        assert!(matches!(start, Some(StreamError::InCallback("start"))));
        assert!(matches!(stop, Some(StreamError::InCallback("stop"))));
        assert_eq!(other.lock().state(), StreamState::Initialized, "shutdown was refused");
    }

    /// Opens like the simulated driver but reports a device rate of its own.
    struct FixedRateDriver(SimulatedDriver, u32);

    impl Driver for FixedRateDriver {
        fn name(&self) -> &'static str {
            "fixed-rate"
        }

        fn open(&mut self, config: &StreamConfig, bridge: Bridge) -> Result<u32, StreamError> {
            self.0.open(config, bridge)?;
            Ok(self.1)
        }

        fn start(&mut self) -> Result<(), StreamError> {
            self.0.start()
        }

        fn stop(&mut self) -> Result<(), StreamError> {
            self.0.stop()
        }

        fn close(&mut self) -> Option<Bridge> {
            self.0.close()
        }

        fn is_halted(&self) -> bool {
            self.0.is_halted()
        }

        fn halt_flag(&self) -> Arc<AtomicBool> {
            self.0.halt_flag()
        }

        fn devices(&self) -> Vec<String> {
            self.0.devices()
        }
    }

    #[test]
    fn config_reports_the_rate_the_driver_settled_on() {
        let requested = StreamConfig {
            sample_rate: 96_000,
            ..quick(64)
        };
        let stream = AudioStream::initialize(
            &requested,
            process_fn(|_, _| Ok(())),
            Box::new(FixedRateDriver(SimulatedDriver::new(), 44_100)),
        )
        .unwrap();
        assert_eq!(stream.config().sample_rate, 44_100);
        assert_eq!(stream.config().buffer_size, 64);
    }

    #[test]
    fn close_returns_the_processor_after_the_thread_is_gone() {
        let mut stream = AudioStream::initialize(
            &quick(16),
            process_fn(|_, out| {
                out.fill(0.25 as Sample);
                Ok(())
            }),
            Box::new(SimulatedDriver::new()),
        )
        .unwrap();
        stream.start().unwrap();
        assert!(wait_for(|| stream.stats().invocations >= 3));
        let stats = stream.shared_stats();
        let mut processor = stream.close().expect("processor handed back");
        let after = stats.invocations();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(stats.invocations(), after);

        let mut input: Vec<Sample> = vec![];
        let mut output: Vec<Sample> = vec![0.0; 4];
        let input = crate::buffer::AudioBuffer::from_slice(&mut input, 0);
        let mut out = crate::buffer::AudioBuffer::from_slice(&mut output, 2);
        processor.process(&input, &mut out).unwrap();
        assert_eq!(output, vec![0.25; 4]);
    }
}
