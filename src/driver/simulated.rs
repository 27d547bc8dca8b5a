use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::{apply_realtime_hint, Driver, PeriodRunner};
use crate::bridge::{Bridge, CallbackStatus};
use crate::buffer::Sample;
use crate::config::StreamConfig;
use crate::error::StreamError;

const NAME: &str = "simulated";

/// Receives every period's output once the bridge returns.
pub type OutputSink = Box<dyn FnMut(&[Sample]) + Send>;

enum Control {
    Start,
    Stop(Sender<()>),
    Close,
}

struct Worker {
    control: Sender<Control>,
    handle: JoinHandle<Bridge>,
}

/// A driver without hardware: a dedicated thread that runs one period per
/// buffer period (or back to back when the real-time hint is off) and hands
/// the output to an optional sink.
#[derive(Default)]
pub struct SimulatedDriver {
    sink: Option<OutputSink>,
    worker: Option<Worker>,
    halted: Arc<AtomicBool>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: impl FnMut(&[Sample]) + Send + 'static) -> Self {
        let mut driver = Self::default();
        driver.sink = Some(Box::new(sink));
        driver
    }

    fn worker(&self) -> Result<&Worker, StreamError> {
        self.worker
            .as_ref()
            .ok_or(StreamError::InvalidState("not open", "control driver"))
    }
}

impl Driver for SimulatedDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&mut self, config: &StreamConfig, bridge: Bridge) -> Result<u32, StreamError> {
        if self.worker.is_some() {
            return Err(StreamError::InvalidState("already open", "open"));
        }
        let (control, rx) = unbounded();
        let runner = PeriodRunner::new(config, bridge);
        let sink = self.sink.take();
        let halted = Arc::clone(&self.halted);
        halted.store(false, Ordering::SeqCst);
        let period = config.period();
        let paced = config.realtime_hint;

        let handle = thread::Builder::new()
            .name("chuckpy-audio".into())
            .spawn(move || run(runner, rx, sink, halted, period, paced))?;
        self.worker = Some(Worker { control, handle });
        tracing::debug!(driver = NAME, ?period, paced, "stream opened");
        Ok(config.sample_rate)
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.worker()?
            .control
            .send(Control::Start)
            .map_err(|_| StreamError::driver(NAME, "audio thread is gone"))
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        let (ack, done) = bounded(1);
        self.worker()?
            .control
            .send(Control::Stop(ack))
            .map_err(|_| StreamError::driver(NAME, "audio thread is gone"))?;
        done.recv()
            .map_err(|_| StreamError::driver(NAME, "audio thread exited while stopping"))
    }

    fn close(&mut self) -> Option<Bridge> {
        let worker = self.worker.take()?;
        let _ = worker.control.send(Control::Close);
        if worker.handle.thread().id() == thread::current().id() {
            tracing::error!(driver = NAME, "closed from its own audio thread, detaching it");
            return None;
        }
        match worker.handle.join() {
            Ok(bridge) => Some(bridge),
            Err(payload) => {
                tracing::error!(
                    driver = NAME,
                    "audio thread panicked: {}",
                    crate::bridge::panic_message(payload)
                );
                None
            }
        }
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn halt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.halted)
    }

    fn devices(&self) -> Vec<String> {
        vec!["simulated output".to_string()]
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.close();
    }
}

fn run(
    mut runner: PeriodRunner,
    control: Receiver<Control>,
    mut sink: Option<OutputSink>,
    halted: Arc<AtomicBool>,
    period: Duration,
    paced: bool,
) -> Bridge {
    if paced {
        apply_realtime_hint();
    }
    let mut running = false;
    let mut deadline = Instant::now();

    loop {
        let message = if !running {
            Some(control.recv().unwrap_or(Control::Close))
        } else if paced {
            match control.recv_deadline(deadline) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(Control::Close),
            }
        } else {
            match control.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Control::Close),
            }
        };

        match message {
            Some(Control::Start) => {
                if !halted.load(Ordering::SeqCst) {
                    running = true;
                    deadline = Instant::now();
                }
                continue;
            }
            Some(Control::Stop(ack)) => {
                running = false;
                let _ = ack.send(());
                continue;
            }
            Some(Control::Close) => break,
            None => {}
        }

        let status = runner.run_period();
        if let Some(sink) = sink.as_mut() {
            sink(runner.output());
        }
        if status == CallbackStatus::Halt {
            tracing::warn!(driver = NAME, "bridge requested halt, stopping stream");
            halted.store(true, Ordering::SeqCst);
            running = false;
            continue;
        }

        deadline += period;
        let now = Instant::now();
        if deadline + period < now {
            tracing::trace!(driver = NAME, "period overran, resynchronizing");
            deadline = now;
        }
    }

    runner.into_bridge()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FailurePolicy;
    use crate::config::SAMPLE_RATE_DEFAULT;
    use crate::diagnostics::testing::RecordingDiagnostics;
    use crate::error::ProcessError;
    use crate::processor::process_fn;

    fn unpaced(buffer_size: u32) -> StreamConfig {
        StreamConfig {
            buffer_size,
            realtime_hint: false,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn runs_periods_only_between_start_and_stop() {
        let (tx, rx) = bounded(1024);
        let mut driver = SimulatedDriver::with_sink(move |out: &[Sample]| {
            let _ = tx.try_send(out.to_vec());
        });
        let bridge = Bridge::new(
            process_fn(|_, out| {
                out.fill(0.5);
                Ok(())
            }),
            Arc::new(RecordingDiagnostics::default()),
            FailurePolicy::Leave,
        );
        let stats = bridge.stats();
        assert_eq!(driver.open(&unpaced(64), bridge).unwrap(), SAMPLE_RATE_DEFAULT);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.invocations(), 0, "no periods before start");

        driver.start().unwrap();
        let block = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(block.len(), 64 * 2);
        assert!(block.iter().all(|s| *s == 0.5));

        driver.stop().unwrap();
        let after_stop = stats.invocations();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.invocations(), after_stop, "no periods after stop returns");

        let bridge = driver.close().expect("bridge handed back");
        assert_eq!(bridge.stats().invocations(), after_stop);
        assert!(driver.close().is_none());
    }

    #[test]
    fn fatal_status_halts_the_stream() {
        let mut driver = SimulatedDriver::new();
        let bridge = Bridge::new(
            process_fn(|_, _| Err(ProcessError::RuntimeUnavailable("gone".into()))),
            Arc::new(RecordingDiagnostics::default()),
            FailurePolicy::Leave,
        );
        let stats = bridge.stats();
        driver.open(&unpaced(16), bridge).unwrap();
        driver.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !driver.is_halted() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(driver.is_halted());
        assert_eq!(stats.invocations(), 1);
        driver.close();
    }

    #[test]
    fn paced_driver_keeps_roughly_to_the_period() {
        let mut driver = SimulatedDriver::new();
        let bridge = Bridge::new(
            process_fn(|_, _| Ok(())),
            Arc::new(RecordingDiagnostics::default()),
            FailurePolicy::Leave,
        );
        let stats = bridge.stats();
        // 480 frames at 48 kHz is a 10 ms period
        let config = StreamConfig {
            sample_rate: 48_000,
            buffer_size: 480,
            realtime_hint: true,
            ..StreamConfig::default()
        };
        driver.open(&config, bridge).unwrap();
        driver.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        driver.stop().unwrap();
        let n = stats.invocations();
        assert!((2..=30).contains(&n), "{n} periods in 100ms");
        driver.close();
    }

    #[test]
    fn controlling_a_closed_driver_fails() {
        let mut driver = SimulatedDriver::new();
        assert!(matches!(driver.start(), Err(StreamError::InvalidState(..))));
        assert!(matches!(driver.stop(), Err(StreamError::InvalidState(..))));
        assert!(driver.close().is_none());
    }
}
