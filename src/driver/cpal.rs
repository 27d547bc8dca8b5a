use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::{apply_realtime_hint, Driver, PeriodRunner};
use crate::bridge::{Bridge, CallbackStatus};
use crate::config::StreamConfig;
use crate::error::StreamError;

const NAME: &str = "cpal";

type Reply = Sender<Result<(), StreamError>>;

enum Control {
    Start(Reply),
    Stop(Reply),
    Close,
}

struct Worker {
    control: Sender<Control>,
    handle: JoinHandle<Option<Bridge>>,
}

/// Output through the host's audio system. The device pulls blocks of its
/// own size; they are served from whole periods of `buffer_size` frames.
/// Input channels carry the configured input signal, not captured audio.
#[derive(Default)]
pub struct CpalDriver {
    worker: Option<Worker>,
    halted: Arc<AtomicBool>,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(&self, message: impl FnOnce(Reply) -> Control) -> Result<(), StreamError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or(StreamError::InvalidState("not open", "control driver"))?;
        let (reply, result) = bounded(1);
        worker
            .control
            .send(message(reply))
            .map_err(|_| StreamError::driver(NAME, "control thread is gone"))?;
        result
            .recv()
            .map_err(|_| StreamError::driver(NAME, "control thread exited"))?
    }
}

fn output_device(host: &cpal::Host, index: Option<usize>) -> Result<cpal::Device, StreamError> {
    match index {
        None => host
            .default_output_device()
            .ok_or_else(|| StreamError::driver(NAME, "no default output device")),
        Some(index) => host
            .output_devices()
            .map_err(|err| StreamError::driver(NAME, err))?
            .nth(index)
            .ok_or_else(|| StreamError::driver(NAME, format!("no output device #{index}"))),
    }
}

/// The stream and the sample rate it was built with.
fn build_stream(
    config: &StreamConfig,
    runner: Arc<Mutex<Option<PeriodRunner>>>,
    halted: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), StreamError> {
    let host = cpal::default_host();
    let device = output_device(&host, config.output_device)?;

    let mut stream_config = cpal::StreamConfig {
        channels: config.output_channels as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let supports = |cfg: &cpal::StreamConfig| -> bool {
        device
            .supported_output_configs()
            .map(|mut ranges| {
                ranges.any(|range| {
                    range.channels() == cfg.channels
                        && range.min_sample_rate() <= cfg.sample_rate
                        && range.max_sample_rate() >= cfg.sample_rate
                })
            })
            .unwrap_or(false)
    };
    if !supports(&stream_config) {
        if config.force_sample_rate {
            return Err(StreamError::driver(
                NAME,
                format!("device does not support {} Hz", config.sample_rate),
            ));
        }
        let fallback = device
            .default_output_config()
            .map_err(|err| StreamError::driver(NAME, err))?;
        tracing::warn!(
            requested = config.sample_rate,
            using = fallback.sample_rate().0,
            "sample rate not supported by device, falling back"
        );
        stream_config.sample_rate = fallback.sample_rate();
    }

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Some(mut guard) = runner.try_lock() else {
                    data.fill(0.0);
                    return;
                };
                let Some(runner) = guard.as_mut() else {
                    data.fill(0.0);
                    return;
                };
                if halted.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                if runner.fill_block(data) == CallbackStatus::Halt {
                    tracing::warn!(driver = NAME, "bridge requested halt, silencing stream");
                    halted.store(true, Ordering::Relaxed);
                }
            },
            |err| tracing::error!(driver = NAME, "cpal stream error: {err}"),
            None,
        )
        .map_err(|err| StreamError::driver(NAME, err))?;
    Ok((stream, stream_config.sample_rate.0))
}

/// Owns the stream, which may not leave the thread that built it.
fn control_loop(
    stream: cpal::Stream,
    runner: Arc<Mutex<Option<PeriodRunner>>>,
    control: Receiver<Control>,
) -> Option<Bridge> {
    for message in control.iter() {
        match message {
            Control::Start(reply) => {
                let _ = reply.send(stream.play().map_err(|err| StreamError::driver(NAME, err)));
            }
            Control::Stop(reply) => {
                let result = stream.pause().map_err(|err| StreamError::driver(NAME, err));
                // wait out a callback that is already running
                drop(runner.lock());
                let _ = reply.send(result);
            }
            Control::Close => break,
        }
    }
    drop(stream);
    let bridge = runner.lock().take().map(PeriodRunner::into_bridge);
    bridge
}

impl Driver for CpalDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&mut self, config: &StreamConfig, bridge: Bridge) -> Result<u32, StreamError> {
        if self.worker.is_some() {
            return Err(StreamError::InvalidState("already open", "open"));
        }
        self.halted.store(false, Ordering::SeqCst);
        let runner = Arc::new(Mutex::new(Some(PeriodRunner::new(config, bridge))));
        let (control, rx) = unbounded();
        let (opened, opened_rx) = bounded(1);
        let config = config.clone();
        let halted = Arc::clone(&self.halted);

        let handle = thread::Builder::new()
            .name("chuckpy-cpal".into())
            .spawn(move || {
                if config.realtime_hint {
                    apply_realtime_hint();
                }
                match build_stream(&config, Arc::clone(&runner), halted) {
                    Ok((stream, sample_rate)) => {
                        let _ = opened.send(Ok(sample_rate));
                        control_loop(stream, runner, rx)
                    }
                    Err(err) => {
                        let _ = opened.send(Err(err));
                        let bridge = runner.lock().take().map(PeriodRunner::into_bridge);
                        bridge
                    }
                }
            })?;

        let result = opened_rx
            .recv()
            .unwrap_or_else(|_| Err(StreamError::driver(NAME, "control thread exited")));
        match result {
            Ok(sample_rate) => {
                self.worker = Some(Worker { control, handle });
                tracing::debug!(driver = NAME, sample_rate, "stream opened");
                Ok(sample_rate)
            }
            Err(err) => {
                let _ = handle.join();
                Err(err)
            }
        }
    }

    fn start(&mut self) -> Result<(), StreamError> {
        self.request(Control::Start)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.request(Control::Stop)
    }

    fn close(&mut self) -> Option<Bridge> {
        let worker = self.worker.take()?;
        let _ = worker.control.send(Control::Close);
        match worker.handle.join() {
            Ok(bridge) => bridge,
            Err(payload) => {
                tracing::error!(
                    driver = NAME,
                    "control thread panicked: {}",
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
        cpal::default_host()
            .output_devices()
            .map(|devices| {
                devices
                    .map(|device| device.name().unwrap_or_else(|_| "Unknown".to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.close();
    }
}
