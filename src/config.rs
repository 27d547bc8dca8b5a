use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::FailurePolicy;
use crate::error::ConfigError;
use crate::utils::{ensure_pow2, is_pow2};

pub const MAX_CHANNELS: u32 = 256;
pub const NUM_CHANNELS_DEFAULT: u32 = 2;
pub const NUM_BUFFERS_DEFAULT: u32 = 8;

#[cfg(target_os = "linux")]
pub const SAMPLE_RATE_DEFAULT: u32 = 48_000;
#[cfg(not(target_os = "linux"))]
pub const SAMPLE_RATE_DEFAULT: u32 = 44_100;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub const BUFFER_SIZE_DEFAULT: u32 = 256;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub const BUFFER_SIZE_DEFAULT: u32 = 512;

/// Where the simulated driver takes its input samples from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSignal {
    #[default]
    Silence,
    /// Uniform white noise in `[-amplitude, amplitude]`.
    Noise { amplitude: f32, seed: u64 },
}

/// Everything needed to open an audio stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    /// Frames per period. Rounded up to a power of two by [`normalized`](Self::normalized).
    pub buffer_size: u32,
    pub num_buffers: u32,
    /// Pace the driver to the buffer period and ask for real-time scheduling.
    pub realtime_hint: bool,
    /// Device index; `None` picks the system default.
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    /// Refuse to fall back to the device's own rate.
    pub force_sample_rate: bool,
    pub on_callback_error: FailurePolicy,
    pub input_signal: InputSignal,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            sample_rate: SAMPLE_RATE_DEFAULT,
            input_channels: NUM_CHANNELS_DEFAULT,
            output_channels: NUM_CHANNELS_DEFAULT,
            buffer_size: BUFFER_SIZE_DEFAULT,
            num_buffers: NUM_BUFFERS_DEFAULT,
            realtime_hint: true,
            input_device: None,
            output_device: None,
            force_sample_rate: false,
            on_callback_error: FailurePolicy::Leave,
            input_signal: InputSignal::Silence,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Check everything except the power-of-two rule, which
    /// [`normalized`](Self::normalized) fixes up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.num_buffers == 0 {
            return Err(ConfigError::ZeroBufferCount);
        }
        if self.output_channels == 0 {
            return Err(ConfigError::NoOutputChannels);
        }
        for (which, count) in [("input", self.input_channels), ("output", self.output_channels)] {
            if count > MAX_CHANNELS {
                return Err(ConfigError::TooManyChannels {
                    which,
                    count,
                    max: MAX_CHANNELS,
                });
            }
        }
        Ok(())
    }

    /// Validate and round the buffer size up to a power of two.
    pub fn normalized(&self) -> Result<StreamConfig, ConfigError> {
        self.validate()?;
        let mut config = self.clone();
        if !is_pow2(u64::from(config.buffer_size)) {
            let rounded = ensure_pow2(u64::from(config.buffer_size));
            let rounded =
                u32::try_from(rounded).map_err(|_| ConfigError::NotPowerOfTwo(config.buffer_size))?;
            tracing::info!(
                requested = config.buffer_size,
                rounded,
                "buffer size is not a power of two, rounding up"
            );
            config.buffer_size = rounded;
        }
        Ok(config)
    }

    /// Duration of one buffer period.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.buffer_size) / f64::from(self.sample_rate.max(1)))
    }

    pub fn input_len(&self) -> usize {
        self.buffer_size as usize * self.input_channels as usize
    }

    pub fn output_len(&self) -> usize {
        self.buffer_size as usize * self.output_channels as usize
    }
}
