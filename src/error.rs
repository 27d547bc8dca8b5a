use thiserror::Error;

/// Rejected stream configuration. Raised before a stream starts; the bridge
/// itself only ever sees validated configurations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,
    #[error("buffer size must be non-zero")]
    ZeroBufferSize,
    #[error("buffer count must be non-zero")]
    ZeroBufferCount,
    #[error("at least one output channel is required")]
    NoOutputChannels,
    #[error("{which} channel count {count} exceeds the maximum of {max}")]
    TooManyChannels {
        which: &'static str,
        count: u32,
        max: u32,
    },
    #[error("buffer size {0} is not a power of two")]
    NotPowerOfTwo(u32),
    #[error("cannot read config file: {0}")]
    Io(String),
    #[error("invalid config file: {0}")]
    Parse(String),
}

/// Failure of a single processing call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The managed runtime cannot be entered at all (never initialized or
    /// already finalized). The driver should halt the stream.
    #[error("managed runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    /// Arguments for the callback could not be built.
    #[error("failed to marshal callback arguments: {0}")]
    Marshal(String),
    /// User logic signalled failure.
    #[error("callback raised: {0}")]
    Callback(String),
}

impl ProcessError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessError::RuntimeUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("audio driver `{driver}`: {message}")]
    Driver {
        driver: &'static str,
        message: String,
    },
    #[error("stream is {0}, cannot {1}")]
    InvalidState(&'static str, &'static str),
    #[error("cannot {0} a stream from inside an audio callback")]
    InCallback(&'static str),
    #[error("failed to spawn audio thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl StreamError {
    pub(crate) fn driver(driver: &'static str, message: impl ToString) -> Self {
        StreamError::Driver {
            driver,
            message: message.to_string(),
        }
    }
}
