use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Numeric severity of a diagnostic message. Higher is chattier: `Crazy`
/// logs everything, `None` logs nothing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    None = 0,
    Core = 1,
    System = 2,
    Severe = 3,
    Warning = 4,
    Info = 5,
    Config = 6,
    Fine = 7,
    Finer = 8,
    Finest = 9,
    Crazy = 10,
}

impl LogLevel {
    pub const ALL: [LogLevel; 11] = [
        LogLevel::None,
        LogLevel::Core,
        LogLevel::System,
        LogLevel::Severe,
        LogLevel::Warning,
        LogLevel::Info,
        LogLevel::Config,
        LogLevel::Fine,
        LogLevel::Finer,
        LogLevel::Finest,
        LogLevel::Crazy,
    ];

    /// Levels above `Crazy` saturate.
    pub fn from_number(n: u64) -> LogLevel {
        Self::ALL[n.min(10) as usize]
    }

    pub fn as_number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Core => "CORE",
            LogLevel::System => "SYSTEM",
            LogLevel::Severe => "SEVERE",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Config => "CONFIG",
            LogLevel::Fine => "FINE",
            LogLevel::Finer => "FINER",
            LogLevel::Finest => "FINEST",
            LogLevel::Crazy => "CRAZY",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_number())
    }
}

/// Sink for bridge diagnostics. Implementations must be callable from the
/// audio thread.
pub trait Diagnostics: Send + Sync {
    fn report(&self, level: LogLevel, message: &str);
}

/// Threshold until [`set_log_level`] is called. Callback failures
/// (`Severe`) and escaped buffer views (`Warning`) pass it.
pub const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Warning;

static THRESHOLD: AtomicU8 = AtomicU8::new(DEFAULT_LOG_LEVEL as u8);

/// Set the process-wide diagnostic threshold. Messages with a level above
/// it are dropped by [`TracingDiagnostics`].
pub fn set_log_level(level: LogLevel) {
    THRESHOLD.store(level.as_number(), Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    LogLevel::from_number(THRESHOLD.load(Ordering::Relaxed) as u64)
}

/// Forwards diagnostics to `tracing`, filtered by the global threshold.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&self, level: LogLevel, message: &str) {
        if level == LogLevel::None || level > log_level() {
            return;
        }
        let code = level.as_number();
        match level {
            LogLevel::None => {}
            LogLevel::Core | LogLevel::System | LogLevel::Severe => {
                tracing::error!(target: "chuckpy", level = code, "{message}")
            }
            LogLevel::Warning => tracing::warn!(target: "chuckpy", level = code, "{message}"),
            LogLevel::Info | LogLevel::Config => {
                tracing::info!(target: "chuckpy", level = code, "{message}")
            }
            LogLevel::Fine | LogLevel::Finer => {
                tracing::debug!(target: "chuckpy", level = code, "{message}")
            }
            LogLevel::Finest | LogLevel::Crazy => {
                tracing::trace!(target: "chuckpy", level = code, "{message}")
            }
        }
    }
}

/// Install a `fmt` subscriber honoring `RUST_LOG`, defaulting to `info`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every report, regardless of the global threshold.
    #[derive(Default)]
    pub struct RecordingDiagnostics {
        pub entries: Mutex<Vec<(LogLevel, String)>>,
    }

    impl RecordingDiagnostics {
        pub fn len(&self) -> usize {
            self.entries.lock().len()
        }
    }

    impl Diagnostics for RecordingDiagnostics {
        fn report(&self, level: LogLevel, message: &str) {
            self.entries.lock().push((level, message.to_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    #[test]
    fn numeric_levels_round_trip() {
        for level in LogLevel::ALL {
            assert_eq!(LogLevel::from_number(level.as_number() as u64), level);
        }
        assert_eq!(LogLevel::from_number(42), LogLevel::Crazy);
        assert!(LogLevel::Crazy > LogLevel::Warning);
        assert_eq!(LogLevel::Severe.to_string(), "SEVERE(3)");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured_output(f: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = captured.0.lock().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn callback_failures_pass_the_default_threshold() {
        assert!(LogLevel::Severe <= DEFAULT_LOG_LEVEL);
        assert!(LogLevel::Warning <= DEFAULT_LOG_LEVEL);
        let output = captured_output(|| {
            let diagnostics = TracingDiagnostics;
            diagnostics.report(LogLevel::Severe, "audio callback failed: boom");
            diagnostics.report(LogLevel::Warning, "buffer view escaped");
            diagnostics.report(LogLevel::Crazy, "per-sample chatter");
        });
        assert!(output.contains("audio callback failed: boom"), "{output}");
        assert!(output.contains("buffer view escaped"), "{output}");
        assert!(!output.contains("per-sample chatter"), "{output}");
    }

    #[test]
    fn threshold_is_global() {
        let before = log_level();
        set_log_level(LogLevel::Finest);
        assert_eq!(log_level(), LogLevel::Finest);
        set_log_level(before);
    }
}
