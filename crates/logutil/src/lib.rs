//! Utilities for logging.
//!
//! Both the query handler and the client only emit `tracing` events. Whoever
//! hosts them (a server binary, a test) decides where those events go by
//! calling one of the init functions here once at startup.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// How verbose logging should be when `RUST_LOG` isn't set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<u8> for Verbosity {
    fn from(value: u8) -> Self {
        match value {
            0 => Verbosity::Info,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl From<Verbosity> for Level {
    fn from(value: Verbosity) -> Self {
        match value {
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Human readable, single line per event.
    #[default]
    Compact,
    /// One json object per event.
    Json,
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    let level: Level = verbosity.into();
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Initialize a global subscriber.
///
/// `RUST_LOG` takes precedence over the provided verbosity. Calling this more
/// than once is a no-op.
pub fn init(verbosity: impl Into<Verbosity>, mode: LoggingMode) {
    let filter = env_filter(verbosity.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);

    let _ = match mode {
        LoggingMode::Compact => builder.compact().try_init(),
        LoggingMode::Json => builder.json().try_init(),
    };
}

/// Initialize logging for tests.
///
/// Output goes through the test writer so it's only shown for failing tests.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(Verbosity::Debug))
        .with_test_writer()
        .try_init();
}
