//! Logging initialization for zipstream.
//!
//! Structured logging via `tracing`. The service emits JSON lines unless
//! `LOG_FORMAT=pretty` asks for the development format; levels come from
//! `RUST_LOG` and default to `info`. The API layer attaches the request id
//! to spans so every line for one download carries the same correlation id.

use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static INSTALLED: OnceLock<LogFormat> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON structured logs (the default; for production).
    #[default]
    Json,
    /// Pretty-printed logs for local development.
    Pretty,
}

impl LogFormat {
    /// Reads `LOG_FORMAT`; anything other than `pretty` means JSON.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Installs the global subscriber in the requested format.
///
/// Call once at startup. Later calls (tests, repeated wiring) are no-ops;
/// the first format wins.
pub fn init_logging(format: LogFormat) {
    INSTALLED.get_or_init(|| {
        let subscriber = tracing_subscriber::fmt().with_env_filter(level_filter());
        match format {
            LogFormat::Json => subscriber.json().init(),
            LogFormat::Pretty => subscriber.pretty().init(),
        }
        format
    });
}

fn level_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}
