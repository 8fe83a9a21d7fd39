//! Logging setup.
//!
//! Set `KVSERVE_LOG_FORMAT=json` for JSON logs, anything else for
//! human-readable output. `RUST_LOG` controls levels (default: info).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "KVSERVE_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

/// Initialize logging from the environment.
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// Initialize logging; `level` is used when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) {
    init_with_level_and_format(Some(level), LogFormat::from_env());
}

/// Initialize logging with an explicit fallback level and format.
///
/// A second call is a no-op, so tests may call it freely.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let registry = tracing_subscriber::registry().with(env_filter);
    let _ = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
}
