use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Human,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    /// Parse from CLI string argument.
    pub fn from_str_arg(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Human,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at program startup. Respects `RUST_LOG`; the default filter
/// shows info from avafleet and warnings from dependencies. Logs go to
/// stderr so `--output json` stays machine-readable.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avafleet=info,warn"));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init();
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init();
        }
    }
}
