use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;

pub use formatter::*;

use crate::configs::LoggingConfig;

/// Builds the filter directive from the configured level and per-target filters.
pub fn filter_directive(logging: Option<&LoggingConfig>) -> String {
    let log_level = logging
        .and_then(|l| l.level.as_deref())
        .unwrap_or("info");

    let filters = logging.and_then(|l| l.filters.as_deref()).unwrap_or("");

    if filters.is_empty() {
        log_level.to_string()
    } else {
        format!("{},{}", log_level, filters)
    }
}

pub fn init(logging: Option<&LoggingConfig>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(logging)));

    let ansi = logging.is_none_or(LoggingConfig::ansi);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(CodecEventFormat::new(ansi))
        .with_ansi(ansi);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
}
