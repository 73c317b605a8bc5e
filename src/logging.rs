//! Structured logging initialization.
//!
//! The library itself only emits `tracing` events. Binaries call [`init`]
//! once to get them on stderr. RUST_LOG takes precedence over the configured
//! level.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Installs a global subscriber. Does nothing if one is already installed.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let layer = fmt::layer()
        .with_target(true)
        .with_thread_names(config.thread_names);

    let registry = tracing_subscriber::registry().with(filter);
    let result = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer.with_ansi(true)).try_init(),
        (LogFormat::Pretty, false) => registry
            .with(layer.with_ansi(true).without_time())
            .try_init(),
        (LogFormat::Compact, true) => registry.with(layer.compact()).try_init(),
        (LogFormat::Compact, false) => registry.with(layer.compact().without_time()).try_init(),
        (LogFormat::Json, true) => registry.with(layer.json()).try_init(),
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).try_init(),
    };

    if result.is_err() {
        tracing::debug!("a global subscriber is already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig {
            level: "warn".into(),
            format: LogFormat::Compact,
            timestamps: false,
            thread_names: false,
        };
        init(&config);
        init(&config);
    }
}
