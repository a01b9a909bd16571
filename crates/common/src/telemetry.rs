//! Tracing subscriber setup

use crate::config::{LogFormat, ObservabilityConfig};
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize the tracing subscriber from configuration.
///
/// `RUST_LOG` wins over the configured level so operators can raise
/// verbosity per-target without touching deployment config.
pub fn init(config: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    Registry::default().with(env_filter).with(fmt_layer).init();
}

/// Variant used by tests and embedded runs: never panics if a subscriber
/// is already installed.
pub fn try_init(config: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let _ = Registry::default()
        .with(env_filter)
        .with(fmt::layer().compact())
        .try_init();
}
