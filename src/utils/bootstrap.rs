//! Bootstrap utilities for the relay binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LOG_ENV_VAR};

/// Initialize tracing with the `BLOG_RELAY_LOG` environment variable.
///
/// Defaults to "info" level if `BLOG_RELAY_LOG` is not set.
pub fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
