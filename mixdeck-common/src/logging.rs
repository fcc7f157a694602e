//! Logging bootstrap
//!
//! Installs a tracing subscriber with an `EnvFilter`. `RUST_LOG` wins over the
//! configured level so a deployment can raise verbosity without editing files.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter used by `init`
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("mixdeck_core={0},mixdeck_common={0}", config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber
///
/// Returns false if a subscriber was already installed (e.g. by a test harness).
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
