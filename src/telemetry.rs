use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LimsConfig;

/// Install the global tracing subscriber. RUST_LOG wins over the configured
/// level. Calling this more than once is harmless.
pub fn init_tracing(config: &LimsConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(level = %config.log_level, "lab-custody tracing initialized");
    }
    Ok(())
}
