// ABOUTME: Installs the tracing subscriber used by engine hosts
// ABOUTME: RUST_LOG wins over the configured level; supports pretty, compact and json output

use anyhow::Result;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use super::settings::LoggingConfig;

/// Installs a global fmt subscriber. A subscriber that is already installed is kept.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { &config.level };

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    let installed = match config.format.as_str() {
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
    };

    if installed.is_ok() {
        debug!("Logging initialized with level: {}", log_level);
    }
    Ok(())
}
