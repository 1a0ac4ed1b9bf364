//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::ApplicationError;

/// Installs the global fmt subscriber. `RUST_LOG` directives such as
/// `upsell_engine=debug` take precedence over `logging.level`.
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ApplicationError> {
    let filter = log_filter(&config.level, std::env::var("RUST_LOG").ok().as_deref());

    let installed = match config.format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .pretty()
            .try_init(),
        LogFormat::Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().try_init()
        }
    };

    installed.map_err(|error| ApplicationError::Configuration(error.to_string()))
}

/// Uses `directives` when they parse, else the configured level, else `info`.
fn log_filter(level: &str, directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
