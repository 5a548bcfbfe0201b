//! Tracing setup
//!
//! RUST_LOG overrides the configured filter.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

pub type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))?;

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_rejected() {
        // Only fails when RUST_LOG is unset, otherwise it wins
        if std::env::var("RUST_LOG").is_err() {
            let config = LogConfig {
                format: LogFormat::Pretty,
                filter: "sensor_sink=verbose".to_string(),
            };
            assert!(init_tracing(&config).is_err());
        }
    }
}
