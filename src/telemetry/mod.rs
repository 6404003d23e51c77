//! Tracing subscriber setup.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RUST_LOG` | Filter directives, overrides `logging.level` | unset |
//! | `LOGGING__LEVEL` | Default filter | `info` |
//! | `LOGGING__FORMAT` | `pretty` or `json` | `pretty` |

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Telemetry-specific error type
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Unknown formats fall back to `Pretty`
    pub fn parse(format: &str) -> Self {
        if format.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Build the filter: `RUST_LOG` when set, otherwise `config.level`
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.level).map_err(|e| TelemetryError::InvalidFilter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
///
/// Fails if a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = env_filter(config)?;

    let result = match LogFormat::parse(&config.format) {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };
    result.map_err(|e| TelemetryError::Install(e.to_string()))?;

    tracing::info!(level = %config.level, format = %config.format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        // Another test may have installed a subscriber first
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Install(_))));
    }
}
