use thiserror::Error;

use crate::broker::BrokerError;
use crate::store::StoreError;

/// Errors surfaced to callers of the producer.
///
/// Only construction and shutdown return these; per-message failures are
/// absorbed, logged and metered inside the pipeline.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid producer options: {0}")]
    InvalidOptions(String),

    #[error("Overflow store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Producer is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for ProducerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProducerError::Internal(format!("background task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ProducerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_convert() {
        let err: ProducerError = StoreError::Closed.into();
        assert!(matches!(err, ProducerError::Store(StoreError::Closed)));
        assert_eq!(err.to_string(), "Overflow store error: overflow store is closed");
    }

    #[test]
    fn test_broker_errors_convert() {
        let err: ProducerError = BrokerError::Connect("refused".into()).into();
        assert_eq!(
            err.to_string(),
            "Broker error: Failed to connect to broker: refused"
        );
    }
}
