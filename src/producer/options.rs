use std::path::PathBuf;
use std::time::Duration;

use crate::broker::BrokerSettings;
use crate::config::ProducerSettings;
use crate::error::{ProducerError, Result};

/// Interval used when none (or one below the floor) is configured
pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest accepted replay interval
pub const MIN_REPLAY_INTERVAL: Duration = Duration::from_secs(5);

/// Producer construction options.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Client name reported to the broker
    pub name: String,
    /// Broker addresses, must not be empty
    pub brokers: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Broker protocol version
    pub version: Option<String>,
    /// Number of workers, each owning one broker client
    pub num_workers: usize,
    /// Ingestion queue capacity
    pub queue_size: usize,
    /// Overflow store directory; without one overflow is dropped
    pub cache_path: Option<PathBuf>,
    /// Time between replay scans
    pub replay_interval: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            name: "buffered-producer".to_string(),
            brokers: Vec::new(),
            user: None,
            password: None,
            version: None,
            num_workers: 1,
            queue_size: 1,
            cache_path: None,
            replay_interval: DEFAULT_REPLAY_INTERVAL,
        }
    }
}

impl From<ProducerSettings> for ProducerOptions {
    fn from(settings: ProducerSettings) -> Self {
        Self {
            name: settings.name,
            brokers: settings.brokers,
            user: settings.user,
            password: settings.password,
            version: settings.version,
            num_workers: settings.num_workers,
            queue_size: settings.queue_size,
            cache_path: settings.cache_path,
            replay_interval: Duration::from_secs(settings.replay_interval_secs),
        }
    }
}

impl ProducerOptions {
    /// Fill in defaults and validate.
    ///
    /// Zero workers or a zero queue size become 1, and an interval below
    /// [`MIN_REPLAY_INTERVAL`] becomes [`DEFAULT_REPLAY_INTERVAL`].
    pub fn normalize(mut self) -> Result<Self> {
        self.brokers.retain(|b| !b.trim().is_empty());
        if self.brokers.is_empty() {
            return Err(ProducerError::InvalidOptions(
                "at least one broker address is required".to_string(),
            ));
        }

        if self.num_workers == 0 {
            self.num_workers = 1;
        }
        if self.queue_size == 0 {
            self.queue_size = 1;
        }
        if self.replay_interval < MIN_REPLAY_INTERVAL {
            tracing::debug!(
                configured_ms = self.replay_interval.as_millis() as u64,
                "Replay interval below floor, using default"
            );
            self.replay_interval = DEFAULT_REPLAY_INTERVAL;
        }

        Ok(self)
    }

    /// Settings handed to the broker connector for every worker
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            brokers: self.brokers.clone(),
            client_id: self.name.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_brokers() -> ProducerOptions {
        ProducerOptions {
            brokers: vec!["localhost:9092".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_sizes_become_one() {
        let options = ProducerOptions {
            num_workers: 0,
            queue_size: 0,
            ..with_brokers()
        }
        .normalize()
        .unwrap();

        assert_eq!(options.num_workers, 1);
        assert_eq!(options.queue_size, 1);
    }

    #[test]
    fn test_short_interval_uses_default() {
        let options = ProducerOptions {
            replay_interval: Duration::from_secs(2),
            ..with_brokers()
        }
        .normalize()
        .unwrap();
        assert_eq!(options.replay_interval, DEFAULT_REPLAY_INTERVAL);

        let options = ProducerOptions {
            replay_interval: Duration::from_secs(30),
            ..with_brokers()
        }
        .normalize()
        .unwrap();
        assert_eq!(options.replay_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_brokers_required() {
        let err = ProducerOptions::default().normalize().unwrap_err();
        assert!(matches!(err, ProducerError::InvalidOptions(_)));

        let err = ProducerOptions {
            brokers: vec!["  ".to_string()],
            ..Default::default()
        }
        .normalize()
        .unwrap_err();
        assert!(matches!(err, ProducerError::InvalidOptions(_)));
    }

    #[test]
    fn test_from_settings() {
        let settings = ProducerSettings {
            brokers: vec!["a:9092".into(), "b:9092".into()],
            user: Some("svc".into()),
            version: Some("2.1.0.0".into()),
            num_workers: 4,
            replay_interval_secs: 15,
            ..Default::default()
        };

        let options = ProducerOptions::from(settings);
        assert_eq!(options.num_workers, 4);
        assert_eq!(options.replay_interval, Duration::from_secs(15));

        let broker = options.broker_settings();
        assert_eq!(broker.brokers.len(), 2);
        assert_eq!(broker.client_id, "buffered-producer");
        assert!(broker.uses_sasl());
        assert_eq!(broker.protocol_version(), Some("2.1.0"));
    }
}
