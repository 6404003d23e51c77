//! Prometheus metrics for the producer.
//!
//! Every observation is one increment of a single counter family labelled by
//! `partition`, `topic` and `status`:
//! - `sent` / `retry`: accepted by the ingestion queue (live / replayed)
//! - `queuefull`: queue saturated, diverted to the overflow store
//! - `ok`: acknowledged by the broker
//! - `error`: permanently rejected by the broker and dropped
//! - `errorcache`: transient broker failure, persisted for replay
//! - `storefail`: the overflow store could not take the message, dropped
//! - `corrupt`: undecodable overflow record discarded during replay

mod helpers;

pub use helpers::{encode_metrics, sum_counter};

use prometheus::{IntCounterVec, Opts, Registry};

/// Partition label for observations made before a partition is known
pub const NO_PARTITION: i32 = -1;

/// Values of the `status` label
pub mod status {
    pub const SENT: &str = "sent";
    pub const RETRY: &str = "retry";
    pub const QUEUE_FULL: &str = "queuefull";
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
    pub const ERROR_CACHE: &str = "errorcache";
    pub const STORE_FAIL: &str = "storefail";
    pub const CORRUPT: &str = "corrupt";
}

/// Message counters owned by one producer.
///
/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct ProducerMetrics {
    messages: IntCounterVec,
}

impl ProducerMetrics {
    /// Create counters named `{namespace}_messages_total`, not yet registered.
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let messages = IntCounterVec::new(
            Opts::new("messages_total", "Producer messages by partition, topic and status")
                .namespace(namespace),
            &["partition", "topic", "status"],
        )?;
        Ok(Self { messages })
    }

    /// Expose the counters through `registry`
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages.clone()))
    }

    /// Record one observation
    pub fn inc(&self, partition: i32, topic: &str, status: &str) {
        self.messages
            .with_label_values(&[&partition.to_string(), topic, status])
            .inc();
    }

    pub fn inc_by(&self, partition: i32, topic: &str, status: &str, count: u64) {
        self.messages
            .with_label_values(&[&partition.to_string(), topic, status])
            .inc_by(count);
    }

    /// Total observations with `status` across all topics and partitions
    pub fn count(&self, status: &str) -> u64 {
        sum_counter(&self.messages, &[("status", status)])
    }

    /// Total observations with `status` for one topic
    pub fn count_for(&self, topic: &str, status: &str) -> u64 {
        sum_counter(&self.messages, &[("topic", topic), ("status", status)])
    }
}

impl std::fmt::Debug for ProducerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerMetrics")
            .field("ok", &self.count(status::OK))
            .field("errorcache", &self.count(status::ERROR_CACHE))
            .finish()
    }
}
