use std::sync::Arc;

use crate::message::Message;
use crate::metrics::{status, ProducerMetrics};
use crate::store::{OverflowStore, StoreError};

/// Writes messages the pipeline could not handle to the overflow store.
///
/// Every failure is logged and metered as `storefail` here, so callers only
/// decide *when* to spill.
#[derive(Clone)]
pub(crate) struct Spillover {
    store: Option<Arc<OverflowStore>>,
    metrics: ProducerMetrics,
}

impl Spillover {
    pub(crate) fn new(store: Option<Arc<OverflowStore>>, metrics: ProducerMetrics) -> Self {
        Self { store, metrics }
    }

    /// Persist `message`, returning its sequence, or `None` if it was dropped
    pub(crate) fn persist(&self, message: &Message, partition: i32) -> Option<u64> {
        let result = match &self.store {
            Some(store) => store.put(&message.topic, &message.payload),
            None => Err(StoreError::Disabled),
        };

        match result {
            Ok(sequence) => {
                tracing::debug!(
                    topic = %message.topic,
                    sequence = sequence,
                    "Message written to overflow store"
                );
                Some(sequence)
            }
            Err(e) => {
                self.metrics
                    .inc(partition, &message.topic, status::STORE_FAIL);
                tracing::error!(
                    topic = %message.topic,
                    size = message.size(),
                    error = %e,
                    "Failed to persist message, dropping"
                );
                None
            }
        }
    }

    /// [`persist`](Self::persist) on the blocking pool, for callers running
    /// on a runtime thread
    pub(crate) async fn persist_blocking(&self, message: Message, partition: i32) -> Option<u64> {
        let spill = self.clone();
        let topic = message.topic.clone();
        match tokio::task::spawn_blocking(move || spill.persist(&message, partition)).await {
            Ok(sequence) => sequence,
            Err(e) => {
                self.metrics.inc(partition, &topic, status::STORE_FAIL);
                tracing::error!(topic = %topic, error = %e, "Overflow write task failed, dropping");
                None
            }
        }
    }
}
