use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::spill::Spillover;
use crate::broker::{BrokerClient, BrokerHandle, DeliveryOutcome};
use crate::message::Message;
use crate::metrics::{status, ProducerMetrics, NO_PARTITION};

/// Per-worker totals reported at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages taken from the ingestion queue
    pub dequeued: u64,
    /// Acknowledged by the broker
    pub delivered: u64,
    /// Permanently rejected and dropped
    pub dropped: u64,
    /// Transient failures handed to the overflow store
    pub cached: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: WorkerStats) {
        self.dequeued += other.dequeued;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.cached += other.cached;
    }
}

/// One task forwarding queued messages to its own broker client.
pub(crate) struct ProducerWorker {
    id: usize,
    client: Arc<dyn BrokerClient>,
    outcomes: mpsc::Receiver<DeliveryOutcome>,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
    spill: Spillover,
    metrics: ProducerMetrics,
}

impl ProducerWorker {
    pub(crate) fn new(
        id: usize,
        handle: BrokerHandle,
        receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
        spill: Spillover,
        metrics: ProducerMetrics,
    ) -> Self {
        Self {
            id,
            client: handle.client,
            outcomes: handle.outcomes,
            receiver,
            spill,
            metrics,
        }
    }

    /// Forward messages until the queue is closed and drained, then close the
    /// client and wait for every outstanding outcome.
    pub(crate) async fn run(self) -> WorkerStats {
        let Self {
            id,
            client,
            outcomes,
            receiver,
            spill,
            metrics,
        } = self;

        let outcome_task = tokio::spawn(consume_outcomes(
            id,
            outcomes,
            spill.clone(),
            metrics.clone(),
        ));

        tracing::debug!(worker_id = id, "Producer worker started");

        let mut stats = WorkerStats::default();
        loop {
            let next = receiver.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };
            stats.dequeued += 1;

            if let Err(e) = client.dispatch(message).await {
                metrics.inc(NO_PARTITION, &e.message.topic, status::ERROR_CACHE);
                tracing::warn!(
                    worker_id = id,
                    topic = %e.message.topic,
                    error = %e.error,
                    "Broker client rejected message, caching"
                );
                spill.persist_blocking(e.message, NO_PARTITION).await;
                stats.cached += 1;
            }
        }

        // Flushes in-flight messages and ends the outcome stream
        if let Err(e) = client.close().await {
            tracing::error!(worker_id = id, error = %e, "Failed to close broker client");
        }

        match outcome_task.await {
            Ok(outcome_stats) => stats.merge(outcome_stats),
            Err(e) => {
                tracing::error!(worker_id = id, error = %e, "Outcome task failed");
            }
        }

        tracing::debug!(
            worker_id = id,
            dequeued = stats.dequeued,
            delivered = stats.delivered,
            dropped = stats.dropped,
            cached = stats.cached,
            "Producer worker stopped"
        );

        stats
    }
}

/// Drain one client's outcome stream until the client ends it.
async fn consume_outcomes(
    worker_id: usize,
    mut outcomes: mpsc::Receiver<DeliveryOutcome>,
    spill: Spillover,
    metrics: ProducerMetrics,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    while let Some(outcome) = outcomes.recv().await {
        match outcome {
            DeliveryOutcome::Delivered {
                topic,
                partition,
                offset,
            } => {
                metrics.inc(partition, &topic, status::OK);
                stats.delivered += 1;
                tracing::debug!(
                    worker_id = worker_id,
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Message delivered"
                );
            }
            DeliveryOutcome::Failed {
                message,
                partition,
                failure,
            } if failure.is_permanent() => {
                metrics.inc(partition, &message.topic, status::ERROR);
                stats.dropped += 1;
                tracing::error!(
                    worker_id = worker_id,
                    topic = %message.topic,
                    partition = partition,
                    error = %failure,
                    "Message permanently rejected, dropping"
                );
            }
            DeliveryOutcome::Failed {
                message,
                partition,
                failure,
            } => {
                metrics.inc(partition, &message.topic, status::ERROR_CACHE);
                stats.cached += 1;
                tracing::warn!(
                    worker_id = worker_id,
                    topic = %message.topic,
                    partition = partition,
                    error = %failure,
                    "Message delivery failed, caching"
                );
                spill.persist_blocking(message, partition).await;
            }
        }
    }

    stats
}
