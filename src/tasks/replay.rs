use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::message::Message;
use crate::metrics::{status, ProducerMetrics, NO_PARTITION};
use crate::producer::IngestionQueue;
use crate::store::{OverflowStore, ScanSummary};

/// Topic label for records whose topic could not be decoded
const UNKNOWN_TOPIC: &str = "unknown";

/// Background task that periodically drains the overflow store back into the
/// ingestion queue
pub struct ReplayTask {
    interval: Duration,
    store: Arc<OverflowStore>,
    queue: Arc<IngestionQueue>,
    metrics: ProducerMetrics,
    shutdown: broadcast::Receiver<()>,
}

impl ReplayTask {
    pub fn new(
        interval: Duration,
        store: Arc<OverflowStore>,
        queue: Arc<IngestionQueue>,
        metrics: ProducerMetrics,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval,
            store,
            queue,
            metrics,
            shutdown,
        }
    }

    /// Replay immediately, then once per interval until shutdown.
    ///
    /// A scan in progress when shutdown arrives runs to completion.
    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            path = %self.store.path().display(),
            "Replay task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Replay task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let started = Instant::now();
                    match replay_once(&self.store, &self.queue, &self.metrics).await {
                        Ok(summary) if summary.visited > 0 || summary.corrupted > 0 => {
                            tracing::info!(
                                replayed = summary.visited,
                                corrupted = summary.corrupted,
                                delete_failures = summary.delete_failures,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "Overflow replay completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Overflow replay failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Replay task stopped");
    }
}

/// Run one full scan, re-offering every record through the ingestion queue.
///
/// The scan runs on a blocking thread; offers never wait, and a record that
/// finds the queue full goes straight back to the store.
pub async fn replay_once(
    store: &Arc<OverflowStore>,
    queue: &Arc<IngestionQueue>,
    metrics: &ProducerMetrics,
) -> Result<ScanSummary> {
    let store = store.clone();
    let queue = queue.clone();

    let summary = tokio::task::spawn_blocking(move || {
        store.scan_oldest_first(|topic, payload| {
            queue.offer(Message::new(topic, payload), status::RETRY);
        })
    })
    .await??;

    if summary.corrupted > 0 {
        metrics.inc_by(
            NO_PARTITION,
            UNKNOWN_TOPIC,
            status::CORRUPT,
            summary.corrupted as u64,
        );
    }

    Ok(summary)
}
