//! Shutdown reporting and signal handling.
//!
//! `Producer::close` drains in phases:
//! 1. Stop the replay task and wait for an in-flight scan
//! 2. Close the ingestion queue
//! 3. Wait for every worker to drain the queue and its outcome stream
//! 4. Close the overflow store
//!
//! The totals collected along the way are returned as a [`ShutdownReport`].

use std::time::Duration;

use tokio::signal;

use crate::producer::WorkerStats;

/// Totals collected while closing a producer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that were awaited
    pub workers: usize,
    /// Messages taken from the queue by workers
    pub dequeued: u64,
    /// Acknowledged by the broker
    pub delivered: u64,
    /// Permanently rejected and dropped
    pub dropped: u64,
    /// Transient failures written to the overflow store
    pub cached: u64,
    /// Messages moved from the queue to the store because no worker ran
    pub spilled: u64,
    /// Records left in the overflow store for the next run
    pub pending_overflow: Option<usize>,
    /// Total time taken to close
    pub duration: Duration,
}

impl ShutdownReport {
    pub(crate) fn record_worker(&mut self, stats: WorkerStats) {
        self.workers += 1;
        self.dequeued += stats.dequeued;
        self.delivered += stats.delivered;
        self.dropped += stats.dropped;
        self.cached += stats.cached;
    }

    /// Every dequeued message reached exactly one outcome
    pub fn is_balanced(&self) -> bool {
        self.delivered + self.dropped + self.cached == self.dequeued
    }
}

/// Wait for Ctrl+C or SIGTERM, returning the name of the signal received
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            "ctrl_c"
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
            "terminate"
        }
    }
}
