//! Buffered producer.
//!
//! Callers hand messages to [`Producer::send`], which never waits: the message
//! either enters the bounded ingestion queue or, when the queue is saturated,
//! goes to the overflow store on disk. A pool of workers drains the queue into
//! broker clients, and a replay task periodically feeds the overflow store
//! back into the queue.
//!
//! ```text
//! send ──► IngestionQueue ──► workers ──► broker ──► outcome
//!   │ full                                             │ transient failure
//!   ▼                                                  ▼
//! OverflowStore ◄──────────────────────────────────────┘
//!   │ replay
//!   └──────► IngestionQueue
//! ```

mod options;
mod queue;
mod spill;
mod worker;

pub use options::{ProducerOptions, DEFAULT_REPLAY_INTERVAL, MIN_REPLAY_INTERVAL};
pub use queue::{IngestionQueue, SendOutcome};
pub(crate) use spill::Spillover;
pub use worker::WorkerStats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{BrokerConnector, BrokerHandle};
use crate::error::{ProducerError, Result};
use crate::message::Message;
use crate::metrics::{status, ProducerMetrics, NO_PARTITION};
use crate::shutdown::ShutdownReport;
use crate::store::{OverflowStore, ScanSummary, StoreError};
use crate::tasks::{replay_once, ReplayTask};
use worker::ProducerWorker;

struct ReplayHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// At-least-once producer with a disk-backed overflow buffer.
pub struct Producer {
    options: ProducerOptions,
    queue: Arc<IngestionQueue>,
    store: Option<Arc<OverflowStore>>,
    spill: Spillover,
    metrics: ProducerMetrics,
    /// Connected clients waiting for `start`
    pending: Mutex<Vec<(usize, BrokerHandle)>>,
    workers: Mutex<Vec<JoinHandle<WorkerStats>>>,
    replay: Mutex<Option<ReplayHandle>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Producer {
    /// Validate `options`, open the overflow store and connect one broker
    /// client per worker.
    ///
    /// Any failure here is fatal; clients connected before the failure are
    /// closed again.
    pub async fn new(
        options: ProducerOptions,
        connector: Arc<dyn BrokerConnector>,
        metrics: ProducerMetrics,
    ) -> Result<Self> {
        let options = options.normalize()?;

        let store = match &options.cache_path {
            Some(path) => Some(Arc::new(OverflowStore::open(path)?)),
            None => {
                tracing::warn!("No overflow store configured, overflowing messages will be dropped");
                None
            }
        };

        let settings = options.broker_settings();
        let mut pending = Vec::with_capacity(options.num_workers);
        for worker_id in 0..options.num_workers {
            match connector.connect(&settings, worker_id).await {
                Ok(handle) => pending.push((worker_id, handle)),
                Err(e) => {
                    tracing::error!(worker_id = worker_id, error = %e, "Failed to connect broker client");
                    close_clients(pending).await;
                    if let Some(store) = &store {
                        store.close();
                    }
                    return Err(e.into());
                }
            }
        }

        let spill = Spillover::new(store.clone(), metrics.clone());
        let queue = Arc::new(IngestionQueue::new(
            options.queue_size,
            spill.clone(),
            metrics.clone(),
        ));

        tracing::info!(
            name = %options.name,
            brokers = ?options.brokers,
            num_workers = options.num_workers,
            queue_size = options.queue_size,
            cache_path = ?options.cache_path,
            "Producer created"
        );

        Ok(Self {
            options,
            queue,
            store,
            spill,
            metrics,
            pending: Mutex::new(pending),
            workers: Mutex::new(Vec::new()),
            replay: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Launch the workers and, with an overflow store, the replay task.
    ///
    /// Must be called from within a tokio runtime. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        // Held until every task is registered, so `close` sees all of them
        let mut workers = lock(&self.workers);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProducerError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Producer already started");
            return Ok(());
        }

        let pending = std::mem::take(&mut *lock(&self.pending));
        let handles: Vec<_> = pending
            .into_iter()
            .map(|(worker_id, handle)| {
                let worker = ProducerWorker::new(
                    worker_id,
                    handle,
                    self.queue.receiver(),
                    self.spill.clone(),
                    self.metrics.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        let num_workers = handles.len();
        workers.extend(handles);

        if let Some(store) = &self.store {
            let (shutdown, shutdown_rx) = broadcast::channel(1);
            let task = ReplayTask::new(
                self.options.replay_interval,
                store.clone(),
                self.queue.clone(),
                self.metrics.clone(),
                shutdown_rx,
            );
            *lock(&self.replay) = Some(ReplayHandle {
                shutdown,
                task: tokio::spawn(task.run()),
            });
        }

        tracing::info!(num_workers = num_workers, "Producer started");
        Ok(())
    }

    /// Offer a message without waiting.
    pub fn send(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> SendOutcome {
        self.send_message(Message::new(topic, payload))
    }

    /// Like [`send`](Self::send) with a routing key.
    ///
    /// The key only affects partitioning; it is not kept if the message
    /// overflows to disk.
    pub fn send_with_key(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
    ) -> SendOutcome {
        self.send_message(Message::new(topic, payload).with_key(key))
    }

    pub fn send_message(&self, message: Message) -> SendOutcome {
        self.queue.offer(message, status::SENT)
    }

    /// Run one replay scan now instead of waiting for the next interval
    pub async fn replay_overflow(&self) -> Result<ScanSummary> {
        let store = self.store.as_ref().ok_or(StoreError::Disabled)?;
        replay_once(store, &self.queue, &self.metrics).await
    }

    /// Drain and shut down.
    ///
    /// Returns once every worker has flushed its broker client and consumed
    /// every outcome, and the overflow store is closed. Later calls return an
    /// empty report.
    pub async fn close(&self) -> ShutdownReport {
        {
            // Waits out a concurrent `start`
            let _workers = lock(&self.workers);
            if self.closed.swap(true, Ordering::SeqCst) {
                return ShutdownReport::default();
            }
        }

        let start = Instant::now();
        let mut report = ShutdownReport::default();

        tracing::info!("Closing producer - Phase 1: Stopping replay task");
        let replay = lock(&self.replay).take();
        if let Some(replay) = replay {
            let _ = replay.shutdown.send(());
            if let Err(e) = replay.task.await {
                tracing::error!(error = %e, "Replay task failed");
            }
        }

        tracing::info!("Phase 2: Closing ingestion queue");
        self.queue.close();

        tracing::info!("Phase 3: Draining workers");
        let workers = std::mem::take(&mut *lock(&self.workers));
        for result in join_all(workers).await {
            match result {
                Ok(stats) => report.record_worker(stats),
                Err(e) => tracing::error!(error = %e, "Producer worker failed"),
            }
        }

        // Never started: nothing drained the queue
        let pending = std::mem::take(&mut *lock(&self.pending));
        if !pending.is_empty() {
            report.spilled = self.spill_queued().await;
            close_clients(pending).await;
        }

        tracing::info!("Phase 4: Closing overflow store");
        if let Some(store) = &self.store {
            report.pending_overflow = store.len().ok();
            store.close();
        }

        report.duration = start.elapsed();
        tracing::info!(
            workers = report.workers,
            dequeued = report.dequeued,
            delivered = report.delivered,
            dropped = report.dropped,
            cached = report.cached,
            spilled = report.spilled,
            pending_overflow = ?report.pending_overflow,
            duration_ms = report.duration.as_millis() as u64,
            "Producer closed"
        );

        report
    }

    /// Move messages still sitting in the closed queue to the overflow store
    async fn spill_queued(&self) -> u64 {
        let receiver = self.queue.receiver();
        let mut receiver = receiver.lock().await;
        let mut spilled = 0;
        while let Ok(message) = receiver.try_recv() {
            if self.spill.persist_blocking(message, NO_PARTITION).await.is_some() {
                spilled += 1;
            }
        }
        spilled
    }

    pub fn metrics(&self) -> &ProducerMetrics {
        &self.metrics
    }

    pub fn overflow_store(&self) -> Option<&Arc<OverflowStore>> {
        self.store.as_ref()
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.options.name)
            .field("num_workers", &self.options.num_workers)
            .field("queue", &self.queue)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn close_clients(handles: Vec<(usize, BrokerHandle)>) {
    for (worker_id, handle) in handles {
        if let Err(e) = handle.client.close().await {
            tracing::warn!(worker_id = worker_id, error = %e, "Failed to close broker client");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
