//! In-process broker.
//!
//! Implements [`BrokerConnector`] without any network. Every client runs one
//! delivery task fed by an internal channel, the same shape as an async
//! producer: `dispatch` enqueues, the task decides the outcome and reports it.
//! Delivered messages are kept per topic for inspection.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::Message;

use super::{
    BrokerClient, BrokerConnector, BrokerError, BrokerHandle, BrokerSettings, DeliveryOutcome,
    DispatchError, SendFailure,
};

/// Configuration for the in-process broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Partitions per topic
    pub partitions: i32,
    /// Largest accepted message (payload + key) in bytes
    pub max_message_bytes: usize,
    /// Capacity of each client's input and outcome channels
    pub channel_capacity: usize,
    /// Artificial latency applied to every delivery
    pub delivery_delay: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            max_message_bytes: 1024 * 1024, // 1 MiB
            channel_capacity: 256,
            delivery_delay: Duration::ZERO,
        }
    }
}

/// A message accepted by the broker
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message: Message,
    pub partition: i32,
    pub offset: i64,
}

struct BrokerState {
    config: MemoryBrokerConfig,
    topics: DashMap<String, Vec<DeliveredMessage>>,
    offsets: DashMap<(String, i32), i64>,
    pending_failures: AtomicUsize,
    available: AtomicBool,
    refuse_connections: AtomicBool,
    round_robin: AtomicI32,
    connections: AtomicUsize,
}

impl BrokerState {
    fn deliver(&self, message: Message) -> DeliveryOutcome {
        let partition = self.partition_for(&message);

        let size = message.size();
        if size > self.config.max_message_bytes {
            return DeliveryOutcome::Failed {
                message,
                partition,
                failure: SendFailure::MessageTooLarge {
                    size,
                    limit: self.config.max_message_bytes,
                },
            };
        }

        if !self.available.load(Ordering::SeqCst) {
            return DeliveryOutcome::Failed {
                message,
                partition,
                failure: SendFailure::Transient("broker unavailable".to_string()),
            };
        }

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return DeliveryOutcome::Failed {
                message,
                partition,
                failure: SendFailure::Transient("injected failure".to_string()),
            };
        }

        let offset = {
            let mut next = self
                .offsets
                .entry((message.topic.clone(), partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };

        let topic = message.topic.clone();
        self.topics
            .entry(topic.clone())
            .or_default()
            .push(DeliveredMessage {
                message,
                partition,
                offset,
            });

        DeliveryOutcome::Delivered {
            topic,
            partition,
            offset,
        }
    }

    fn partition_for(&self, message: &Message) -> i32 {
        let partitions = self.config.partitions.max(1);
        match &message.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as i32
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed).rem_euclid(partitions),
        }
    }
}

/// In-process broker shared by every client it creates.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(BrokerState {
                config,
                topics: DashMap::new(),
                offsets: DashMap::new(),
                pending_failures: AtomicUsize::new(0),
                available: AtomicBool::new(true),
                refuse_connections: AtomicBool::new(false),
                round_robin: AtomicI32::new(0),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Fail the next `count` deliveries with a transient error
    pub fn fail_next(&self, count: usize) {
        self.state.pending_failures.store(count, Ordering::SeqCst);
    }

    /// While unavailable, every delivery fails transiently
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Messages delivered to `topic`, in delivery order
    pub fn delivered(&self, topic: &str) -> Vec<DeliveredMessage> {
        self.state
            .topics
            .get(topic)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    /// Total messages delivered across all topics
    pub fn delivered_count(&self) -> usize {
        self.state.topics.iter().map(|t| t.len()).sum()
    }

    /// Number of clients currently open
    pub fn open_connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        settings: &BrokerSettings,
        worker_id: usize,
    ) -> Result<BrokerHandle, BrokerError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect(format!(
                "connection refused for {:?}",
                settings.brokers
            )));
        }

        let capacity = self.state.config.channel_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(capacity);

        let state = self.state.clone();
        let task = tokio::spawn(run_deliveries(state, worker_id, input_rx, outcome_tx));

        self.state.connections.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            worker_id = worker_id,
            client_id = %settings.client_id,
            version = ?settings.protocol_version(),
            sasl = settings.uses_sasl(),
            "Memory broker client connected"
        );

        Ok(BrokerHandle {
            client: Arc::new(MemoryClient {
                worker_id,
                state: self.state.clone(),
                input: Mutex::new(Some(input_tx)),
                task: Mutex::new(Some(task)),
            }),
            outcomes: outcome_rx,
        })
    }
}

async fn run_deliveries(
    state: Arc<BrokerState>,
    worker_id: usize,
    mut input: mpsc::Receiver<Message>,
    outcomes: mpsc::Sender<DeliveryOutcome>,
) {
    while let Some(message) = input.recv().await {
        if !state.config.delivery_delay.is_zero() {
            tokio::time::sleep(state.config.delivery_delay).await;
        }

        let outcome = state.deliver(message);
        if outcomes.send(outcome).await.is_err() {
            tracing::warn!(worker_id = worker_id, "Outcome receiver dropped, discarding outcome");
        }
    }
}

struct MemoryClient {
    worker_id: usize,
    state: Arc<BrokerState>,
    input: Mutex<Option<mpsc::Sender<Message>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn dispatch(&self, message: Message) -> Result<(), DispatchError> {
        let input = self.input.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(input) = input else {
            return Err(DispatchError {
                message,
                error: BrokerError::Closed,
            });
        };

        input.send(message).await.map_err(|e| DispatchError {
            message: e.0,
            error: BrokerError::Closed,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Dropping the input lets the delivery task finish what is queued
        drop(self.input.lock().unwrap_or_else(|e| e.into_inner()).take());
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();

        let Some(task) = task else {
            return Ok(());
        };

        let result = task
            .await
            .map_err(|e| BrokerError::Client(format!("delivery task failed: {e}")));
        self.state.connections.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker_id = self.worker_id, "Memory broker client closed");
        result
    }
}
