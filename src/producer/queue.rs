//! Bounded ingestion queue with disk fallback.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

use super::spill::Spillover;
use crate::message::Message;
use crate::metrics::{status, ProducerMetrics, NO_PARTITION};

/// What happened to one offered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the in-memory queue
    Enqueued,
    /// Queue saturated or closed; written to the overflow store
    Overflowed { sequence: u64 },
    /// Neither the queue nor the store could take it
    Dropped,
}

/// Fixed-capacity queue shared by all callers and all workers.
///
/// `offer` never waits. Closing drops the only sender, which is the signal
/// workers stop on once the buffered messages are drained.
pub struct IngestionQueue {
    sender: RwLock<Option<mpsc::Sender<Message>>>,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
    capacity: usize,
    spill: Spillover,
    metrics: ProducerMetrics,
}

impl IngestionQueue {
    pub(crate) fn new(capacity: usize, spill: Spillover, metrics: ProducerMetrics) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: RwLock::new(Some(tx)),
            receiver: Arc::new(Mutex::new(rx)),
            capacity,
            spill,
            metrics,
        }
    }

    /// Offer `message`, observing `accepted` when the queue takes it.
    ///
    /// Live sends pass `sent`, replayed records pass `retry`.
    pub fn offer(&self, message: Message, accepted: &str) -> SendOutcome {
        let sender = self
            .sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let Some(sender) = sender else {
            tracing::debug!(topic = %message.topic, "Ingestion queue closed, writing to overflow store");
            return self.spill(message);
        };

        let topic = message.topic.clone();
        match sender.try_send(message) {
            Ok(()) => {
                self.metrics.inc(NO_PARTITION, &topic, accepted);
                SendOutcome::Enqueued
            }
            Err(TrySendError::Full(message)) => {
                self.metrics.inc(NO_PARTITION, &topic, status::QUEUE_FULL);
                tracing::debug!(
                    topic = %topic,
                    capacity = self.capacity,
                    "Ingestion queue full, writing to overflow store"
                );
                self.spill(message)
            }
            Err(TrySendError::Closed(message)) => {
                tracing::debug!(topic = %topic, "Ingestion queue closed, writing to overflow store");
                self.spill(message)
            }
        }
    }

    fn spill(&self, message: Message) -> SendOutcome {
        match self.spill.persist(&message, NO_PARTITION) {
            Some(sequence) => SendOutcome::Overflowed { sequence },
            None => SendOutcome::Dropped,
        }
    }

    /// Receiving half shared by the workers
    pub(crate) fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<Message>>> {
        self.receiver.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting messages. Already queued messages stay receivable.
    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl std::fmt::Debug for IngestionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionQueue")
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OverflowStore;

    fn queue(capacity: usize, store: Option<Arc<OverflowStore>>) -> (IngestionQueue, ProducerMetrics) {
        let metrics = ProducerMetrics::new("queue").unwrap();
        let spill = Spillover::new(store, metrics.clone());
        (IngestionQueue::new(capacity, spill, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_full_queue_overflows_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OverflowStore::open(dir.path()).unwrap());
        let (queue, metrics) = queue(1, Some(store.clone()));

        assert_eq!(queue.offer(Message::new("t", "1"), status::SENT), SendOutcome::Enqueued);
        assert_eq!(
            queue.offer(Message::new("t", "2"), status::SENT),
            SendOutcome::Overflowed { sequence: 1 }
        );

        assert_eq!(metrics.count(status::SENT), 1);
        assert_eq!(metrics.count(status::QUEUE_FULL), 1);

        let records = store.peek(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"2");

        let received = queue.receiver().lock().await.recv().await.unwrap();
        assert_eq!(received.payload, b"1");
    }

    #[tokio::test]
    async fn test_full_queue_without_store_drops() {
        let (queue, metrics) = queue(1, None);

        queue.offer(Message::new("t", "1"), status::SENT);
        assert_eq!(queue.offer(Message::new("t", "2"), status::SENT), SendOutcome::Dropped);
        assert_eq!(metrics.count(status::STORE_FAIL), 1);
    }

    #[tokio::test]
    async fn test_retry_status_for_replayed_messages() {
        let (queue, metrics) = queue(4, None);
        queue.offer(Message::new("t", "1"), status::RETRY);
        assert_eq!(metrics.count(status::RETRY), 1);
        assert_eq!(metrics.count(status::SENT), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OverflowStore::open(dir.path()).unwrap());
        let (queue, _metrics) = queue(4, Some(store.clone()));

        queue.offer(Message::new("t", "kept"), status::SENT);
        queue.close();
        assert!(queue.is_closed());

        assert!(matches!(
            queue.offer(Message::new("t", "late"), status::SENT),
            SendOutcome::Overflowed { .. }
        ));

        let receiver = queue.receiver();
        let mut receiver = receiver.lock().await;
        assert_eq!(receiver.recv().await.unwrap().payload, b"kept");
        assert!(receiver.recv().await.is_none());
    }
}
