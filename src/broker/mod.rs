//! Broker client capability.
//!
//! The producer never speaks a wire protocol itself. Each worker obtains a
//! [`BrokerHandle`] from a [`BrokerConnector`]: a client that accepts messages
//! and a stream on which the client later reports what happened to each one.
//!
//! # Contract
//!
//! - `dispatch` hands a message over; its fate arrives on `outcomes`
//! - `close` flushes every in-flight message, reports its outcome, and only
//!   then ends the `outcomes` stream

pub mod memory;

pub use memory::{DeliveredMessage, MemoryBroker, MemoryBrokerConfig};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

/// Errors raised by a broker client itself.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The client could not be created
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    /// The client no longer accepts messages
    #[error("Broker client is closed")]
    Closed,

    /// Any other client-side failure
    #[error("Broker client error: {0}")]
    Client(String),
}

/// A message the client refused outright. The message is handed back.
#[derive(Debug, Error)]
#[error("Broker rejected message for topic {}: {error}", .message.topic)]
pub struct DispatchError {
    pub message: Message,
    #[source]
    pub error: BrokerError,
}

/// Why a dispatched message was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// The message can never be accepted by the broker
    #[error("message of {size} bytes exceeds the broker limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Delivery may succeed if attempted again later
    #[error("transient broker failure: {0}")]
    Transient(String),
}

impl SendFailure {
    /// Permanent failures are dropped instead of persisted
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::MessageTooLarge { .. })
    }
}

/// Asynchronous result of one dispatched message
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Failed {
        message: Message,
        partition: i32,
        failure: SendFailure,
    },
}

/// Broker connection settings passed to every `connect` call.
#[derive(Debug, Clone, Default)]
pub struct BrokerSettings {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// Client identifier reported to the broker
    pub client_id: String,
    /// SASL user, enables authentication when set
    pub user: Option<String>,
    pub password: Option<String>,
    /// Broker protocol version, e.g. `2.1.0`
    pub version: Option<String>,
}

impl BrokerSettings {
    /// Protocol version trimmed to `major.minor.patch`.
    ///
    /// Four-part versions such as `2.1.0.0` are cut to five characters;
    /// legacy `0.x` versions keep their full form.
    pub fn protocol_version(&self) -> Option<&str> {
        let version = self.version.as_deref()?.trim();
        if version.is_empty() {
            return None;
        }
        if version.len() > 5 && !version.starts_with('0') {
            return version.get(..5).or(Some(version));
        }
        Some(version)
    }

    /// Whether SASL credentials were supplied
    pub fn uses_sasl(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// One worker's client and the stream of its delivery outcomes.
pub struct BrokerHandle {
    pub client: Arc<dyn BrokerClient>,
    pub outcomes: mpsc::Receiver<DeliveryOutcome>,
}

/// A broker client owned by exactly one worker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Hand a message to the client. The outcome is reported later.
    async fn dispatch(&self, message: Message) -> Result<(), DispatchError>;

    /// Flush in-flight messages, then end the outcome stream.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Creates broker clients, one per worker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        settings: &BrokerSettings,
        worker_id: usize,
    ) -> Result<BrokerHandle, BrokerError>;
}
