//! Outbound message type shared by the queue, workers and broker clients.

/// A message on its way to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Destination topic
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Optional routing key used for partition selection
    pub key: Option<Vec<u8>>,
}

impl Message {
    /// Create a message without a routing key
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            key: None,
        }
    }

    /// Attach a routing key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Bytes the broker counts against its message size limit
    pub fn size(&self) -> usize {
        self.payload.len() + self.key.as_ref().map_or(0, Vec::len)
    }
}
