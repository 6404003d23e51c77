//! On-disk record layout for the overflow store.
//!
//! Keys are `sequence (8-byte big-endian) ++ topic bytes`, so byte order equals
//! write order across all topics. Values are the base64 text of the payload.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Length of the sequence prefix in every key.
pub const SEQUENCE_LEN: usize = 8;

/// Reasons a stored record cannot be turned back into a message.
#[derive(Debug, Error)]
pub enum CorruptRecord {
    /// Key is too short to carry a sequence prefix
    #[error("key has {0} bytes, expected at least {SEQUENCE_LEN}")]
    ShortKey(usize),

    /// Topic suffix is not valid UTF-8
    #[error("topic is not valid UTF-8: {0}")]
    InvalidTopic(#[from] std::string::FromUtf8Error),

    /// Payload is not valid base64
    #[error("payload is not valid base64: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}

/// A message persisted in the overflow store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowRecord {
    pub sequence: u64,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl OverflowRecord {
    /// Decode a raw key/value pair read from storage.
    pub fn decode(key: &[u8], value: &[u8]) -> Result<Self, CorruptRecord> {
        let (sequence, topic) = decode_key(key)?;
        let payload = decode_payload(value)?;
        Ok(Self {
            sequence,
            topic,
            payload,
        })
    }
}

pub fn encode_key(sequence: u64, topic: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(SEQUENCE_LEN + topic.len());
    key.extend_from_slice(&sequence.to_be_bytes());
    key.extend_from_slice(topic.as_bytes());
    key
}

pub fn decode_key(key: &[u8]) -> Result<(u64, String), CorruptRecord> {
    let sequence = sequence_of(key).ok_or(CorruptRecord::ShortKey(key.len()))?;
    let topic = String::from_utf8(key[SEQUENCE_LEN..].to_vec())?;
    Ok((sequence, topic))
}

/// Read the sequence prefix of a key, if it has one.
pub fn sequence_of(key: &[u8]) -> Option<u64> {
    let prefix: [u8; SEQUENCE_LEN] = key.get(..SEQUENCE_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}

pub fn encode_payload(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

pub fn decode_payload(value: &[u8]) -> Result<Vec<u8>, CorruptRecord> {
    Ok(STANDARD.decode(value)?)
}
