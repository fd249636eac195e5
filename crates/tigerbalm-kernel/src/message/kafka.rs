//! Kafka message records exchanged between the transport and plugins.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A message claimed by a consumer group session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsumerGroupMessage {
    pub topic: String,
    pub group: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

impl ConsumerGroupMessage {
    pub fn new(topic: impl Into<String>, group: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Payload decoded as UTF-8, invalid sequences replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn consume_key(&self) -> ConsumeKey {
        ConsumeKey::new(&self.topic, &self.group)
    }
}

/// An outbound message submitted to the producer.
///
/// `partition`, `offset` and `error` are filled in when the message comes
/// back on a success or failure channel. `custom` is carried through
/// untouched so callers can correlate acknowledgements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProducerMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub custom: Option<serde_json::Value>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub error: Option<String>,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_custom(mut self, custom: serde_json::Value) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Target a specific partition (only honoured with manual partitioning).
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Consume binding key: topic plus group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumeKey {
    pub topic: String,
    pub group: String,
}

impl ConsumeKey {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ConsumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.group)
    }
}

/// The producer's input channel is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("producer input closed")]
pub struct SinkClosed;

/// Something that accepts outbound messages for the producer.
pub trait MessageSink: Send + Sync {
    /// Enqueue `msg`, waiting for room in the input channel. Only call from a
    /// thread that may block (never from an async worker).
    fn send_blocking(&self, msg: ProducerMessage) -> Result<(), SinkClosed>;
}
