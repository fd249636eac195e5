//! Kafka transport errors

use tigerbalm_kernel::ConsumeKey;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KafkaError {
    /// `(topic, group)` is already subscribed.
    #[error("topic existed: {0}")]
    TopicExisted(ConsumeKey),

    #[error("no subscription for {0}")]
    NotSubscribed(ConsumeKey),

    /// Failure reported by the wire client.
    #[error("kafka client error: {0}")]
    Client(String),

    /// The producer or consumer group has been shut down.
    #[error("kafka transport closed")]
    Closed,

    #[error("kafka configuration error: {0}")]
    Config(String),
}

impl KafkaError {
    pub fn client(reason: impl std::fmt::Display) -> Self {
        Self::Client(reason.to_string())
    }
}

pub type KafkaResult<T> = Result<T, KafkaError>;
