//! Wire client seams.
//!
//! The producer and the consumer group only talk to a broker through these
//! traits. A backend supplies a connector for each side: [`MemoryBroker`]
//! in-process, or librdkafka behind the `rdkafka` feature.
//!
//! [`MemoryBroker`]: crate::backend::MemoryBroker

use std::sync::Arc;

use async_trait::async_trait;
use tigerbalm_kernel::ProducerMessage;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::KafkaResult;

// ============================================================================
// Producer side
// ============================================================================

/// Where the broker put an acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Send one message and wait for the broker's acknowledgement.
    async fn send(&self, msg: &ProducerMessage) -> KafkaResult<Delivery>;

    /// Flush anything still buffered. Called once at shutdown.
    async fn close(&self) {}
}

pub trait ProducerConnector: Send + Sync {
    fn connect(&self) -> KafkaResult<Arc<dyn ProducerClient>>;
}

// ============================================================================
// Consumer side
// ============================================================================

/// A message as handed out by a partition claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Records offsets as processed for the session's group.
pub trait OffsetMarker: Send + Sync {
    /// Mark everything before `offset` on `topic/partition` as consumed.
    fn mark(&self, topic: &str, partition: i32, offset: i64);
}

/// One group session: lives from a join until the next rebalance or close.
pub struct ClaimSession {
    cancel: CancellationToken,
    marker: Arc<dyn OffsetMarker>,
}

impl ClaimSession {
    pub fn new(cancel: CancellationToken, marker: Arc<dyn OffsetMarker>) -> Self {
        Self { cancel, marker }
    }

    /// Mark `record` as processed; the group resumes after it.
    pub fn mark_message(&self, record: &Record) {
        self.marker
            .mark(&record.topic, record.partition, record.offset + 1);
    }

    /// Resolves when the session ends.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The messages of one claimed partition, in offset order.
pub struct Claim {
    pub topic: String,
    pub partition: i32,
    pub messages: flume::Receiver<Record>,
}

/// Processes claims for a group client.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    /// Consume `claim` until its channel closes or the session ends.
    async fn consume_claim(&self, session: &ClaimSession, claim: Claim) -> KafkaResult<()>;
}

/// A joined group member.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Join the group for `topics` and run `handler` over every claim of one
    /// session. Returns when the session ends; callers loop to rejoin.
    async fn consume(&self, topics: &[String], handler: &dyn ClaimHandler) -> KafkaResult<()>;

    /// Leave the group. A running [`consume`](Self::consume) returns soon after.
    async fn close(&self);
}

#[async_trait]
pub trait GroupConnector: Send + Sync {
    async fn connect(&self, group: &str) -> KafkaResult<Arc<dyn GroupClient>>;
}
