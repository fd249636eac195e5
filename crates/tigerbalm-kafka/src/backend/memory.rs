//! In-process broker.
//!
//! Topics are created on first write with a fixed partition count. Each
//! group keeps its own committed offsets, so a rejoining member resumes after
//! the last marked record. There is no partition assignment: every member of
//! a group claims every partition of its topics.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tigerbalm_kernel::ProducerMessage;
use tigerbalm_kernel::config::{KafkaConfig, OffsetsInitial};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{
    Claim, ClaimHandler, ClaimSession, Delivery, GroupClient, GroupConnector, OffsetMarker,
    ProducerClient, ProducerConnector, Record,
};
use crate::error::{KafkaError, KafkaResult};

use super::lanes::CLAIM_BUFFER;

pub const DEFAULT_PARTITIONS: i32 = 4;

type CommitKey = (String, String, i32);

struct BrokerState {
    partitions: i32,
    initial: OffsetsInitial,
    topics: Mutex<HashMap<String, Vec<Vec<Record>>>>,
    committed: Mutex<HashMap<CommitKey, i64>>,
    failing: Mutex<HashSet<String>>,
    round_robin: AtomicUsize,
    appended: Notify,
}

/// Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new(partitions: i32, initial: OffsetsInitial) -> Self {
        Self {
            state: Arc::new(BrokerState {
                partitions: partitions.max(1),
                initial,
                topics: Mutex::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                round_robin: AtomicUsize::new(0),
                appended: Notify::new(),
            }),
        }
    }

    pub fn from_config(config: &KafkaConfig) -> Self {
        Self::new(DEFAULT_PARTITIONS, config.consumer.offsets_initial)
    }

    pub fn partitions(&self) -> i32 {
        self.state.partitions
    }

    /// Reject every later write to `topic`.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.state.failing.lock().insert(topic.into());
    }

    /// Append a message, choosing the partition from `partition`, then the
    /// key hash, then round robin.
    pub fn append(&self, msg: &ProducerMessage) -> KafkaResult<Delivery> {
        if self.state.failing.lock().contains(&msg.topic) {
            return Err(KafkaError::client(format!("topic {} rejected write", msg.topic)));
        }
        let partition = self.partition_for(msg)?;

        let offset = {
            let mut topics = self.state.topics.lock();
            let log = topics
                .entry(msg.topic.clone())
                .or_insert_with(|| vec![Vec::new(); self.state.partitions as usize]);
            let records = &mut log[partition as usize];
            let offset = records.len() as i64;
            records.push(Record {
                topic: msg.topic.clone(),
                partition,
                offset,
                key: msg.key.clone(),
                payload: msg.payload.clone(),
            });
            offset
        };
        self.state.appended.notify_waiters();
        Ok(Delivery { partition, offset })
    }

    fn partition_for(&self, msg: &ProducerMessage) -> KafkaResult<i32> {
        let n = self.state.partitions;
        if let Some(partition) = msg.partition {
            if !(0..n).contains(&partition) {
                return Err(KafkaError::client(format!(
                    "partition {partition} out of range for {}",
                    msg.topic
                )));
            }
            return Ok(partition);
        }
        let slot = match &msg.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                hasher.finish() as usize
            }
            None => self.state.round_robin.fetch_add(1, Ordering::Relaxed),
        };
        Ok((slot % n as usize) as i32)
    }

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.state
            .topics
            .lock()
            .get(topic)
            .map(|log| log.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Next offset `group` will read on `topic/partition`, if it marked any.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .committed
            .lock()
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn start_offset(&self, group: &str, topic: &str, partition: i32) -> i64 {
        if let Some(offset) = self.committed(group, topic, partition) {
            return offset;
        }
        match self.state.initial {
            OffsetsInitial::Oldest => 0,
            OffsetsInitial::Newest => self.read_len(topic, partition),
        }
    }

    fn read_len(&self, topic: &str, partition: i32) -> i64 {
        self.state
            .topics
            .lock()
            .get(topic)
            .map_or(0, |log| log[partition as usize].len() as i64)
    }

    fn read_from(&self, topic: &str, partition: i32, offset: i64) -> Vec<Record> {
        let topics = self.state.topics.lock();
        let Some(log) = topics.get(topic) else {
            return Vec::new();
        };
        log[partition as usize]
            .iter()
            .skip(offset.max(0) as usize)
            .cloned()
            .collect()
    }

    /// Stream `topic/partition` from `next` into `tx` until cancelled.
    async fn feed(
        self,
        topic: String,
        partition: i32,
        mut next: i64,
        tx: flume::Sender<Record>,
        cancel: CancellationToken,
    ) {
        loop {
            let appended = self.state.appended.notified();
            let batch = self.read_from(&topic, partition, next);
            if batch.is_empty() {
                tokio::select! {
                    _ = appended => continue,
                    _ = cancel.cancelled() => return,
                }
            }
            for record in batch {
                next = record.offset + 1;
                tokio::select! {
                    sent = tx.send_async(record) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn send(&self, msg: &ProducerMessage) -> KafkaResult<Delivery> {
        self.broker.append(msg)
    }
}

impl ProducerConnector for MemoryBroker {
    fn connect(&self) -> KafkaResult<Arc<dyn ProducerClient>> {
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
        }))
    }
}

// ============================================================================
// Consumer group
// ============================================================================

struct GroupMarker {
    broker: MemoryBroker,
    group: String,
}

impl OffsetMarker for GroupMarker {
    fn mark(&self, topic: &str, partition: i32, offset: i64) {
        let mut committed = self.broker.state.committed.lock();
        let entry = committed
            .entry((self.group.clone(), topic.to_string(), partition))
            .or_insert(offset);
        *entry = (*entry).max(offset);
    }
}

struct MemoryGroupClient {
    broker: MemoryBroker,
    group: String,
    closed: CancellationToken,
}

#[async_trait]
impl GroupClient for MemoryGroupClient {
    async fn consume(&self, topics: &[String], handler: &dyn ClaimHandler) -> KafkaResult<()> {
        if self.closed.is_cancelled() {
            return Err(KafkaError::Closed);
        }
        let marker = Arc::new(GroupMarker {
            broker: self.broker.clone(),
            group: self.group.clone(),
        });
        let session = ClaimSession::new(self.closed.child_token(), marker);

        let mut feeders = Vec::new();
        let mut claims = Vec::new();
        for topic in topics {
            for partition in 0..self.broker.partitions() {
                let (tx, rx) = flume::bounded(CLAIM_BUFFER);
                let start = self.broker.start_offset(&self.group, topic, partition);
                feeders.push(tokio::spawn(self.broker.clone().feed(
                    topic.clone(),
                    partition,
                    start,
                    tx,
                    self.closed.child_token(),
                )));
                claims.push(handler.consume_claim(
                    &session,
                    Claim {
                        topic: topic.clone(),
                        partition,
                        messages: rx,
                    },
                ));
            }
        }
        debug!(group = %self.group, claims = claims.len(), "memory session started");

        let results = futures::future::join_all(claims).await;
        for feeder in feeders {
            feeder.abort();
        }
        results.into_iter().collect()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl GroupConnector for MemoryBroker {
    async fn connect(&self, group: &str) -> KafkaResult<Arc<dyn GroupClient>> {
        Ok(Arc::new(MemoryGroupClient {
            broker: self.clone(),
            group: group.to_string(),
            closed: CancellationToken::new(),
        }))
    }
}
