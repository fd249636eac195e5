//! Bounded per-partition lanes between a fetch loop and its claims.

use std::collections::HashMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::client::Record;

/// Records buffered ahead of a claim handler.
pub(crate) const CLAIM_BUFFER: usize = 64;

type Held = BoxFuture<'static, Result<(), flume::SendError<Record>>>;

/// Routes fetched records into one bounded lane per `(topic, partition)`.
///
/// A record that finds its lane full is held, and the fetch loop must not
/// fetch again until [`PartitionLanes::release`] has moved it in. That keeps
/// at most `capacity + 1` records per partition between broker and handler.
pub(crate) struct PartitionLanes {
    capacity: usize,
    lanes: HashMap<(String, i32), flume::Sender<Record>>,
    held: Option<Held>,
}

impl PartitionLanes {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lanes: HashMap::new(),
            held: None,
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.held.is_some()
    }

    /// Route `record`. The first record of a partition opens its lane and
    /// hands the receiving end to `open`.
    pub(crate) fn route(&mut self, record: Record, open: impl FnOnce(&Record, flume::Receiver<Record>)) {
        let key = (record.topic.clone(), record.partition);
        let tx = match self.lanes.get(&key) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = flume::bounded(self.capacity);
                open(&record, rx);
                self.lanes.insert(key, tx.clone());
                tx
            }
        };

        match tx.try_send(record) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(record)) => {
                debug!(topic = %record.topic, partition = record.partition, "claim lane full, fetch paused");
                self.held = Some(tx.into_send_async(record).boxed());
            }
            Err(flume::TrySendError::Disconnected(record)) => {
                warn!(topic = %record.topic, partition = record.partition, "claim closed before its partition");
            }
        }
    }

    /// Wait until the held record is in its lane. Never completes when
    /// nothing is held. Cancel safe: the record stays held if dropped early.
    pub(crate) async fn release(&mut self) {
        let Some(held) = self.held.as_mut() else {
            return std::future::pending::<()>().await;
        };
        if held.await.is_err() {
            warn!("claim closed while a record was held");
        }
        self.held = None;
    }

    /// Drop every sender so each claim sees its lane end.
    pub(crate) fn close(&mut self) {
        self.held = None;
        self.lanes.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(topic: &str, partition: i32, offset: i64) -> Record {
        Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_full_lane_pauses_until_drained() {
        let mut lanes = PartitionLanes::new(2);
        let mut opened = Vec::new();
        for offset in 0..3 {
            lanes.route(record("t", 0, offset), |_, rx| opened.push(rx));
        }
        assert_eq!(opened.len(), 1);
        assert!(lanes.is_blocked());

        let rx = opened.remove(0);
        let still_full = tokio::time::timeout(Duration::from_millis(20), lanes.release()).await;
        assert!(still_full.is_err());
        assert!(lanes.is_blocked());

        assert_eq!(rx.recv_async().await.unwrap().offset, 0);
        lanes.release().await;
        assert!(!lanes.is_blocked());
        let rest: Vec<i64> = rx.try_iter().map(|r| r.offset).collect();
        assert_eq!(rest, [1, 2]);
    }

    #[test]
    fn test_each_partition_gets_its_own_lane() {
        let mut lanes = PartitionLanes::new(1);
        let mut opened = Vec::new();
        for (topic, partition) in [("t", 0), ("t", 1), ("u", 0)] {
            lanes.route(record(topic, partition, 0), |_, rx| opened.push(rx));
        }
        assert_eq!(opened.len(), 3);
        assert!(!lanes.is_blocked());

        drop(opened);
        lanes.route(record("t", 0, 1), |_, _| panic!("lane opened twice"));
        assert!(!lanes.is_blocked());
    }

    #[tokio::test]
    async fn test_close_ends_every_lane() {
        let mut lanes = PartitionLanes::new(1);
        let mut opened = Vec::new();
        lanes.route(record("t", 0, 0), |_, rx| opened.push(rx));
        lanes.route(record("t", 0, 1), |_, rx| opened.push(rx));
        assert!(lanes.is_blocked());

        lanes.close();
        assert!(!lanes.is_blocked());
        let rx = opened.remove(0);
        assert_eq!(rx.recv_async().await.unwrap().offset, 0);
        assert!(rx.recv_async().await.is_err());
    }
}
