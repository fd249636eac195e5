//! Kafka consumer group.
//!
//! Each `(topic, group)` subscription owns one group client and one task that
//! calls [`GroupClient::consume`] in a loop until its quit flag is set. A
//! session ending (rebalance, transient error) is not fatal: the loop joins
//! again.
//!
//! Claimed messages go to the subscription's handlers when it has any, and to
//! the shared output queue otherwise. Every message is marked after that step
//! whether or not a handler failed, so a failed message is never redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tigerbalm_kernel::config::ConsumerConfig;
use tigerbalm_kernel::{ConsumeKey, ConsumerGroupMessage, Event, Handler};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{Claim, ClaimHandler, ClaimSession, GroupClient, GroupConnector, Record};
use crate::error::{KafkaError, KafkaResult};

#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Output queue capacity.
    pub queue: usize,
    /// Pause before rejoining after a failed session.
    pub retry_backoff: Duration,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

impl From<&ConsumerConfig> for GroupOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            queue: config.queue,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

struct Subscription {
    quit: Arc<AtomicBool>,
    client: Arc<dyn GroupClient>,
    task: JoinHandle<()>,
}

struct GroupShared {
    connector: Arc<dyn GroupConnector>,
    options: GroupOptions,
    subscriptions: Mutex<HashMap<ConsumeKey, Subscription>>,
    output_tx: RwLock<Option<flume::Sender<ConsumerGroupMessage>>>,
    output_rx: flume::Receiver<ConsumerGroupMessage>,
    failed: Option<flume::Sender<ConsumerGroupMessage>>,
}

/// Cheap to clone; clones share the same subscriptions.
#[derive(Clone)]
pub struct ConsumerGroup {
    shared: Arc<GroupShared>,
}

impl ConsumerGroup {
    pub fn new(connector: Arc<dyn GroupConnector>, options: GroupOptions) -> Self {
        Self::build(connector, options, None)
    }

    /// Like [`new`](Self::new), reporting consume failures on `failed`.
    pub fn with_failed(
        connector: Arc<dyn GroupConnector>,
        options: GroupOptions,
        failed: flume::Sender<ConsumerGroupMessage>,
    ) -> Self {
        Self::build(connector, options, Some(failed))
    }

    fn build(
        connector: Arc<dyn GroupConnector>,
        options: GroupOptions,
        failed: Option<flume::Sender<ConsumerGroupMessage>>,
    ) -> Self {
        let (tx, rx) = flume::bounded(options.queue);
        Self {
            shared: Arc::new(GroupShared {
                connector,
                options,
                subscriptions: Mutex::new(HashMap::new()),
                output_tx: RwLock::new(Some(tx)),
                output_rx: rx,
                failed,
            }),
        }
    }

    /// Messages of subscriptions without handlers. Disconnects after
    /// [`fini`](Self::fini).
    pub fn output(&self) -> flume::Receiver<ConsumerGroupMessage> {
        self.shared.output_rx.clone()
    }

    /// Subscribe `group` to `topic`. `handlers` run for every claimed message;
    /// with none, messages go to [`output`](Self::output).
    pub async fn add(
        &self,
        topic: impl Into<String>,
        group: impl Into<String>,
        handlers: Vec<Handler>,
    ) -> KafkaResult<()> {
        let key = ConsumeKey::new(topic, group);
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if subscriptions.contains_key(&key) {
            return Err(KafkaError::TopicExisted(key));
        }

        let output = self
            .shared
            .output_tx
            .read()
            .clone()
            .ok_or(KafkaError::Closed)?;
        let client = self.shared.connector.connect(&key.group).await?;
        let quit = Arc::new(AtomicBool::new(false));
        let worker = ClaimWorker {
            key: key.clone(),
            handlers,
            output,
        };
        let task = tokio::spawn(consume_loop(
            worker,
            client.clone(),
            quit.clone(),
            self.shared.failed.clone(),
            self.shared.options.retry_backoff,
        ));

        info!(topic = %key.topic, group = %key.group, "consumer group subscribed");
        subscriptions.insert(key, Subscription { quit, client, task });
        Ok(())
    }

    /// Stop and remove the `(topic, group)` subscription, waiting for its
    /// loop to return.
    pub async fn del(&self, topic: &str, group: &str) -> KafkaResult<()> {
        let key = ConsumeKey::new(topic, group);
        let subscription = self
            .shared
            .subscriptions
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| KafkaError::NotSubscribed(key.clone()))?;
        stop(&key, subscription).await;
        Ok(())
    }

    pub async fn contains(&self, topic: &str, group: &str) -> bool {
        self.shared
            .subscriptions
            .lock()
            .await
            .contains_key(&ConsumeKey::new(topic, group))
    }

    pub async fn keys(&self) -> Vec<ConsumeKey> {
        let mut keys: Vec<ConsumeKey> = self
            .shared
            .subscriptions
            .lock()
            .await
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Stop every subscription, then close the output queue.
    pub async fn fini(&self) {
        let subscriptions: Vec<_> = self.shared.subscriptions.lock().await.drain().collect();
        for (key, subscription) in subscriptions {
            stop(&key, subscription).await;
        }
        self.shared.output_tx.write().take();
        debug!("consumer group finished");
    }
}

async fn stop(key: &ConsumeKey, subscription: Subscription) {
    subscription.quit.store(true, Ordering::Release);
    subscription.client.close().await;
    if let Err(e) = subscription.task.await {
        warn!(topic = %key.topic, group = %key.group, error = %e, "consume task failed");
    }
    info!(topic = %key.topic, group = %key.group, "consumer group unsubscribed");
}

async fn consume_loop(
    worker: ClaimWorker,
    client: Arc<dyn GroupClient>,
    quit: Arc<AtomicBool>,
    failed: Option<flume::Sender<ConsumerGroupMessage>>,
    backoff: Duration,
) {
    let topics = vec![worker.key.topic.clone()];
    while !quit.load(Ordering::Acquire) {
        match client.consume(&topics, &worker).await {
            Ok(()) => debug!(key = %worker.key, "consumer session ended"),
            Err(e) => {
                if quit.load(Ordering::Acquire) {
                    break;
                }
                warn!(key = %worker.key, error = %e, "consume failed");
                if let Some(tx) = &failed {
                    let mut msg = ConsumerGroupMessage::new(
                        worker.key.topic.clone(),
                        worker.key.group.clone(),
                        Vec::new(),
                    );
                    msg.error = Some(e.to_string());
                    if tx.send_async(msg).await.is_err() {
                        debug!("failure channel closed");
                    }
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Claim processing for one subscription.
pub struct ClaimWorker {
    key: ConsumeKey,
    handlers: Vec<Handler>,
    output: flume::Sender<ConsumerGroupMessage>,
}

impl ClaimWorker {
    pub fn new(
        key: ConsumeKey,
        handlers: Vec<Handler>,
        output: flume::Sender<ConsumerGroupMessage>,
    ) -> Self {
        Self {
            key,
            handlers,
            output,
        }
    }

    /// Returns `false` when the session ended before the message was queued.
    async fn deliver(&self, session: &ClaimSession, record: &Record) -> bool {
        let msg = ConsumerGroupMessage {
            topic: record.topic.clone(),
            group: self.key.group.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            payload: record.payload.clone(),
            error: None,
        };

        if self.handlers.is_empty() {
            tokio::select! {
                sent = self.output.send_async(msg) => {
                    if sent.is_err() {
                        warn!(key = %self.key, offset = record.offset, "output queue closed; message dropped");
                    }
                }
                _ = session.cancelled() => return false,
            }
            return true;
        }

        for handler in &self.handlers {
            if let Err(e) = handler(Event::Kafka(msg.clone())).await {
                warn!(
                    key = %self.key,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "kafka handler failed"
                );
            }
        }
        true
    }
}

#[async_trait]
impl ClaimHandler for ClaimWorker {
    async fn consume_claim(&self, session: &ClaimSession, claim: Claim) -> KafkaResult<()> {
        debug!(key = %self.key, partition = claim.partition, "claim started");
        loop {
            tokio::select! {
                received = claim.messages.recv_async() => {
                    let Ok(record) = received else {
                        return Ok(());
                    };
                    if !self.deliver(session, &record).await {
                        return Ok(());
                    }
                    session.mark_message(&record);
                }
                _ = session.cancelled() => {
                    debug!(key = %self.key, partition = claim.partition, "claim session done");
                    return Ok(());
                }
            }
        }
    }
}
