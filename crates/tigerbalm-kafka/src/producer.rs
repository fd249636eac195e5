//! Kafka producer.
//!
//! Messages enter through one shared input channel. Intake workers move them
//! into per-topic lanes; the first message for a topic spawns its lane (a
//! channel plus a set of send workers). Send workers report each result on
//! the success or failure channel when the caller asked for it.
//!
//! [`Producer::fini`] closes the input, waits for intake to drain it into the
//! lanes, closes every lane and joins every worker, so nothing accepted before
//! shutdown is lost without a report.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tigerbalm_kernel::config::ProducerConfig;
use tigerbalm_kernel::{MessageSink, ProducerMessage, SinkClosed};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ProducerClient, ProducerConnector};
use crate::error::{KafkaError, KafkaResult};

// ============================================================================
// Options
// ============================================================================

/// Queue size and worker count of one topic lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneOptions {
    pub queue: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Shared input capacity.
    pub queue: usize,
    /// Intake workers.
    pub concurrency: usize,
    /// Lane settings for topics without an override.
    pub topic: LaneOptions,
    pub topics: HashMap<String, LaneOptions>,
    /// One client per topic.
    pub unshare: bool,
    pub manual_partition: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self::from(&ProducerConfig::default())
    }
}

impl From<&ProducerConfig> for ProducerOptions {
    fn from(config: &ProducerConfig) -> Self {
        Self {
            queue: config.queue,
            concurrency: config.concurrency.max(1),
            topic: LaneOptions {
                queue: config.topic_queue,
                concurrency: config.topic_concurrency.max(1),
            },
            topics: config
                .topics
                .iter()
                .map(|(name, t)| {
                    (
                        name.clone(),
                        LaneOptions {
                            queue: t.queue,
                            concurrency: t.concurrency.max(1),
                        },
                    )
                })
                .collect(),
            unshare: config.unshare,
            manual_partition: config.manual_partition,
        }
    }
}

impl ProducerOptions {
    pub fn topic(mut self, name: impl Into<String>, queue: usize, concurrency: usize) -> Self {
        self.topics.insert(
            name.into(),
            LaneOptions {
                queue,
                concurrency: concurrency.max(1),
            },
        );
        self
    }

    fn lane(&self, topic: &str) -> LaneOptions {
        self.topics.get(topic).copied().unwrap_or(self.topic)
    }
}

// ============================================================================
// Producer
// ============================================================================

struct Lane {
    tx: flume::Sender<ProducerMessage>,
    client: Arc<dyn ProducerClient>,
    workers: Vec<JoinHandle<()>>,
}

struct ProducerShared {
    options: ProducerOptions,
    connector: Arc<dyn ProducerConnector>,
    /// Present unless `unshare` is set.
    shared_client: Option<Arc<dyn ProducerClient>>,
    lanes: Mutex<HashMap<String, Lane>>,
    succeeded: Option<flume::Sender<ProducerMessage>>,
    failed: Option<flume::Sender<ProducerMessage>>,
}

/// Handle for enqueueing messages. Stops accepting once the producer is
/// finished.
#[derive(Clone)]
pub struct ProducerInput {
    tx: Arc<RwLock<Option<flume::Sender<ProducerMessage>>>>,
}

impl ProducerInput {
    fn sender(&self) -> Result<flume::Sender<ProducerMessage>, SinkClosed> {
        self.tx.read().clone().ok_or(SinkClosed)
    }

    /// Enqueue from async code, waiting for room.
    pub async fn send(&self, msg: ProducerMessage) -> Result<(), SinkClosed> {
        self.sender()?.send_async(msg).await.map_err(|_| SinkClosed)
    }

    pub fn try_send(&self, msg: ProducerMessage) -> Result<(), SinkClosed> {
        self.sender()?.try_send(msg).map_err(|_| SinkClosed)
    }
}

impl MessageSink for ProducerInput {
    fn send_blocking(&self, msg: ProducerMessage) -> Result<(), SinkClosed> {
        self.sender()?.send(msg).map_err(|_| SinkClosed)
    }
}

pub struct ProducerBuilder {
    connector: Arc<dyn ProducerConnector>,
    options: ProducerOptions,
    succeeded: Option<flume::Sender<ProducerMessage>>,
    failed: Option<flume::Sender<ProducerMessage>>,
}

impl ProducerBuilder {
    pub fn options(mut self, options: ProducerOptions) -> Self {
        self.options = options;
        self
    }

    /// Report every acknowledged message, with partition and offset set.
    pub fn succeeded(mut self, tx: flume::Sender<ProducerMessage>) -> Self {
        self.succeeded = Some(tx);
        self
    }

    /// Report every message that could not be sent, with `error` set.
    pub fn failed(mut self, tx: flume::Sender<ProducerMessage>) -> Self {
        self.failed = Some(tx);
        self
    }

    /// Connect and start intake. Lanes for topics with overrides start
    /// immediately; the rest start on their first message.
    pub fn build(self) -> KafkaResult<Producer> {
        let shared_client = if self.options.unshare {
            None
        } else {
            Some(self.connector.connect()?)
        };

        let shared = Arc::new(ProducerShared {
            options: self.options,
            connector: self.connector,
            shared_client,
            lanes: Mutex::new(HashMap::new()),
            succeeded: self.succeeded,
            failed: self.failed,
        });

        let preset: Vec<String> = shared.options.topics.keys().cloned().collect();
        for topic in preset {
            shared.lane_sender(&topic)?;
        }

        let (tx, rx) = flume::bounded(shared.options.queue);
        let intake = (0..shared.options.concurrency)
            .map(|_| tokio::spawn(shared.clone().intake(rx.clone())))
            .collect();

        info!(
            concurrency = shared.options.concurrency,
            unshare = shared.options.unshare,
            "kafka producer started"
        );
        Ok(Producer {
            shared,
            input: ProducerInput {
                tx: Arc::new(RwLock::new(Some(tx))),
            },
            intake: tokio::sync::Mutex::new(intake),
        })
    }
}

pub struct Producer {
    shared: Arc<ProducerShared>,
    input: ProducerInput,
    intake: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Producer {
    pub fn builder(connector: Arc<dyn ProducerConnector>) -> ProducerBuilder {
        ProducerBuilder {
            connector,
            options: ProducerOptions::default(),
            succeeded: None,
            failed: None,
        }
    }

    pub fn input(&self) -> ProducerInput {
        self.input.clone()
    }

    /// Topics with a running lane.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.lanes.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drain and stop. Idempotent.
    pub async fn fini(&self) {
        self.input.tx.write().take();

        let intake: Vec<_> = self.intake.lock().await.drain(..).collect();
        for task in intake {
            if let Err(e) = task.await {
                warn!(error = %e, "producer intake task failed");
            }
        }

        let lanes: Vec<(String, Lane)> = self.shared.lanes.lock().drain().collect();
        let mut clients = Vec::new();
        for (topic, lane) in lanes {
            drop(lane.tx);
            for worker in lane.workers {
                if let Err(e) = worker.await {
                    warn!(%topic, error = %e, "producer worker failed");
                }
            }
            if self.shared.options.unshare {
                clients.push(lane.client);
            }
        }
        if let Some(client) = &self.shared.shared_client {
            clients.push(client.clone());
        }
        for client in clients {
            client.close().await;
        }
        debug!("kafka producer finished");
    }
}

impl ProducerShared {
    /// Move the shared input into topic lanes until the input closes.
    async fn intake(self: Arc<Self>, rx: flume::Receiver<ProducerMessage>) {
        while let Ok(mut msg) = rx.recv_async().await {
            if !self.options.manual_partition {
                msg.partition = None;
            }
            match self.lane_sender(&msg.topic) {
                Ok(tx) => {
                    if let Err(flume::SendError(msg)) = tx.send_async(msg).await {
                        self.report_failure(msg, &KafkaError::Closed).await;
                    }
                }
                Err(e) => self.report_failure(msg, &e).await,
            }
        }
    }

    fn lane_sender(self: &Arc<Self>, topic: &str) -> KafkaResult<flume::Sender<ProducerMessage>> {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get(topic) {
            return Ok(lane.tx.clone());
        }

        let client = match &self.shared_client {
            Some(client) => client.clone(),
            None => self.connector.connect()?,
        };
        let opts = self.options.lane(topic);
        let (tx, rx) = flume::bounded(opts.queue);
        let workers = (0..opts.concurrency)
            .map(|_| tokio::spawn(self.clone().send_loop(client.clone(), rx.clone())))
            .collect();
        debug!(%topic, queue = opts.queue, concurrency = opts.concurrency, "topic lane started");

        lanes.insert(
            topic.to_string(),
            Lane {
                tx: tx.clone(),
                client,
                workers,
            },
        );
        Ok(tx)
    }

    async fn send_loop(
        self: Arc<Self>,
        client: Arc<dyn ProducerClient>,
        rx: flume::Receiver<ProducerMessage>,
    ) {
        while let Ok(mut msg) = rx.recv_async().await {
            match client.send(&msg).await {
                Ok(delivery) => {
                    if let Some(tx) = &self.succeeded {
                        msg.partition = Some(delivery.partition);
                        msg.offset = Some(delivery.offset);
                        if tx.send_async(msg).await.is_err() {
                            debug!("success channel closed");
                        }
                    }
                }
                Err(e) => self.report_failure(msg, &e).await,
            }
        }
    }

    async fn report_failure(&self, mut msg: ProducerMessage, error: &KafkaError) {
        match &self.failed {
            Some(tx) => {
                msg.error = Some(error.to_string());
                if tx.send_async(msg).await.is_err() {
                    debug!("failure channel closed");
                }
            }
            None => warn!(topic = %msg.topic, %error, "kafka message not delivered"),
        }
    }
}
