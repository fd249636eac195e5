//! librdkafka backend.
//!
//! Offsets are stored explicitly on mark (`enable.auto.offset.store=false`)
//! and committed by the client's auto-commit timer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tigerbalm_kernel::ProducerMessage;
use tigerbalm_kernel::config::{Compression, KafkaConfig, OffsetsInitial, RequiredAcks};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{
    Claim, ClaimHandler, ClaimSession, Delivery, GroupClient, GroupConnector, OffsetMarker,
    ProducerClient, ProducerConnector, Record,
};
use crate::error::{KafkaError, KafkaResult};

use super::lanes::{CLAIM_BUFFER, PartitionLanes};

/// Connection, SASL and TLS settings shared by both sides.
fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut cc = ClientConfig::new();
    cc.set("bootstrap.servers", config.brokers.join(","));
    if let Some(version) = &config.version {
        cc.set("broker.version.fallback", version.as_str());
    }

    let protocol = match (config.sasl.is_some(), config.tls.is_some()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SASL_PLAINTEXT",
        (false, true) => "SSL",
        (false, false) => "PLAINTEXT",
    };
    cc.set("security.protocol", protocol);

    if let Some(sasl) = &config.sasl {
        cc.set("sasl.mechanisms", sasl.mechanism.as_str())
            .set("sasl.username", sasl.user.as_str())
            .set("sasl.password", sasl.password.as_str());
    }
    if let Some(tls) = &config.tls {
        if let Some(ca) = &tls.ca {
            cc.set("ssl.ca.location", ca.display().to_string());
        }
        if let Some(cert) = &tls.cert {
            cc.set("ssl.certificate.location", cert.display().to_string());
        }
        if let Some(key) = &tls.key {
            cc.set("ssl.key.location", key.display().to_string());
        }
        if tls.insecure_skip_verify {
            cc.set("enable.ssl.certificate.verification", "false");
        }
    }
    cc
}

// ============================================================================
// Producer
// ============================================================================

pub struct RdProducerConnector {
    config: ClientConfig,
    timeout: Duration,
}

impl RdProducerConnector {
    pub fn new(config: &KafkaConfig) -> Self {
        let p = &config.producer;
        let mut cc = base_config(config);

        let acks = match p.required_acks {
            RequiredAcks::None => "0",
            RequiredAcks::Leader => "1",
            RequiredAcks::All => "all",
        };
        let compression = match p.compression {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        };
        cc.set("acks", acks)
            .set("compression.type", compression)
            .set("message.send.max.retries", p.retry_max.to_string())
            .set("retry.backoff.ms", p.retry_backoff_ms.to_string())
            .set("message.timeout.ms", p.timeout_ms.to_string())
            .set("message.max.bytes", p.max_message_bytes.to_string());

        for (key, value) in [
            ("batch.size", p.flush_bytes as u64),
            ("batch.num.messages", p.flush_messages as u64),
            ("linger.ms", p.flush_frequency_ms),
            ("queue.buffering.max.messages", p.flush_max_messages as u64),
        ] {
            if value > 0 {
                cc.set(key, value.to_string());
            }
        }

        Self {
            config: cc,
            timeout: Duration::from_millis(p.timeout_ms),
        }
    }
}

impl ProducerConnector for RdProducerConnector {
    fn connect(&self) -> KafkaResult<Arc<dyn ProducerClient>> {
        let producer: FutureProducer = self.config.create().map_err(KafkaError::client)?;
        Ok(Arc::new(RdProducer {
            producer,
            timeout: self.timeout,
        }))
    }
}

struct RdProducer {
    producer: FutureProducer,
    timeout: Duration,
}

#[async_trait]
impl ProducerClient for RdProducer {
    async fn send(&self, msg: &ProducerMessage) -> KafkaResult<Delivery> {
        let mut headers = OwnedHeaders::new_with_capacity(msg.headers.len());
        for (key, value) in &msg.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(&msg.topic)
            .payload(msg.payload.as_slice())
            .headers(headers);
        if let Some(key) = &msg.key {
            record = record.key(key.as_slice());
        }
        if let Some(partition) = msg.partition {
            record = record.partition(partition);
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((e, _)) => Err(KafkaError::client(e)),
        }
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        match flushed {
            Ok(Ok(())) => debug!("producer flushed"),
            Ok(Err(e)) => warn!(error = %e, "producer flush failed"),
            Err(e) => warn!(error = %e, "producer flush task failed"),
        }
    }
}

// ============================================================================
// Consumer group
// ============================================================================

pub struct RdGroupConnector {
    config: ClientConfig,
}

impl RdGroupConnector {
    pub fn new(config: &KafkaConfig) -> Self {
        let c = &config.consumer;
        let mut cc = base_config(config);
        let reset = match c.offsets_initial {
            OffsetsInitial::Newest => "latest",
            OffsetsInitial::Oldest => "earliest",
        };
        cc.set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", reset)
            .set("session.timeout.ms", c.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", c.heartbeat_interval_ms.to_string());
        Self { config: cc }
    }
}

#[async_trait]
impl GroupConnector for RdGroupConnector {
    async fn connect(&self, group: &str) -> KafkaResult<Arc<dyn GroupClient>> {
        let mut cc = self.config.clone();
        cc.set("group.id", group);
        let consumer: StreamConsumer = cc.create().map_err(KafkaError::client)?;
        Ok(Arc::new(RdGroupClient {
            consumer: Arc::new(consumer),
            closed: CancellationToken::new(),
        }))
    }
}

struct RdMarker {
    consumer: Arc<StreamConsumer>,
}

impl OffsetMarker for RdMarker {
    fn mark(&self, topic: &str, partition: i32, offset: i64) {
        if let Err(e) = self.consumer.store_offset(topic, partition, offset) {
            warn!(topic, partition, offset, error = %e, "offset store failed");
        }
    }
}

struct RdGroupClient {
    consumer: Arc<StreamConsumer>,
    closed: CancellationToken,
}

#[async_trait]
impl GroupClient for RdGroupClient {
    async fn consume(&self, topics: &[String], handler: &dyn ClaimHandler) -> KafkaResult<()> {
        if self.closed.is_cancelled() {
            return Err(KafkaError::Closed);
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names).map_err(KafkaError::client)?;

        let marker = Arc::new(RdMarker {
            consumer: self.consumer.clone(),
        });
        let session = ClaimSession::new(self.closed.child_token(), marker);

        // One claim per partition seen; each keeps its partition's order.
        let mut lanes = PartitionLanes::new(CLAIM_BUFFER);
        let mut claims: FuturesUnordered<BoxFuture<'_, KafkaResult<()>>> = FuturesUnordered::new();
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                Some(done) = claims.next(), if !claims.is_empty() => {
                    if let Err(e) = done {
                        warn!(error = %e, "claim ended with error");
                    }
                }
                _ = lanes.release(), if lanes.is_blocked() => {}
                received = self.consumer.recv(), if !lanes.is_blocked() => match received {
                    Ok(msg) => {
                        let record = Record {
                            topic: msg.topic().to_string(),
                            partition: msg.partition(),
                            offset: msg.offset(),
                            key: msg.key().map(<[u8]>::to_vec),
                            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        };
                        lanes.route(record, |first, messages| {
                            claims.push(handler.consume_claim(
                                &session,
                                Claim {
                                    topic: first.topic.clone(),
                                    partition: first.partition,
                                    messages,
                                },
                            ));
                        });
                    }
                    Err(e) => {
                        outcome = Err(KafkaError::client(e));
                        break;
                    }
                },
            }
        }

        lanes.close();
        while let Some(done) = claims.next().await {
            if let Err(e) = done {
                warn!(error = %e, "claim ended with error");
            }
        }
        self.consumer.unsubscribe();
        outcome
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
