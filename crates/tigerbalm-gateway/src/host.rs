//! Host assembly.
//!
//! [`Host::build`] wires the bus, the HTTP slot, the Kafka transport when
//! enabled, the capability broker and the plugin manager, then loads the
//! plugin directory. [`Host::serve`] runs the listener; [`Host::fini`] tears
//! everything down in reverse.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
#[cfg(feature = "rdkafka")]
use tigerbalm_kafka::backend::{RdGroupConnector, RdProducerConnector};
use tigerbalm_kafka::client::{GroupConnector, ProducerConnector};
use tigerbalm_kafka::{
    ConsumerGroup, GroupOptions, KafkaSlot, MemoryBroker, Producer, ProducerOptions,
};
use tigerbalm_kernel::config::{KafkaBackend, KafkaConfig, TigerbalmConfig};
use tigerbalm_kernel::{ConsumerGroupMessage, ProducerMessage, SlotBus};
use tigerbalm_plugins::{CapabilityBroker, PluginManager};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::slot::HttpSlot;

struct KafkaParts {
    group: ConsumerGroup,
    producer: Producer,
    memory: Option<MemoryBroker>,
    producer_report: JoinHandle<()>,
    group_report: Option<JoinHandle<()>>,
}

pub struct Host {
    config: TigerbalmConfig,
    bus: Arc<SlotBus>,
    http: Arc<HttpSlot>,
    manager: PluginManager,
    kafka: Option<KafkaParts>,
}

impl Host {
    pub async fn build(config: TigerbalmConfig) -> GatewayResult<Self> {
        let bus = Arc::new(SlotBus::new());
        let http = Arc::new(HttpSlot::new());
        bus.add_slot(http.clone());

        let mut broker = CapabilityBroker::from_config(&config)?;
        let kafka = if config.kafka.enabled {
            let parts = build_kafka(&config.kafka)?;
            bus.add_slot(Arc::new(KafkaSlot::new(parts.group.clone())));
            broker = broker.with_producer(Arc::new(parts.producer.input()));
            Some(parts)
        } else {
            None
        };

        let manager = PluginManager::new(config.plugin.clone(), bus.clone(), Arc::new(broker));
        let loaded = manager.start().await?;
        manager.watch().await?;
        info!(
            plugins = loaded,
            kafka = kafka.is_some(),
            slots = ?bus.slot_types(),
            "host ready"
        );

        Ok(Self {
            config,
            bus,
            http,
            manager,
            kafka,
        })
    }

    pub fn config(&self) -> &TigerbalmConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<SlotBus> {
        &self.bus
    }

    pub fn http(&self) -> &Arc<HttpSlot> {
        &self.http
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn consumer_group(&self) -> Option<&ConsumerGroup> {
        self.kafka.as_ref().map(|k| &k.group)
    }

    /// The in-process broker, when `kafka.backend` is `memory`.
    pub fn memory_broker(&self) -> Option<&MemoryBroker> {
        self.kafka.as_ref().and_then(|k| k.memory.as_ref())
    }

    pub fn router(&self) -> Router {
        self.http.router(self.config.web.max_body_bytes)
    }

    /// Serve HTTP on `web.addr` until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = &self.config.web.addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "http listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("http stopped");
        Ok(())
    }

    /// Stop watching, unload every plugin, then finish the consumer group and
    /// the producer.
    pub async fn fini(self) {
        self.manager.fini().await;
        if let Some(kafka) = self.kafka {
            kafka.group.fini().await;
            if let Some(report) = kafka.group_report {
                report.abort();
            }
            kafka.producer.fini().await;
            drop(kafka.producer);
            if let Err(e) = kafka.producer_report.await {
                warn!(error = %e, "producer report task failed");
            }
        }
        info!("host finished");
    }
}

type Connectors = (
    Arc<dyn ProducerConnector>,
    Arc<dyn GroupConnector>,
    Option<MemoryBroker>,
);

fn connectors(config: &KafkaConfig) -> GatewayResult<Connectors> {
    match config.backend {
        KafkaBackend::Memory => {
            let broker = MemoryBroker::from_config(config);
            let producer: Arc<dyn ProducerConnector> = Arc::new(broker.clone());
            let group: Arc<dyn GroupConnector> = Arc::new(broker.clone());
            Ok((producer, group, Some(broker)))
        }
        #[cfg(feature = "rdkafka")]
        KafkaBackend::Rdkafka => {
            let producer: Arc<dyn ProducerConnector> = Arc::new(RdProducerConnector::new(config));
            let group: Arc<dyn GroupConnector> = Arc::new(RdGroupConnector::new(config));
            Ok((producer, group, None))
        }
        #[cfg(not(feature = "rdkafka"))]
        KafkaBackend::Rdkafka => Err(GatewayError::Unsupported(
            "kafka backend rdkafka (build with the rdkafka feature)".to_string(),
        )),
    }
}

fn build_kafka(config: &KafkaConfig) -> GatewayResult<KafkaParts> {
    let (producer_connector, group_connector, memory) = connectors(config)?;

    let options = GroupOptions::from(&config.consumer);
    let (group, group_report) = if config.consumer.return_errors {
        let (tx, rx) = flume::unbounded();
        let group = ConsumerGroup::with_failed(group_connector, options, tx);
        (group, Some(tokio::spawn(log_consume_failures(rx))))
    } else {
        (ConsumerGroup::new(group_connector, options), None)
    };

    let (failed_tx, failed_rx) = flume::unbounded();
    let producer = Producer::builder(producer_connector)
        .options(ProducerOptions::from(&config.producer))
        .failed(failed_tx)
        .build()?;
    let producer_report = tokio::spawn(log_produce_failures(failed_rx));

    info!(backend = ?config.backend, "kafka transport started");
    Ok(KafkaParts {
        group,
        producer,
        memory,
        producer_report,
        group_report,
    })
}

async fn log_produce_failures(rx: flume::Receiver<ProducerMessage>) {
    while let Ok(msg) = rx.recv_async().await {
        warn!(
            topic = %msg.topic,
            error = msg.error.as_deref().unwrap_or("unknown"),
            "kafka message not delivered"
        );
    }
}

async fn log_consume_failures(rx: flume::Receiver<ConsumerGroupMessage>) {
    while let Ok(msg) = rx.recv_async().await {
        warn!(
            topic = %msg.topic,
            group = %msg.group,
            error = msg.error.as_deref().unwrap_or("unknown"),
            "kafka consume failed"
        );
    }
}
