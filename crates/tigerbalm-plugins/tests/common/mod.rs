//! Shared fixtures for the plugin runtime integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tigerbalm_kernel::config::{HttpClientConfig, PluginConfig, PluginLogConfig, Rotation};
use tigerbalm_kernel::message::SinkClosed;
use tigerbalm_kernel::{
    BusError, BusResult, DispatchResult, Event, Handler, IntoBusReport, LogLevel, MatchArg,
    MessageSink, ProducerMessage, Reply, Slot, SlotBus, SlotType, string_matches,
};
use tigerbalm_plugins::capability::HttpCapability;
use tigerbalm_plugins::{CapabilityBroker, LoggerFactory, PluginManager};

// ============================================================================
// Test slot
// ============================================================================

/// A slot keyed by two string matches that records what it holds.
pub struct PairSlot {
    slot_type: SlotType,
    handlers: Mutex<HashMap<(String, String), Handler>>,
}

impl PairSlot {
    pub fn new(slot_type: SlotType) -> Arc<Self> {
        Arc::new(Self {
            slot_type,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    pub fn contains(&self, a: &str, b: &str) -> bool {
        self.handlers
            .lock()
            .contains_key(&(a.to_string(), b.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn handler(&self, a: &str, b: &str) -> Option<Handler> {
        self.handlers
            .lock()
            .get(&(a.to_string(), b.to_string()))
            .cloned()
    }

    /// Run whatever is bound under `(a, b)`.
    pub async fn dispatch(&self, a: &str, b: &str, event: Event) -> Option<DispatchResult<Reply>> {
        let handler = self.handler(a, b)?;
        Some(handler(event).await)
    }
}

#[async_trait]
impl Slot for PairSlot {
    fn slot_type(&self) -> SlotType {
        self.slot_type
    }

    async fn add_handler(&self, handler: Handler, matches: &[MatchArg]) -> BusResult<()> {
        let Some([a, b]) = string_matches::<2>(self.slot_type, matches) else {
            return Ok(());
        };
        let key = (a.to_string(), b.to_string());
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&key) {
            return Err(BusError::duplicate(self.slot_type, format!("{a} {b}"))).into_report();
        }
        handlers.insert(key, handler);
        Ok(())
    }

    async fn del_handler(&self, matches: &[MatchArg]) -> BusResult<()> {
        if let Some([a, b]) = string_matches::<2>(self.slot_type, matches) {
            self.handlers.lock().remove(&(a.to_string(), b.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Producer sink
// ============================================================================

#[derive(Default)]
pub struct VecSink {
    pub sent: Mutex<Vec<ProducerMessage>>,
}

impl MessageSink for VecSink {
    fn send_blocking(&self, msg: ProducerMessage) -> Result<(), SinkClosed> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: PluginManager,
    pub http: Arc<PairSlot>,
    pub kafka: Arc<PairSlot>,
    pub sink: Arc<VecSink>,
    pub loggers: Arc<LoggerFactory>,
    pub dir: tempfile::TempDir,
}

pub fn plugin_config(dir: &Path) -> PluginConfig {
    PluginConfig {
        path: dir.join("plugins"),
        log: PluginLogConfig {
            path: dir.join("logs"),
            level: LogLevel::Trace,
            rotation: Rotation::Never,
            max_files: 0,
        },
        ..PluginConfig::default()
    }
}

/// Manager over a bus with HTTP and (optionally) Kafka test slots.
pub fn harness(with_kafka: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = plugin_config(dir.path());
    std::fs::create_dir_all(&config.path).unwrap();

    let bus = Arc::new(SlotBus::new());
    let http = PairSlot::new(SlotType::Http);
    let kafka = PairSlot::new(SlotType::Kafka);
    bus.add_slot(http.clone());
    if with_kafka {
        bus.add_slot(kafka.clone());
    }

    let sink = Arc::new(VecSink::default());
    let loggers = Arc::new(LoggerFactory::new(config.log.clone()));
    let client = HttpCapability::new(&HttpClientConfig::default()).unwrap();
    let broker = CapabilityBroker::new(client, loggers.clone()).with_producer(sink.clone());

    Harness {
        manager: PluginManager::new(config, bus, Arc::new(broker)),
        http,
        kafka,
        sink,
        loggers,
        dir,
    }
}

/// A plugin serving `method path` with a fixed body.
pub fn route_script(method: &str, path: &str, body: &str) -> String {
    format!(
        r#"
        fn register() {{
            #{{ route: #{{ "match": #{{ method: "{method}", path: "{path}" }}, handler: Fn("on_http") }} }}
        }}

        fn on_http(req) {{
            #{{ status: 200, body: "{body}" }}
        }}
        "#
    )
}
