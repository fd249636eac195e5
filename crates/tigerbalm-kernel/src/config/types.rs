use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::LogLevel;

/// Root of the host configuration. Every section has defaults, so an empty
/// document is a valid (if not very useful) configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TigerbalmConfig {
    pub web: WebConfig,
    pub plugin: PluginConfig,
    pub log: LogConfig,
    pub http_client: HttpClientConfig,
    pub kafka: KafkaConfig,
    /// Values exposed to scripts through `require("env")`.
    pub env: Vec<EnvVar>,
}

// ============================================================================
// HTTP listener
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub addr: String,
    /// Inbound bodies larger than this are rejected with 400.
    pub max_body_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Plugins
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory scanned at startup.
    pub path: PathBuf,
    /// Directory watched for hot reload. Watching is off when unset.
    pub watch_path: Option<PathBuf>,
    /// Script file extension, without the dot.
    pub extension: String,
    /// Events for the same file closer together than this are collapsed.
    pub debounce_ms: u64,
    pub sandbox: SandboxConfig,
    pub log: PluginLogConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plugins"),
            watch_path: None,
            extension: "rhai".to_string(),
            debounce_ms: 200,
            sandbox: SandboxConfig::default(),
            log: PluginLogConfig::default(),
        }
    }
}

/// Limits applied to every interpreter instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_call_levels: usize,
    /// Operation budget per call; `0` is unlimited.
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_call_levels: 64,
            max_operations: 0,
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Per-plugin rotating log sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginLogConfig {
    pub path: PathBuf,
    pub level: LogLevel,
    pub rotation: Rotation,
    /// Rotated files kept per plugin; `0` keeps everything.
    pub max_files: usize,
}

impl Default for PluginLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/plugins"),
            level: LogLevel::Info,
            rotation: Rotation::Daily,
            max_files: 7,
        }
    }
}

// ============================================================================
// Host log
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Log file; stdout when unset.
    pub file: Option<PathBuf>,
    pub rotation: Rotation,
    pub max_files: usize,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
            rotation: Rotation::Daily,
            max_files: 7,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// ============================================================================
// Outbound HTTP capability
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

// ============================================================================
// Kafka
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub enabled: bool,
    pub backend: KafkaBackend,
    pub brokers: Vec<String>,
    /// Broker protocol version hint passed to the client.
    pub version: Option<String>,
    pub sasl: Option<SaslConfig>,
    pub tls: Option<TlsConfig>,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: KafkaBackend::Memory,
            brokers: vec!["127.0.0.1:9092".to_string()],
            version: None,
            sasl: None,
            tls: None,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KafkaBackend {
    /// In-process broker; nothing leaves the host.
    #[default]
    Memory,
    /// librdkafka client (requires the `rdkafka` feature of `tigerbalm-kafka`).
    Rdkafka,
}

/// SASL/PLAIN credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslConfig {
    pub user: String,
    pub password: String,
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Capacity of the shared input channel.
    pub queue: usize,
    /// Intake workers moving the shared input into per-topic channels.
    pub concurrency: usize,
    /// Capacity of each per-topic channel.
    pub topic_queue: usize,
    /// Workers per topic.
    pub topic_concurrency: usize,
    /// One client per topic instead of one shared client.
    pub unshare: bool,
    pub required_acks: RequiredAcks,
    pub compression: Compression,
    pub flush_bytes: usize,
    pub flush_messages: usize,
    pub flush_frequency_ms: u64,
    pub flush_max_messages: usize,
    pub retry_max: usize,
    pub retry_backoff_ms: u64,
    pub timeout_ms: u64,
    pub max_message_bytes: usize,
    /// Honour `ProducerMessage::partition` instead of hashing the key.
    pub manual_partition: bool,
    pub return_successes: bool,
    pub return_errors: bool,
    /// Queue and worker overrides for named topics.
    pub topics: BTreeMap<String, TopicConfig>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue: 1024,
            concurrency: 1,
            topic_queue: 1024 * 1024,
            topic_concurrency: 10,
            unshare: false,
            required_acks: RequiredAcks::Leader,
            compression: Compression::None,
            flush_bytes: 0,
            flush_messages: 0,
            flush_frequency_ms: 0,
            flush_max_messages: 0,
            retry_max: 3,
            retry_backoff_ms: 100,
            timeout_ms: 10_000,
            max_message_bytes: 1_000_000,
            manual_partition: false,
            return_successes: false,
            return_errors: true,
            topics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub queue: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    None,
    #[default]
    Leader,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Capacity of the shared output queue.
    pub queue: usize,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub offsets_initial: OffsetsInitial,
    /// Pause after a failed consume iteration before joining again.
    pub retry_backoff_ms: u64,
    pub return_errors: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: 1024,
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            offsets_initial: OffsetsInitial::Newest,
            retry_backoff_ms: 2_000,
            return_errors: true,
        }
    }
}

/// Where a group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetsInitial {
    #[default]
    Newest,
    Oldest,
}

// ============================================================================
// Script environment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}
