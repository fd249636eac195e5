//! Gateway error types

use std::io;

use thiserror::Error;
use tigerbalm_kafka::KafkaError;
use tigerbalm_plugins::{ManagerError, PluginError};

/// Host assembly and serving errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("{0} is not available in this build")]
    Unsupported(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("plugin runtime error: {0}")]
    Plugin(#[from] PluginError),

    #[error("plugin manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
