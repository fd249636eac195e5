//! Producer capability (`require("kafka")`).

use std::sync::Arc;

use rhai::{Dynamic, Map};
use tigerbalm_kernel::{MessageSink, ProducerMessage};
use tracing::warn;

use crate::marshal::{as_string, dynamic_to_json, dynamic_to_string_map, field};

/// Enqueues script messages on the host producer.
#[derive(Clone)]
pub struct ProduceCapability {
    sink: Arc<dyn MessageSink>,
}

impl ProduceCapability {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    /// `#{Topic, Payload, Key?, Header?}` → `true` once queued.
    pub fn produce(&self, fields: &Map) -> bool {
        let msg = match to_message(fields) {
            Ok(msg) => msg,
            Err(reason) => {
                warn!(%reason, "rejected script message");
                return false;
            }
        };
        match self.sink.send_blocking(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "script message not queued");
                false
            }
        }
    }
}

fn to_message(fields: &Map) -> Result<ProducerMessage, String> {
    let topic = field(fields, "topic", "Topic")
        .and_then(as_string)
        .filter(|t| !t.is_empty())
        .ok_or("message has no Topic")?;
    let payload = match field(fields, "payload", "Payload") {
        Some(p) => match as_string(p) {
            Some(s) => s,
            None if p.is_map() || p.is_array() => dynamic_to_json(p).to_string(),
            None => p.to_string(),
        },
        None => return Err("message has no Payload".into()),
    };

    let mut msg = ProducerMessage::new(topic, payload);
    if let Some(key) = field(fields, "key", "Key") {
        msg.key = Some(as_string(key).unwrap_or_else(|| key.to_string()).into_bytes());
    }
    if let Some(headers) = field(fields, "header", "Header") {
        for (k, v) in dynamic_to_string_map(headers) {
            msg = msg.with_header(k, v);
        }
    }
    Ok(msg)
}
