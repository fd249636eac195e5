//! Conversion between host records and Rhai values.
//!
//! Inbound requests become `#{Method, Host, Url, Query, Header, Body}` maps,
//! Kafka messages become `#{Topic, Group, Partition, Offset, Key, Payload}`.
//! Handler results are read back leniently: `status`/`header`/`body` in
//! lower case or capitalised, a missing status meaning 200.

use std::collections::BTreeMap;

use rhai::{Dynamic, Map};
use tigerbalm_kernel::{ConsumerGroupMessage, Request, Response};

use crate::error::{PluginError, PluginResult};

// ============================================================================
// Generic helpers
// ============================================================================

/// Convert JSON Value to Rhai Dynamic
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        serde_json::Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

/// Convert Rhai Dynamic to JSON Value. Values with no JSON form become
/// their display string.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_unit() {
        serde_json::Value::Null
    } else if let Ok(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        serde_json::json!(i)
    } else if let Ok(f) = value.as_float() {
        serde_json::json!(f)
    } else if let Some(s) = as_string(value) {
        serde_json::Value::String(s)
    } else if value.is_array() {
        let arr = value.clone().cast::<rhai::Array>();
        serde_json::Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.clone().cast::<Map>();
        let obj = map
            .iter()
            .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
            .collect();
        serde_json::Value::Object(obj)
    } else {
        serde_json::Value::String(value.to_string())
    }
}

/// The string inside `value`, if it holds one.
pub fn as_string(value: &Dynamic) -> Option<String> {
    if value.is_string() {
        value.clone().into_string().ok()
    } else {
        None
    }
}

/// Look a key up under its lower-case or capitalised spelling.
pub fn field<'a>(map: &'a Map, lower: &str, upper: &str) -> Option<&'a Dynamic> {
    map.get(lower)
        .filter(|v| !v.is_unit())
        .or_else(|| map.get(upper).filter(|v| !v.is_unit()))
}

pub fn string_map_to_dynamic(values: &BTreeMap<String, String>) -> Dynamic {
    let map: Map = values
        .iter()
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect();
    Dynamic::from(map)
}

/// Flatten a script map into string pairs. Strings are taken as they are,
/// other scalars by display, units and nested values are skipped.
pub fn dynamic_to_string_map(value: &Dynamic) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(map) = value.clone().try_cast::<Map>() else {
        return out;
    };
    for (k, v) in map {
        if let Some(s) = as_string(&v) {
            out.insert(k.to_string(), s);
        } else if v.is_int() || v.is_float() || v.is_bool() || v.is_char() {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

// ============================================================================
// Inbound
// ============================================================================

pub fn request_to_dynamic(req: &Request) -> Dynamic {
    let mut map = Map::new();
    map.insert("Method".into(), Dynamic::from(req.method.clone()));
    map.insert("Host".into(), Dynamic::from(req.host.clone()));
    map.insert("Url".into(), Dynamic::from(req.url.clone()));
    map.insert("Query".into(), string_map_to_dynamic(&req.query));
    map.insert("Header".into(), string_map_to_dynamic(&req.header));
    map.insert("Body".into(), Dynamic::from(req.body.clone()));
    Dynamic::from(map)
}

pub fn message_to_dynamic(msg: &ConsumerGroupMessage) -> Dynamic {
    let mut map = Map::new();
    map.insert("Topic".into(), Dynamic::from(msg.topic.clone()));
    map.insert("Group".into(), Dynamic::from(msg.group.clone()));
    map.insert("Partition".into(), Dynamic::from(i64::from(msg.partition)));
    map.insert("Offset".into(), Dynamic::from(msg.offset));
    let key = match &msg.key {
        Some(key) => Dynamic::from(String::from_utf8_lossy(key).into_owned()),
        None => Dynamic::UNIT,
    };
    map.insert("Key".into(), key);
    map.insert("Payload".into(), Dynamic::from(msg.payload_str().into_owned()));
    Dynamic::from(map)
}

// ============================================================================
// Outbound
// ============================================================================

/// Read a handler result into a [`Response`].
///
/// `()` is an empty 200. A bare string is used as the body. A map supplies
/// `status`, `header` and `body`; `Content-Length` is always removed.
pub fn dynamic_to_response(value: Dynamic) -> PluginResult<Response> {
    if value.is_unit() {
        return Ok(Response::new(200));
    }
    if let Some(body) = as_string(&value) {
        return Ok(Response::new(200).with_body(body));
    }
    let Some(map) = value.clone().try_cast::<Map>() else {
        return Err(PluginError::InvalidResult(format!(
            "expected a map, got {}",
            value.type_name()
        )));
    };

    let status = match field(&map, "status", "Status") {
        None => 200,
        Some(v) => {
            let code = v.as_int().map_err(|t| {
                PluginError::InvalidResult(format!("status must be an integer, got {t}"))
            })?;
            u16::try_from(code)
                .ok()
                .filter(|c| (100..=999).contains(c))
                .ok_or_else(|| PluginError::InvalidResult(format!("status {code} out of range")))?
        }
    };

    let mut rsp = Response::new(status);
    if let Some(header) = field(&map, "header", "Header") {
        rsp.header = dynamic_to_string_map(header);
    }
    rsp.body = match field(&map, "body", "Body") {
        None => String::new(),
        Some(body) => match as_string(body) {
            Some(s) => s,
            None if body.is_map() || body.is_array() => dynamic_to_json(body).to_string(),
            None => body.to_string(),
        },
    };
    rsp.strip_content_length();
    Ok(rsp)
}
