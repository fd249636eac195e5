//! HTTP request and response records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Header stripped from script responses so the transport recomputes it.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Inbound HTTP request as seen by a plugin handler.
///
/// `Url` carries the path only. `Query` and `Header` are flattened to the
/// first value per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub method: String,
    pub host: String,
    pub url: String,
    pub query: BTreeMap<String, String>,
    pub header: BTreeMap<String, String>,
    pub body: String,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header unless one with the same name is already present.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert_query(name, value);
        self
    }

    /// Keep the first value seen for `name`.
    pub fn insert_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.header.entry(name.into()).or_insert_with(|| value.into());
    }

    /// Keep the first value seen for `name`.
    pub fn insert_query(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query.entry(name.into()).or_insert_with(|| value.into());
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(&self.method, &self.url)
    }
}

/// Response produced by a plugin handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub status: u16,
    pub header: BTreeMap<String, String>,
    pub body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            header: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(name.into(), value.into());
        self
    }

    /// Remove every `Content-Length` entry, whatever its case.
    pub fn strip_content_length(&mut self) {
        self.header
            .retain(|name, _| !name.eq_ignore_ascii_case(CONTENT_LENGTH));
    }
}

/// Route binding key: upper-cased method plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

impl RouteKey {
    pub fn new(method: impl AsRef<str>, path: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
