//! Outbound HTTP capability (`require("http")`).

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use rhai::{Dynamic, Map};
use tigerbalm_kernel::Response;
use tigerbalm_kernel::config::HttpClientConfig;
use tracing::{debug, warn};
use url::Url;

use crate::error::{PluginError, PluginResult};
use crate::marshal::{as_string, dynamic_to_string_map, field, string_map_to_dynamic};

/// Stateless HTTP client handed to scripts. Cloning shares the connection
/// pool.
#[derive(Clone, Debug)]
pub struct HttpCapability {
    client: reqwest::Client,
}

impl HttpCapability {
    pub fn new(config: &HttpClientConfig) -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PluginError::InterpreterUnavailable(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Script entry point: any failure becomes `()`.
    pub fn call(&self, fields: &Map) -> Dynamic {
        match self.execute(fields) {
            Ok(rsp) => response_to_dynamic(&rsp),
            Err(e) => {
                warn!(error = %e, "outbound http request failed");
                Dynamic::UNIT
            }
        }
    }

    /// Run the request described by `fields` and wait for it. A body that is
    /// not UTF-8 is an error, never a lossy string.
    ///
    /// Blocks the calling thread, so it must run on the interpreter's
    /// blocking thread inside a tokio runtime.
    pub fn execute(&self, fields: &Map) -> Result<Response, String> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| format!("no runtime for outbound request: {e}"))?;
        let request = self.build(fields)?;
        debug!(method = %request.method(), url = %request.url(), "outbound http request");

        let client = self.client.clone();
        handle.block_on(async move {
            let rsp = client.execute(request).await.map_err(|e| e.to_string())?;
            let status = rsp.status().as_u16();
            let mut header = BTreeMap::new();
            for (name, value) in rsp.headers() {
                if let Ok(value) = value.to_str() {
                    header
                        .entry(name.as_str().to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
            let bytes = rsp.bytes().await.map_err(|e| e.to_string())?;
            let body = String::from_utf8(bytes.to_vec())
                .map_err(|_| format!("response body from {status} is not UTF-8"))?;
            Ok(Response {
                status,
                header,
                body,
            })
        })
    }

    fn build(&self, fields: &Map) -> Result<reqwest::Request, String> {
        let method = match field(fields, "method", "Method").and_then(as_string) {
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|e| format!("bad method {m:?}: {e}"))?,
            None => Method::GET,
        };
        let host = field(fields, "host", "Host")
            .and_then(as_string)
            .filter(|h| !h.is_empty())
            .ok_or("request has no Host")?;
        let path = field(fields, "path", "Path")
            .and_then(as_string)
            .unwrap_or_default();

        let mut url = Url::parse(&join_url(&host, &path)).map_err(|e| e.to_string())?;
        if let Some(query) = field(fields, "query", "Query") {
            let query = dynamic_to_string_map(query);
            if !query.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (k, v) in &query {
                    pairs.append_pair(k, v);
                }
            }
        }

        let mut builder = self.client.request(method, url);
        if let Some(header) = field(fields, "header", "Header") {
            for (k, v) in dynamic_to_string_map(header) {
                builder = builder.header(k, v);
            }
        }
        if let Some(body) = field(fields, "body", "Body") {
            builder = builder.body(as_string(body).unwrap_or_else(|| body.to_string()));
        }
        builder.build().map_err(|e| e.to_string())
    }
}

fn join_url(host: &str, path: &str) -> String {
    let base = if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", host.trim_end_matches('/'))
    };
    if path.is_empty() || path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// `#{Status, Header, Body}` as returned to scripts.
pub fn response_to_dynamic(rsp: &Response) -> Dynamic {
    let mut map = Map::new();
    map.insert("Status".into(), Dynamic::from(i64::from(rsp.status)));
    map.insert("Header".into(), string_map_to_dynamic(&rsp.header));
    map.insert("Body".into(), Dynamic::from(rsp.body.clone()));
    Dynamic::from(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("localhost:1234", "/a"), "http://localhost:1234/a");
        assert_eq!(join_url("https://api.example.com/", "v1"), "https://api.example.com/v1");
        assert_eq!(join_url("h", ""), "http://h");
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let cap = HttpCapability::with_client(reqwest::Client::new());
        assert!(cap.build(&Map::new()).is_err());
    }

    #[test]
    fn test_build_sets_method_query_and_headers() {
        let cap = HttpCapability::with_client(reqwest::Client::new());
        let mut query = Map::new();
        query.insert("id".into(), Dynamic::from("7"));
        let mut header = Map::new();
        header.insert("X-Token".into(), Dynamic::from("t"));
        let mut fields = Map::new();
        fields.insert("Method".into(), Dynamic::from("post"));
        fields.insert("Host".into(), Dynamic::from("127.0.0.1:9"));
        fields.insert("Path".into(), Dynamic::from("/users"));
        fields.insert("Query".into(), Dynamic::from(query));
        fields.insert("Header".into(), Dynamic::from(header));
        fields.insert("Body".into(), Dynamic::from("{}"));

        let req = cap.build(&fields).unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "http://127.0.0.1:9/users?id=7");
        assert_eq!(req.headers()["x-token"], "t");
    }

    #[test]
    fn test_call_outside_runtime_yields_unit() {
        let cap = HttpCapability::with_client(reqwest::Client::new());
        let mut fields = Map::new();
        fields.insert("Host".into(), Dynamic::from("127.0.0.1:9"));
        assert!(cap.call(&fields).is_unit());
    }
}
