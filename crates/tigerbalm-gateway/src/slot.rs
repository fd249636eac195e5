//! HTTP slot.
//!
//! The slot keeps a `(METHOD, path) -> handler` table and serves it through
//! an axum fallback, so plugins can bind and unbind routes while the router
//! keeps running. Bus match arguments are `[method, path]`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response as AxumResponse};
use parking_lot::RwLock;
use serde_json::json;
use tigerbalm_kernel::{
    BusError, BusResult, DispatchError, Event, Handler, IntoBusReport, MatchArg, Reply, Request,
    Response, RouteKey, Slot, SlotType, string_matches,
};
use tracing::{debug, warn};

/// Route table served over HTTP.
#[derive(Default)]
pub struct HttpSlot {
    routes: RwLock<HashMap<RouteKey, Handler>>,
}

impl HttpSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `method path`. Fails if the key is taken.
    pub fn register(&self, method: &str, path: &str, handler: Handler) -> BusResult<()> {
        let key = RouteKey::new(method, path);
        let mut routes = self.routes.write();
        if routes.contains_key(&key) {
            return Err(BusError::duplicate(SlotType::Http, key.to_string())).into_report();
        }
        debug!(route = %key, "route bound");
        routes.insert(key, handler);
        Ok(())
    }

    /// Remove the binding for `method path`, if any.
    pub fn deregister(&self, method: &str, path: &str) -> bool {
        let key = RouteKey::new(method, path);
        let removed = self.routes.write().remove(&key).is_some();
        if removed {
            debug!(route = %key, "route unbound");
        }
        removed
    }

    pub fn contains(&self, method: &str, path: &str) -> bool {
        self.routes.read().contains_key(&RouteKey::new(method, path))
    }

    /// Bound routes, sorted.
    pub fn routes(&self) -> Vec<RouteKey> {
        let mut keys: Vec<RouteKey> = self.routes.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lookup(&self, key: &RouteKey) -> Option<Handler> {
        self.routes.read().get(key).cloned()
    }

    /// Router serving every bound route. Bodies over `max_body_bytes` are
    /// rejected with 400.
    pub fn router(self: &Arc<Self>, max_body_bytes: usize) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(DefaultBodyLimit::max(max_body_bytes))
            .with_state(self.clone())
    }
}

#[async_trait]
impl Slot for HttpSlot {
    fn slot_type(&self) -> SlotType {
        SlotType::Http
    }

    async fn add_handler(&self, handler: Handler, matches: &[MatchArg]) -> BusResult<()> {
        let Some([method, path]) = string_matches::<2>(SlotType::Http, matches) else {
            return Ok(());
        };
        self.register(method, path, handler)
    }

    async fn del_handler(&self, matches: &[MatchArg]) -> BusResult<()> {
        if let Some([method, path]) = string_matches::<2>(SlotType::Http, matches) {
            self.deregister(method, path);
        }
        Ok(())
    }
}

async fn dispatch(
    State(slot): State<Arc<HttpSlot>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AxumResponse {
    let key = RouteKey::new(method.as_str(), uri.path());
    let Some(handler) = slot.lookup(&key) else {
        return error_response(StatusCode::NOT_FOUND, &DispatchError::NotFound(key.to_string()));
    };

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(route = %key, error = %rejection, "request body rejected");
            return error_response(
                StatusCode::BAD_REQUEST,
                &DispatchError::BadRequest(rejection.body_text()),
            );
        }
    };

    let req = match to_request(&method, &uri, &headers, &body) {
        Ok(req) => req,
        Err(e) => {
            debug!(route = %key, error = %e, "request rejected");
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };
    match handler(Event::Http(req)).await {
        Ok(Reply::Http(rsp)) => into_response(rsp),
        Ok(Reply::Done) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(route = %key, error = %e, "http handler failed");
            error_response(status_for(&e), &e)
        }
    }
}

fn status_for(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: &DispatchError) -> AxumResponse {
    let body = Json(json!({
        "error": {
            "code": status.as_u16(),
            "message": error.to_string(),
        }
    }));
    (status, body).into_response()
}

/// Build the handler's view of an inbound request.
///
/// Scripts see the body and header values as strings, so bytes that are not
/// UTF-8 are rejected rather than rewritten.
pub fn to_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Request, DispatchError> {
    let body = std::str::from_utf8(body)
        .map_err(|e| DispatchError::BadRequest(format!("request body is not UTF-8: {e}")))?;
    let host = match headers.get(HOST) {
        Some(value) => header_text(HOST.as_str(), value)?.to_string(),
        None => uri.authority().map(|a| a.to_string()).unwrap_or_default(),
    };

    let mut req = Request::new(method.as_str(), uri.path())
        .with_host(host)
        .with_body(body);
    if let Some(query) = uri.query() {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            req.insert_query(name, value);
        }
    }
    for (name, value) in headers {
        let value = header_text(name.as_str(), value)?;
        req.insert_header(canonical_header_name(name.as_str()), value);
    }
    Ok(req)
}

fn header_text<'a>(name: &str, value: &'a HeaderValue) -> Result<&'a str, DispatchError> {
    std::str::from_utf8(value.as_bytes())
        .map_err(|_| DispatchError::BadRequest(format!("header {name} is not UTF-8")))
}

/// `x-request-id` becomes `X-Request-Id`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Turn a handler's response into an HTTP response. `Content-Length` is
/// left to the transport.
pub fn into_response(mut rsp: Response) -> AxumResponse {
    rsp.strip_content_length();
    let status = match StatusCode::from_u16(rsp.status) {
        Ok(status) => status,
        Err(_) => {
            warn!(status = rsp.status, "handler returned an invalid status");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut out = (status, rsp.body).into_response();
    let headers = out.headers_mut();
    for (name, value) in &rsp.header {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid response header"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("HOST"), "Host");
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
    }

    #[test]
    fn test_to_request_flattens_query_and_headers() {
        let uri: Uri = "/search?q=rust&q=go&page=2&name=a%20b".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.append("x-tag", HeaderValue::from_static("one"));
        headers.append("x-tag", HeaderValue::from_static("two"));

        let req = to_request(&Method::GET, &uri, &headers, b"payload").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.url, "/search");
        assert_eq!(req.query.get("q").map(String::as_str), Some("rust"));
        assert_eq!(req.query.get("page").map(String::as_str), Some("2"));
        assert_eq!(req.query.get("name").map(String::as_str), Some("a b"));
        assert_eq!(req.header.get("X-Tag").map(String::as_str), Some("one"));
        assert_eq!(req.body, "payload");
    }

    #[test]
    fn test_to_request_rejects_non_utf8() {
        let uri: Uri = "/echo".parse().unwrap();
        let body = to_request(&Method::POST, &uri, &HeaderMap::new(), &[0xff, b'h', b'i']);
        assert!(matches!(body, Err(DispatchError::BadRequest(_))));

        let mut headers = HeaderMap::new();
        headers.insert("x-raw", HeaderValue::from_bytes(&[b'a', 0xff]).unwrap());
        let header = to_request(&Method::POST, &uri, &headers, b"ok");
        assert!(matches!(header, Err(DispatchError::BadRequest(m)) if m.contains("x-raw")));

        let mut headers = HeaderMap::new();
        headers.insert("x-name", HeaderValue::from_bytes("Zoë".as_bytes()).unwrap());
        let req = to_request(&Method::POST, &uri, &headers, "héllo ✓".as_bytes()).unwrap();
        assert_eq!(req.header.get("X-Name").map(String::as_str), Some("Zoë"));
        assert_eq!(req.body, "héllo ✓");
    }

    #[test]
    fn test_into_response_strips_content_length_and_bad_headers() {
        let rsp = Response::new(201)
            .with_header("Content-Length", "999")
            .with_header("X-Kept", "yes")
            .with_header("bad header", "x")
            .with_body("made");
        let out = into_response(rsp);
        assert_eq!(out.status(), StatusCode::CREATED);
        assert_eq!(out.headers().get("x-kept").unwrap(), "yes");
        assert!(out.headers().get("content-length").is_none());
        assert!(out.headers().get("bad header").is_none());
    }

    #[test]
    fn test_invalid_status_is_500() {
        let out = into_response(Response::new(42));
        assert_eq!(out.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_register_rejects_duplicate_key() {
        let slot = HttpSlot::new();
        let handler = tigerbalm_kernel::handler_fn(|_| async { Ok(Reply::Done) });
        slot.register("get", "/a", handler.clone()).unwrap();
        assert!(slot.contains("GET", "/a"));
        assert!(slot.register("GET", "/a", handler).is_err());
        assert!(slot.deregister("GET", "/a"));
        assert!(!slot.deregister("GET", "/a"));
        assert!(slot.routes().is_empty());
    }
}
