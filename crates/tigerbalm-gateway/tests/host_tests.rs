//! Host integration tests: plugins loaded from disk, served through the
//! axum router without a socket.

use std::path::Path;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tigerbalm_gateway::{GatewayError, Host};
use tigerbalm_kernel::ProducerMessage;
use tigerbalm_kernel::config::{KafkaBackend, OffsetsInitial, Rotation, TigerbalmConfig};
use tower::ServiceExt;

const ECHO: &str = r#"
    fn register() {
        #{ route: #{ "match": #{ method: "GET", path: "/echo" }, handler: Fn("echo") } }
    }

    fn echo(req) {
        #{ status: 200, body: req.Body }
    }
"#;

const MIRROR: &str = r#"
    fn register() {
        #{ route: #{ "match": #{ method: "POST", path: "/mirror" }, handler: Fn("mirror") } }
    }

    fn mirror(req) {
        let header = req.Header;
        header["Content-Length"] = "999";
        header["X-Name"] = req.Query.name;
        #{ status: 202, header: header, body: req.Body }
    }
"#;

const BROKEN: &str = r#"
    fn register() {
        #{ route: #{ "match": #{ method: "GET", path: "/broken" }, handler: Fn("broken") } }
    }

    fn broken(req) {
        throw "boom";
    }
"#;

const RELAY: &str = r#"
    fn register() {
        #{
            consume: #{
                "match": #{ topic: "orders", group: "billing" },
                handler: |msg| {
                    require("kafka").produce(#{ Topic: "audit", Payload: "seen " + msg.Payload });
                },
            },
        }
    }
"#;

fn config(dir: &Path) -> TigerbalmConfig {
    let mut config = TigerbalmConfig::default();
    config.plugin.path = dir.join("plugins");
    config.plugin.log.path = dir.join("logs");
    config.plugin.log.rotation = Rotation::Never;
    config.web.max_body_bytes = 64;
    config
}

fn kafka_config(dir: &Path) -> TigerbalmConfig {
    let mut config = config(dir);
    config.kafka.enabled = true;
    config.kafka.backend = KafkaBackend::Memory;
    config.kafka.consumer.offsets_initial = OffsetsInitial::Oldest;
    config.kafka.consumer.retry_backoff_ms = 10;
    config
}

fn write_plugins(dir: &Path, plugins: &[(&str, &str)]) {
    let plugins_dir = dir.join("plugins");
    std::fs::create_dir_all(&plugins_dir).unwrap();
    for (name, script) in plugins {
        std::fs::write(plugins_dir.join(format!("{name}.rhai")), script).unwrap();
    }
}

async fn host_with(plugins: &[(&str, &str)]) -> (Host, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    write_plugins(dir.path(), plugins);
    let host = Host::build(config(dir.path())).await.unwrap();
    (host, dir)
}

async fn body_text(rsp: axum::response::Response) -> String {
    let bytes = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_route() {
    let (host, _dir) = host_with(&[("echo", ECHO)]).await;
    assert_eq!(host.manager().names(), vec!["echo".to_string()]);
    assert!(host.http().contains("GET", "/echo"));

    let rsp = host
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/echo")
                .body(Body::from("hi"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(body_text(rsp).await, "hi");
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_route_is_404() {
    let (host, _dir) = host_with(&[("echo", ECHO)]).await;
    for (method, uri) in [("GET", "/missing"), ("POST", "/echo")] {
        let rsp = host
            .router()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND, "{method} {uri}");
    }
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_headers_query_and_body_pass_through() {
    let (host, _dir) = host_with(&[("mirror", MIRROR)]).await;
    let rsp = host
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mirror?name=tiger&name=balm")
                .header("x-trace", "abc")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(rsp.status(), StatusCode::ACCEPTED);
    assert_eq!(rsp.headers().get("x-trace").unwrap(), "abc");
    assert_eq!(rsp.headers().get("x-name").unwrap(), "tiger");
    assert_ne!(
        rsp.headers()
            .get("content-length")
            .map(|v| v.to_str().unwrap().to_string()),
        Some("999".to_string())
    );
    assert_eq!(body_text(rsp).await, "payload");
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_error_is_500() {
    let (host, _dir) = host_with(&[("broken", BROKEN)]).await;
    let rsp = host
        .router()
        .oneshot(
            Request::builder()
                .uri("/broken")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_body_is_400() {
    let (host, _dir) = host_with(&[("echo", ECHO)]).await;
    let rsp = host
        .router()
        .oneshot(
            Request::builder()
                .uri("/echo")
                .body(Body::from(vec![b'x'; 1024]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_body_bytes_are_kept_or_rejected() {
    let (host, _dir) = host_with(&[("echo", ECHO)]).await;

    let text = "héllo ✓";
    let rsp = host
        .router()
        .oneshot(Request::builder().uri("/echo").body(Body::from(text)).unwrap())
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);
    let bytes = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), text.as_bytes());

    let rsp = host
        .router()
        .oneshot(
            Request::builder()
                .uri("/echo")
                .body(Body::from(vec![0xff, b'h', b'i']))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unloaded_route_is_404() {
    let (host, _dir) = host_with(&[("echo", ECHO)]).await;
    host.manager().unload("echo").await.unwrap();
    assert!(!host.http().contains("GET", "/echo"));

    let rsp = host
        .router()
        .oneshot(Request::builder().uri("/echo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broken_plugin_does_not_stop_the_host() {
    let (host, _dir) = host_with(&[("echo", ECHO), ("junk", "fn register( {")]).await;
    assert_eq!(host.manager().names(), vec!["echo".to_string()]);
    assert!(host.http().contains("GET", "/echo"));
    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consume_binding_relays_through_producer() {
    let dir = tempfile::tempdir().unwrap();
    write_plugins(dir.path(), &[("relay", RELAY)]);
    let host = Host::build(kafka_config(dir.path())).await.unwrap();
    let group = host.consumer_group().unwrap();
    assert_eq!(group.keys().await.len(), 1);

    let broker = host.memory_broker().unwrap().clone();
    let delivery = broker
        .append(&ProducerMessage::new("orders", "x"))
        .unwrap();

    let relayed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let records = broker.records("audit");
            if !records.is_empty() {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].payload, b"seen x".to_vec());

    let committed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(offset) = broker.committed("billing", "orders", delivery.partition) {
                return offset;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(committed, delivery.offset + 1);

    host.fini().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fini_unbinds_kafka_subscriptions() {
    let dir = tempfile::tempdir().unwrap();
    write_plugins(dir.path(), &[("relay", RELAY), ("echo", ECHO)]);
    let host = Host::build(kafka_config(dir.path())).await.unwrap();
    let group = host.consumer_group().unwrap().clone();
    let http = host.http().clone();
    assert_eq!(group.keys().await.len(), 1);

    host.fini().await;
    assert!(group.keys().await.is_empty());
    assert!(http.routes().is_empty());
}

#[cfg(not(feature = "rdkafka"))]
#[tokio::test]
async fn test_rdkafka_backend_needs_feature() {
    let dir = tempfile::tempdir().unwrap();
    write_plugins(dir.path(), &[]);
    let mut config = kafka_config(dir.path());
    config.kafka.backend = KafkaBackend::Rdkafka;
    let err = Host::build(config).await.err().unwrap();
    assert!(matches!(err, GatewayError::Unsupported(_)));
}

#[tokio::test]
async fn test_missing_plugin_directory_fails_build() {
    let dir = tempfile::tempdir().unwrap();
    let err = Host::build(config(dir.path())).await.err().unwrap();
    assert!(matches!(err, GatewayError::Manager(_)));
}
