//! Integration tests for the plugin manager
//!
//! Load, reload and unload against a bus with test slots, plus the
//! filesystem-driven paths.

mod common;

use common::{harness, route_script};
use tigerbalm_kernel::{
    ConsumeKey, ConsumerGroupMessage, DispatchError, Event, Reply, Request, RouteKey,
};
use tigerbalm_plugins::ManagerError;
use tigerbalm_plugins::hot_reload::WatchEvent;

fn get(path: &str) -> Event {
    Event::Http(Request::new("GET", path))
}

fn body(reply: Reply) -> String {
    match reply {
        Reply::Http(rsp) => rsp.body,
        other => panic!("expected an http reply, got {other:?}"),
    }
}

// ============================================================================
// Load / reload / unload
// ============================================================================

#[tokio::test]
async fn test_load_binds_route_and_dispatches() {
    let h = harness(false);
    let registration = h
        .manager
        .load("hello", route_script("get", "/hello", "v1"))
        .await
        .unwrap();

    let key = RouteKey::new("GET", "/hello");
    assert_eq!(registration.route, Some(key.clone()));
    assert_eq!(h.manager.route_owner(&key).as_deref(), Some("hello"));
    assert!(h.http.contains("GET", "/hello"));

    let reply = h.http.dispatch("GET", "/hello", get("/hello")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "v1");
}

#[tokio::test]
async fn test_reload_swaps_handler() {
    let h = harness(false);
    h.manager
        .load("hello", route_script("GET", "/hello", "v1"))
        .await
        .unwrap();
    h.manager
        .reload("hello", route_script("GET", "/hello", "v2"))
        .await
        .unwrap();

    assert_eq!(h.http.len(), 1);
    let reply = h.http.dispatch("GET", "/hello", get("/hello")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "v2");
}

#[tokio::test]
async fn test_reload_moves_route() {
    let h = harness(false);
    h.manager
        .load("hello", route_script("GET", "/old", "v1"))
        .await
        .unwrap();
    h.manager
        .reload("hello", route_script("GET", "/new", "v2"))
        .await
        .unwrap();

    assert!(!h.http.contains("GET", "/old"));
    assert!(h.http.contains("GET", "/new"));
    assert!(h.manager.route_owner(&RouteKey::new("GET", "/old")).is_none());
}

#[tokio::test]
async fn test_failed_reload_leaves_plugin_unbound() {
    let h = harness(false);
    h.manager
        .load("hello", route_script("GET", "/hello", "v1"))
        .await
        .unwrap();

    let err = h
        .manager
        .reload("hello", "fn register( {")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Plugin { .. }));

    let plugin = h.manager.get("hello").unwrap();
    assert!(!plugin.is_loaded());
    assert_eq!(h.http.len(), 0);
    assert!(h.manager.route_owner(&RouteKey::new("GET", "/hello")).is_none());

    // A good script brings it back.
    h.manager
        .reload("hello", route_script("GET", "/hello", "v3"))
        .await
        .unwrap();
    let reply = h.http.dispatch("GET", "/hello", get("/hello")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "v3");
}

#[tokio::test]
async fn test_failed_load_is_not_kept() {
    let h = harness(false);
    let err = h.manager.load("broken", "let x = ;").await.unwrap_err();
    assert!(matches!(err, ManagerError::Plugin { ref name, .. } if name == "broken"));
    assert!(h.manager.get("broken").is_none());
    assert!(!h.loggers.contains("broken"));
}

#[tokio::test]
async fn test_unload_removes_bindings_and_logger() {
    let h = harness(false);
    h.manager
        .load("hello", route_script("GET", "/hello", "v1"))
        .await
        .unwrap();
    assert!(h.loggers.contains("hello"));

    h.manager.unload("hello").await.unwrap();
    assert!(h.manager.get("hello").is_none());
    assert_eq!(h.http.len(), 0);
    assert!(!h.loggers.contains("hello"));

    let err = h.manager.unload("hello").await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(_)));
}

#[tokio::test]
async fn test_handler_held_past_unload_reports_not_found() {
    let h = harness(false);
    h.manager
        .load("hello", route_script("GET", "/hello", "v1"))
        .await
        .unwrap();

    let handler = h.http.handler("GET", "/hello").unwrap();
    h.manager.unload("hello").await.unwrap();
    assert!(h.http.handler("GET", "/hello").is_none());

    let reply = handler(get("/hello")).await;
    assert!(matches!(reply, Err(DispatchError::NotFound(_))));
}

#[tokio::test]
async fn test_duplicate_route_rejected() {
    let h = harness(false);
    h.manager
        .load("first", route_script("GET", "/same", "first"))
        .await
        .unwrap();

    let err = h
        .manager
        .load("second", route_script("GET", "/same", "second"))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Duplicate { ref owner, .. } if owner == "first"));

    // The second plugin stays known but is parked: no pool, nothing bound.
    let second = h.manager.get("second").unwrap();
    assert!(!second.is_loaded());
    assert!(second.registration().is_none());
    assert!(h.loggers.contains("second"));
    assert_eq!(h.manager.names(), ["first", "second"]);
    let reply = h.http.dispatch("GET", "/same", get("/same")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "first");

    // Once the owner goes away the other plugin can take the route.
    h.manager.unload("first").await.unwrap();
    h.manager
        .reload("second", route_script("GET", "/same", "second"))
        .await
        .unwrap();
    let reply = h.http.dispatch("GET", "/same", get("/same")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "second");
}

#[tokio::test]
async fn test_handler_error_maps_to_dispatch_error() {
    let h = harness(false);
    let script = r#"
        fn register() {
            #{ route: #{ "match": #{ method: "GET", path: "/boom" }, handler: "on_http" } }
        }
        fn on_http(req) { throw "boom"; }
    "#;
    h.manager.load("boom", script).await.unwrap();

    let reply = h.http.dispatch("GET", "/boom", get("/boom")).await.unwrap();
    assert!(matches!(reply, Err(DispatchError::Handler(_))));
}

// ============================================================================
// Consume bindings
// ============================================================================

const RELAY: &str = r#"
    fn register() {
        #{
            consume: #{
                "match": #{ topic: "orders", group: "billing" },
                handler: |msg| {
                    require("kafka").produce(#{ Topic: "audit", Payload: msg.Payload, Key: msg.Topic });
                },
            },
        }
    }
"#;

#[tokio::test]
async fn test_consume_binding_runs_handler() {
    let h = harness(true);
    let registration = h.manager.load("relay", RELAY).await.unwrap();
    let key = ConsumeKey::new("orders", "billing");
    assert_eq!(registration.consume, Some(key.clone()));
    assert_eq!(h.manager.consume_owner(&key).as_deref(), Some("relay"));

    let msg = ConsumerGroupMessage::new("orders", "billing", b"order-1".to_vec());
    let reply = h
        .kafka
        .dispatch("orders", "billing", Event::Kafka(msg))
        .await
        .unwrap();
    assert_eq!(reply.unwrap(), Reply::Done);

    let sent = h.sink.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "audit");
    assert_eq!(sent[0].payload, b"order-1".to_vec());
    assert_eq!(sent[0].key.as_deref(), Some(b"orders".as_slice()));
}

const BOOT: &str = r#"
    let warmup = require("http").do_request(#{ Host: "127.0.0.1:9", Path: "/warmup" });

    fn register() {
        let rsp = require("http").do_request(#{ Host: "127.0.0.1:9", Path: "/health" });
        let state = if type_of(rsp) == "()" { "down" } else { "up" };
        require("kafka").produce(#{ Topic: "boot", Payload: state });
        #{ route: #{ "match": #{ method: "GET", path: "/boot" }, handler: |req| #{ body: "ready" } } }
    }
"#;

#[tokio::test]
async fn test_load_runs_blocking_capabilities_off_the_runtime() {
    let h = harness(false);
    h.manager.load("boot", BOOT).await.unwrap();

    {
        let sent = h.sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "boot");
        assert_eq!(sent[0].payload, b"down".to_vec());
    }

    h.manager.reload("boot", BOOT).await.unwrap();
    assert_eq!(h.sink.sent.lock().len(), 2);

    let reply = h.http.dispatch("GET", "/boot", get("/boot")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "ready");
}

#[tokio::test]
async fn test_consume_without_kafka_slot_leaves_plugin_unbound() {
    let h = harness(false);
    let script = r#"
        fn register() {
            #{
                route: #{ "match": #{ method: "GET", path: "/both" }, handler: |req| "ok" },
                consume: #{ "match": #{ topic: "t", group: "g" }, handler: |msg| () },
            }
        }
    "#;
    let err = h.manager.load("both", script).await.unwrap_err();
    assert!(matches!(err, ManagerError::Bus(_)));
    assert!(!h.manager.get("both").unwrap().is_loaded());
    assert_eq!(h.http.len(), 0);
    assert!(h.manager.route_owner(&RouteKey::new("GET", "/both")).is_none());
}

// ============================================================================
// Directory and watch events
// ============================================================================

#[tokio::test]
async fn test_start_loads_plugin_directory() {
    let h = harness(false);
    let dir = &h.manager.config().path;
    std::fs::write(dir.join("a.rhai"), route_script("GET", "/a", "a")).unwrap();
    std::fs::write(dir.join("b.rhai"), route_script("GET", "/b", "b")).unwrap();
    std::fs::write(dir.join("broken.rhai"), "fn register( {").unwrap();
    std::fs::write(dir.join("notes.txt"), "not a plugin").unwrap();

    let loaded = h.manager.start().await.unwrap();
    assert_eq!(loaded, 2);
    assert_eq!(h.manager.names(), vec!["a".to_string(), "b".to_string()]);
    assert!(h.http.contains("GET", "/a"));
    assert!(h.http.contains("GET", "/b"));
}

#[tokio::test]
async fn test_start_fails_on_missing_directory() {
    let h = harness(false);
    std::fs::remove_dir_all(&h.manager.config().path).unwrap();
    let err = h.manager.start().await.unwrap_err();
    assert!(matches!(err, ManagerError::Directory { .. }));
}

#[tokio::test]
async fn test_apply_watch_events() {
    let h = harness(false);
    let dir = h.manager.config().path.clone();
    let path = dir.join("live.rhai");

    std::fs::write(&path, route_script("GET", "/live", "v1")).unwrap();
    h.manager
        .apply(WatchEvent::Changed(path.clone()))
        .await;
    assert!(h.http.contains("GET", "/live"));

    std::fs::write(&path, route_script("GET", "/live", "v2")).unwrap();
    h.manager
        .apply(WatchEvent::Changed(path.clone()))
        .await;
    let reply = h.http.dispatch("GET", "/live", get("/live")).await.unwrap();
    assert_eq!(body(reply.unwrap()), "v2");

    let renamed = dir.join("moved.rhai");
    std::fs::rename(&path, &renamed).unwrap();
    h.manager
        .apply(WatchEvent::Renamed {
            from: path.clone(),
            to: renamed.clone(),
        })
        .await;
    assert_eq!(h.manager.names(), vec!["moved".to_string()]);
    assert_eq!(
        h.manager.route_owner(&RouteKey::new("GET", "/live")).as_deref(),
        Some("moved")
    );

    std::fs::remove_file(&renamed).unwrap();
    h.manager
        .apply(WatchEvent::Removed(renamed))
        .await;
    assert!(h.manager.names().is_empty());
    assert_eq!(h.http.len(), 0);
}

#[tokio::test]
async fn test_fini_unloads_everything() {
    let h = harness(true);
    h.manager
        .load("hello", route_script("GET", "/hello", "v1"))
        .await
        .unwrap();
    h.manager.load("relay", RELAY).await.unwrap();

    h.manager.fini().await;
    assert!(h.manager.names().is_empty());
    assert_eq!(h.http.len(), 0);
    assert_eq!(h.kafka.len(), 0);
    assert!(!h.loggers.contains("hello"));
}
