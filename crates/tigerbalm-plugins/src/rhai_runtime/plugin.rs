//! A loaded script unit.

use std::sync::Arc;

use parking_lot::RwLock;
use tigerbalm_kernel::config::SandboxConfig;
use tigerbalm_kernel::{ConsumerGroupMessage, LogLevel, Request, Response};
use tracing::{debug, info};

use super::instance::HandlerFactory;
use super::pool::InstancePool;
use super::types::Registration;
use crate::capability::CapabilityTable;
use crate::error::{PluginError, PluginResult};

/// Mutable part of a plugin, swapped as a whole on (re)load.
struct PluginState {
    content: Arc<str>,
    registration: Option<Registration>,
    pool: Option<Arc<InstancePool>>,
}

/// A script plugin: its source, the bindings it registered and the pool of
/// interpreters running it.
///
/// A plugin whose last compile failed has no pool and no registration; calls
/// into it fail with [`PluginError::InterpreterUnavailable`].
pub struct Plugin {
    name: String,
    table: CapabilityTable,
    sandbox: SandboxConfig,
    state: RwLock<PluginState>,
}

impl Plugin {
    pub fn new(
        name: impl Into<String>,
        content: impl Into<Arc<str>>,
        table: CapabilityTable,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            sandbox,
            state: RwLock::new(PluginState {
                content: content.into(),
                registration: None,
                pool: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> Arc<str> {
        self.state.read().content.clone()
    }

    /// Bindings from the last successful compile.
    pub fn registration(&self) -> Option<Registration> {
        self.state.read().registration.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().pool.is_some()
    }

    /// Compile the current content, run `register()` and seed a fresh pool
    /// with the resulting warm instance.
    ///
    /// Script top-level code and `register()` may call blocking capabilities,
    /// so this must not run on an async worker. Use [`Plugin::load`] there.
    pub fn load_blocking(&self) -> PluginResult<Registration> {
        let content = self.content();
        self.compile(content)
    }

    /// Replace the content and load it. On failure the plugin is left
    /// without bindings or pool.
    pub fn reload_blocking(&self, content: impl Into<Arc<str>>) -> PluginResult<Registration> {
        let content = content.into();
        self.state.write().content = content.clone();
        self.compile(content)
    }

    /// [`Plugin::load_blocking`] on the blocking pool.
    pub async fn load(self: Arc<Self>) -> PluginResult<Registration> {
        tokio::task::spawn_blocking(move || self.load_blocking())
            .await
            .map_err(|e| PluginError::Execution(format!("load task failed: {e}")))?
    }

    /// [`Plugin::reload_blocking`] on the blocking pool.
    pub async fn reload(self: Arc<Self>, content: Arc<str>) -> PluginResult<Registration> {
        tokio::task::spawn_blocking(move || self.reload_blocking(content))
            .await
            .map_err(|e| PluginError::Execution(format!("reload task failed: {e}")))?
    }

    fn compile(&self, content: Arc<str>) -> PluginResult<Registration> {
        let factory = HandlerFactory::new(&self.name, content, self.table.clone(), self.sandbox.clone());
        match factory.build() {
            Ok((warm, registration)) => {
                let pool = Arc::new(InstancePool::seeded(factory, warm));
                let mut state = self.state.write();
                state.registration = Some(registration.clone());
                state.pool = Some(pool);
                drop(state);
                info!(plugin = %self.name, ?registration, "plugin compiled");
                self.log(LogLevel::Info, "plugin loaded");
                Ok(registration)
            }
            Err(e) => {
                let mut state = self.state.write();
                state.registration = None;
                state.pool = None;
                drop(state);
                self.log(LogLevel::Error, &format!("plugin load failed: {e}"));
                Err(e)
            }
        }
    }

    fn pool(&self) -> PluginResult<Arc<InstancePool>> {
        self.state.read().pool.clone().ok_or_else(|| {
            PluginError::InterpreterUnavailable(format!("plugin {} is not loaded", self.name))
        })
    }

    /// Idle and total instance counts of the current pool.
    pub fn pool_stats(&self) -> Option<(usize, usize)> {
        self.state
            .read()
            .pool
            .as_ref()
            .map(|pool| (pool.idle(), pool.created()))
    }

    /// Run the route handler on an exclusive interpreter.
    pub async fn handle_http(&self, req: Request) -> PluginResult<Response> {
        let pool = self.pool()?;
        debug!(plugin = %self.name, method = %req.method, url = %req.url, "dispatching http request");
        tokio::task::spawn_blocking(move || {
            let mut instance = pool.take()?;
            let result = instance.call_route(&req);
            pool.put(instance);
            result
        })
        .await
        .map_err(|e| PluginError::Execution(format!("handler task failed: {e}")))?
    }

    /// Run the consume handler on an exclusive interpreter.
    pub async fn handle_message(&self, msg: ConsumerGroupMessage) -> PluginResult<()> {
        let pool = self.pool()?;
        debug!(plugin = %self.name, topic = %msg.topic, offset = msg.offset, "dispatching kafka message");
        tokio::task::spawn_blocking(move || {
            let mut instance = pool.take()?;
            let result = instance.call_consume(&msg);
            pool.put(instance);
            result
        })
        .await
        .map_err(|e| PluginError::Execution(format!("handler task failed: {e}")))?
    }

    /// Drop the pool and registration but keep the log sink, so a later
    /// reload can bring the plugin back.
    pub fn park(&self) {
        let mut state = self.state.write();
        state.pool = None;
        state.registration = None;
    }

    /// Drop the pool and close the log sink.
    pub fn fini(&self) {
        let mut state = self.state.write();
        state.pool = None;
        state.registration = None;
        drop(state);
        self.table.logger().close();
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.table.logger().log(level, message);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tigerbalm_kernel::config::{HttpClientConfig, PluginLogConfig, Rotation};
    use tigerbalm_kernel::{ConsumeKey, PluginContext, RouteKey};

    use super::*;
    use crate::capability::{CapabilityBroker, HttpCapability};
    use crate::logger::LoggerFactory;

    const ECHO: &str = r#"
        fn register() {
            #{
                route: #{
                    "match": #{ path: "/echo", method: "get" },
                    handler: Fn("on_http"),
                },
            }
        }

        fn on_http(req) {
            #{ status: 200, header: req.Header, body: req.Body }
        }
    "#;

    fn broker(dir: &std::path::Path) -> CapabilityBroker {
        let loggers = Arc::new(LoggerFactory::new(PluginLogConfig {
            path: dir.to_path_buf(),
            level: LogLevel::Trace,
            rotation: Rotation::Never,
            max_files: 0,
        }));
        let http = HttpCapability::new(&HttpClientConfig::default()).unwrap();
        CapabilityBroker::new(http, loggers)
    }

    fn plugin(dir: &std::path::Path, name: &str, content: &str) -> Plugin {
        let table = broker(dir).table(&PluginContext::new(name)).unwrap();
        Plugin::new(name, content, table, SandboxConfig::default())
    }

    #[tokio::test]
    async fn test_load_extracts_route_and_serves() {
        let dir = tempfile::tempdir().unwrap();
        let p = plugin(dir.path(), "echo", ECHO);

        let registration = p.load_blocking().unwrap();
        assert_eq!(registration.route, Some(RouteKey::new("GET", "/echo")));
        assert!(registration.consume.is_none());

        let req = Request::new("GET", "/echo")
            .with_header("X-Trace", "abc")
            .with_header("Content-Length", "2")
            .with_body("hi");
        let rsp = p.handle_http(req).await.unwrap();
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.body, "hi");
        assert_eq!(rsp.header.get("X-Trace").map(String::as_str), Some("abc"));
        assert!(!rsp.header.contains_key("Content-Length"));
    }

    #[tokio::test]
    async fn test_consume_registration_with_closure_handler() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
            fn register() {
                #{
                    consume: #{
                        "match": #{ topic: "orders", group: "billing" },
                        handler: |msg| { if msg.Payload != "x" { throw "bad payload"; } },
                    },
                }
            }
        "#;
        let p = plugin(dir.path(), "orders", script);
        let registration = p.load_blocking().unwrap();
        assert_eq!(registration.consume, Some(ConsumeKey::new("orders", "billing")));

        let ok = ConsumerGroupMessage::new("orders", "billing", "x");
        p.handle_message(ok).await.unwrap();

        let bad = ConsumerGroupMessage::new("orders", "billing", "y");
        assert!(matches!(
            p.handle_message(bad).await,
            Err(PluginError::Execution(_))
        ));

        assert!(matches!(
            p.handle_http(Request::new("GET", "/")).await,
            Err(PluginError::NotHandled { .. })
        ));
    }

    #[test]
    fn test_malformed_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("fn other() {}", "no register"),
            ("fn register() { 42 }", "not a map"),
            (
                r#"fn register() { #{ route: #{ "match": #{ path: "/a" }, handler: Fn("h") } } } fn h(r) {}"#,
                "missing method",
            ),
            (
                r#"fn register() { #{ route: #{ "match": #{ path: "/a", method: "GET" }, handler: Fn("nope") } } }"#,
                "undefined handler",
            ),
            (
                r#"fn register() { #{ route: #{ "match": #{ path: "/a", method: "GET" }, handler: 5 } } }"#,
                "handler not a function",
            ),
            ("fn register( {", "syntax error"),
        ];
        for (script, why) in cases {
            let p = plugin(dir.path(), "bad", script);
            assert!(p.load_blocking().is_err(), "{why}");
            assert!(!p.is_loaded(), "{why}");
        }
    }

    #[tokio::test]
    async fn test_reload_failure_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let p = plugin(dir.path(), "echo", ECHO);
        p.load_blocking().unwrap();

        assert!(p.reload_blocking("fn register( {").is_err());
        assert!(p.registration().is_none());
        assert!(matches!(
            p.handle_http(Request::new("GET", "/echo")).await,
            Err(PluginError::InterpreterUnavailable(_))
        ));

        let fixed = ECHO.replace("/echo", "/echo2");
        let registration = p.reload_blocking(fixed).unwrap();
        assert_eq!(registration.route, Some(RouteKey::new("GET", "/echo2")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_get_distinct_instances() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(plugin(dir.path(), "echo", ECHO));
        p.load_blocking().unwrap();
        let pool = p.pool().unwrap();

        let held: Vec<_> = (0..8).map(|_| pool.take().unwrap()).collect();
        let ids: HashSet<u64> = held.iter().map(|i| i.id()).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(pool.created(), 8);
        for instance in held {
            pool.put(instance);
        }
        assert_eq!(pool.idle(), 8);

        let mut tasks = Vec::new();
        for i in 0..32 {
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                let req = Request::new("GET", "/echo").with_body(i.to_string());
                p.handle_http(req).await.unwrap().body
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), i.to_string());
        }
        let (idle, created) = p.pool_stats().unwrap();
        assert_eq!(idle, created);
    }

    #[tokio::test]
    async fn test_context_visible_inside_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
            let loaded_as = context.Name;

            fn register() {
                #{ route: #{ "match": #{ path: "/who", method: "GET" }, handler: Fn("who") } }
            }

            fn who(req) {
                #{ body: context.Name }
            }
        "#;
        let p = plugin(dir.path(), "whoami", script);
        p.load_blocking().unwrap();
        let rsp = p.handle_http(Request::new("GET", "/who")).await.unwrap();
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.body, "whoami");
    }

    #[tokio::test]
    async fn test_fini_closes_log_sink() {
        let dir = tempfile::tempdir().unwrap();
        let p = plugin(dir.path(), "echo", ECHO);
        p.load_blocking().unwrap();
        p.fini();
        assert!(!p.is_loaded());
        assert!(p.table.logger().is_closed());
    }
}
