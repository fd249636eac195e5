//! Plugin runtime manager.
//!
//! Owns every loaded [`Plugin`], binds their routes and consumers onto the
//! [`SlotBus`], and applies load/reload/unload requests one at a time. The
//! name index and both key indices live under one lock so a reader never
//! sees a route pointing at a plugin that is not in the name index.
//!
//! Handlers registered on the bus look the plugin up by key at dispatch time,
//! so a request always reaches whichever plugin currently owns its key.
//! A call already in flight when its plugin is unloaded still completes
//! against the old interpreter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use error_stack::Report;
use parking_lot::RwLock;
use tigerbalm_kernel::config::PluginConfig;
use tigerbalm_kernel::{
    BusError, ConsumeKey, DispatchError, Event, Handler, MatchArg, PluginContext, Reply, RouteKey,
    SlotBus, SlotType, handler_fn,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capability::CapabilityBroker;
use crate::error::PluginError;
use crate::hot_reload::{PluginFilter, PluginWatcher, WatchEvent};
use crate::rhai_runtime::{Plugin, Registration};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("plugin {name}: {source}")]
    Plugin {
        name: String,
        #[source]
        source: PluginError,
    },

    /// Another plugin already owns the key.
    #[error("{key} is already bound by plugin {owner}")]
    Duplicate { key: String, owner: String },

    #[error("bus rejected binding: {0}")]
    Bus(Report<BusError>),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

// ============================================================================
// Manager
// ============================================================================

#[derive(Default)]
struct PluginIndex {
    plugins: HashMap<String, Arc<Plugin>>,
    routes: HashMap<RouteKey, String>,
    consumes: HashMap<ConsumeKey, String>,
}

struct WatchTask {
    watcher: PluginWatcher,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: PluginConfig,
    bus: Arc<SlotBus>,
    broker: Arc<CapabilityBroker>,
    index: RwLock<PluginIndex>,
    /// Serializes load, reload and unload.
    ops: Mutex<()>,
    watch: Mutex<Option<WatchTask>>,
}

/// Cheap to clone; clones share the same plugins.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl PluginManager {
    pub fn new(config: PluginConfig, bus: Arc<SlotBus>, broker: Arc<CapabilityBroker>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                bus,
                broker,
                index: RwLock::new(PluginIndex::default()),
                ops: Mutex::new(()),
                watch: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    /// Load every plugin file in the plugin directory. Individual plugin
    /// failures are logged; only an unreadable directory is an error.
    pub async fn start(&self) -> ManagerResult<usize> {
        let dir = self.inner.config.path.clone();
        let files = PluginFilter::from(&self.inner.config)
            .scan(&dir)
            .map_err(|source| ManagerError::Directory {
                path: dir.clone(),
                source,
            })?;

        let mut loaded = 0;
        for path in files {
            let Some(name) = plugin_name(&path) else {
                continue;
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match self.load(&name, content).await {
                    Ok(_) => loaded += 1,
                    Err(e) => error!(plugin = %name, error = %e, "plugin not loaded"),
                },
                Err(e) => error!(path = %path.display(), error = %e, "cannot read plugin file"),
            }
        }
        info!(loaded, dir = %dir.display(), "plugin directory scanned");
        Ok(loaded)
    }

    /// Load a new plugin, or reload it if the name is already known.
    ///
    /// A script that fails to compile is dropped. A script that compiles but
    /// cannot bind (a key owned by another plugin, a missing slot) stays in
    /// the name index unloaded and with nothing bound, keeping its log sink,
    /// so the next reload of the same name retries the binding.
    pub async fn load(&self, name: &str, content: impl Into<Arc<str>>) -> ManagerResult<Registration> {
        let _op = self.inner.ops.lock().await;
        if self.get(name).is_some() {
            return self.reload_locked(name, content.into()).await;
        }
        self.load_locked(name, content.into()).await
    }

    /// Replace a plugin's script. Unknown names are loaded.
    pub async fn reload(&self, name: &str, content: impl Into<Arc<str>>) -> ManagerResult<Registration> {
        let _op = self.inner.ops.lock().await;
        if self.get(name).is_none() {
            return self.load_locked(name, content.into()).await;
        }
        self.reload_locked(name, content.into()).await
    }

    /// Unbind and drop a plugin and release its log sink.
    pub async fn unload(&self, name: &str) -> ManagerResult<()> {
        let _op = self.inner.ops.lock().await;
        self.unload_locked(name).await
    }

    /// Stop watching and unload every plugin.
    pub async fn fini(&self) {
        self.stop_watch().await;
        let _op = self.inner.ops.lock().await;
        let names: Vec<String> = self.inner.index.read().plugins.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unload_locked(&name).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
        self.inner.broker.loggers().release_all();
    }

    pub fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.inner.index.read().plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.index.read().plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Plugin currently bound to `key`.
    pub fn route_owner(&self, key: &RouteKey) -> Option<String> {
        self.inner.index.read().routes.get(key).cloned()
    }

    pub fn consume_owner(&self, key: &ConsumeKey) -> Option<String> {
        self.inner.index.read().consumes.get(key).cloned()
    }

    // ------------------------------------------------------------------------
    // Lifecycle steps; callers hold `ops`.
    // ------------------------------------------------------------------------

    async fn load_locked(&self, name: &str, content: Arc<str>) -> ManagerResult<Registration> {
        let table = self
            .inner
            .broker
            .table(&PluginContext::new(name))
            .map_err(|source| plugin_error(name, source))?;
        let plugin = Arc::new(Plugin::new(
            name,
            content,
            table,
            self.inner.config.sandbox.clone(),
        ));

        let registration = match plugin.clone().load().await {
            Ok(registration) => registration,
            Err(source) => {
                plugin.fini();
                self.inner.broker.loggers().release(name);
                return Err(plugin_error(name, source));
            }
        };

        self.inner
            .index
            .write()
            .plugins
            .insert(name.to_string(), plugin.clone());
        if let Err(e) = self.bind(name, &registration).await {
            plugin.park();
            return Err(e);
        }
        info!(plugin = %name, "plugin loaded");
        Ok(registration)
    }

    async fn reload_locked(&self, name: &str, content: Arc<str>) -> ManagerResult<Registration> {
        let plugin = self
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        if let Some(old) = plugin.registration() {
            self.unbind(name, &old).await;
        }

        let registration = plugin
            .clone()
            .reload(content)
            .await
            .map_err(|source| plugin_error(name, source))?;
        if let Err(e) = self.bind(name, &registration).await {
            plugin.park();
            return Err(e);
        }
        info!(plugin = %name, "plugin reloaded");
        Ok(registration)
    }

    async fn unload_locked(&self, name: &str) -> ManagerResult<()> {
        let plugin = self
            .inner
            .index
            .write()
            .plugins
            .remove(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        if let Some(registration) = plugin.registration() {
            self.unbind(name, &registration).await;
        }
        plugin.fini();
        self.inner.broker.loggers().release(name);
        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Claim the keys in the index and register them with the bus. On any
    /// failure nothing stays bound.
    async fn bind(&self, name: &str, registration: &Registration) -> ManagerResult<()> {
        if registration.is_empty() {
            warn!(plugin = %name, "plugin registers neither route nor consume");
            return Ok(());
        }

        if let Some(key) = &registration.route {
            self.claim_route(name, key)?;
            let matches = [MatchArg::from(key.method.as_str()), MatchArg::from(key.path.as_str())];
            let handler = self.route_handler(key.clone());
            if let Err(report) = self
                .inner
                .bus
                .add_slot_handler(SlotType::Http, handler, &matches)
                .await
            {
                self.inner.index.write().routes.remove(key);
                error!(plugin = %name, route = %key, error = ?report, "route registration failed");
                return Err(ManagerError::Bus(report));
            }
            debug!(plugin = %name, route = %key, "route bound");
        }

        if let Some(key) = &registration.consume {
            let claimed = self.claim_consume(name, key);
            let result = match claimed {
                Ok(()) => {
                    let matches = [MatchArg::from(key.topic.as_str()), MatchArg::from(key.group.as_str())];
                    let handler = self.consume_handler(key.clone());
                    self.inner
                        .bus
                        .add_slot_handler(SlotType::Kafka, handler, &matches)
                        .await
                        .map_err(|report| {
                            self.inner.index.write().consumes.remove(key);
                            ManagerError::Bus(report)
                        })
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(plugin = %name, consume = %key, error = %e, "consume registration failed");
                if let Some(route) = &registration.route {
                    self.unbind_route(name, route).await;
                }
                return Err(e);
            }
            debug!(plugin = %name, consume = %key, "consume bound");
        }

        Ok(())
    }

    fn claim_route(&self, name: &str, key: &RouteKey) -> ManagerResult<()> {
        let mut index = self.inner.index.write();
        match index.routes.get(key) {
            Some(owner) if owner != name => Err(ManagerError::Duplicate {
                key: key.to_string(),
                owner: owner.clone(),
            }),
            _ => {
                index.routes.insert(key.clone(), name.to_string());
                Ok(())
            }
        }
    }

    fn claim_consume(&self, name: &str, key: &ConsumeKey) -> ManagerResult<()> {
        let mut index = self.inner.index.write();
        match index.consumes.get(key) {
            Some(owner) if owner != name => Err(ManagerError::Duplicate {
                key: key.to_string(),
                owner: owner.clone(),
            }),
            _ => {
                index.consumes.insert(key.clone(), name.to_string());
                Ok(())
            }
        }
    }

    async fn unbind(&self, name: &str, registration: &Registration) {
        if let Some(key) = &registration.route {
            self.unbind_route(name, key).await;
        }
        if let Some(key) = &registration.consume {
            let owned = {
                let mut index = self.inner.index.write();
                if index.consumes.get(key).is_some_and(|owner| owner == name) {
                    index.consumes.remove(key);
                    true
                } else {
                    false
                }
            };
            if owned {
                let matches = [MatchArg::from(key.topic.as_str()), MatchArg::from(key.group.as_str())];
                if let Err(report) = self.inner.bus.del_slot_handler(SlotType::Kafka, &matches).await {
                    warn!(plugin = %name, consume = %key, error = ?report, "consume deregistration failed");
                }
            }
        }
    }

    async fn unbind_route(&self, name: &str, key: &RouteKey) {
        let owned = {
            let mut index = self.inner.index.write();
            if index.routes.get(key).is_some_and(|owner| owner == name) {
                index.routes.remove(key);
                true
            } else {
                false
            }
        };
        if owned {
            let matches = [MatchArg::from(key.method.as_str()), MatchArg::from(key.path.as_str())];
            if let Err(report) = self.inner.bus.del_slot_handler(SlotType::Http, &matches).await {
                warn!(plugin = %name, route = %key, error = ?report, "route deregistration failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Bus handlers
    // ------------------------------------------------------------------------

    fn route_handler(&self, key: RouteKey) -> Handler {
        let inner = Arc::downgrade(&self.inner);
        handler_fn(move |event| {
            let inner = inner.clone();
            let key = key.clone();
            async move {
                let Event::Http(req) = event else {
                    return Err(DispatchError::BadRequest(format!("{key}: expected an http event")));
                };
                let plugin = lookup(&inner, |index| index.routes.get(&key).cloned())
                    .ok_or_else(|| DispatchError::NotFound(key.to_string()))?;
                let rsp = plugin.handle_http(req).await.map_err(|e| {
                    warn!(plugin = %plugin.name(), route = %key, error = %e, "http handler failed");
                    DispatchError::from(e)
                })?;
                Ok(Reply::Http(rsp))
            }
        })
    }

    fn consume_handler(&self, key: ConsumeKey) -> Handler {
        let inner = Arc::downgrade(&self.inner);
        handler_fn(move |event| {
            let inner = inner.clone();
            let key = key.clone();
            async move {
                let Event::Kafka(msg) = event else {
                    return Err(DispatchError::BadRequest(format!("{key}: expected a kafka event")));
                };
                let plugin = lookup(&inner, |index| index.consumes.get(&key).cloned())
                    .ok_or_else(|| DispatchError::NotFound(key.to_string()))?;
                plugin.handle_message(msg).await.map_err(|e| {
                    warn!(plugin = %plugin.name(), consume = %key, error = %e, "kafka handler failed");
                    DispatchError::from(e)
                })?;
                Ok(Reply::Done)
            }
        })
    }

    // ------------------------------------------------------------------------
    // Hot reload
    // ------------------------------------------------------------------------

    /// Start the watch loop on `plugin.watch_path`. A no-op when unset.
    pub async fn watch(&self) -> ManagerResult<()> {
        let Some(dir) = self.inner.config.watch_path.clone() else {
            return Ok(());
        };
        let mut slot = self.inner.watch.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let (watcher, mut events) =
            PluginWatcher::spawn(&dir, PluginFilter::from(&self.inner.config))?;

        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                PluginManager { inner }.apply(event).await;
            }
            debug!("watch loop finished");
        });

        *slot = Some(WatchTask { watcher, task });
        info!(dir = %dir.display(), "hot reload enabled");
        Ok(())
    }

    async fn stop_watch(&self) {
        let Some(watch) = self.inner.watch.lock().await.take() else {
            return;
        };
        watch.watcher.stop();
        watch.task.abort();
    }

    /// Apply one filesystem event.
    pub async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Changed(path) => self.apply_write(&path).await,
            WatchEvent::Removed(path) => self.apply_remove(&path).await,
            WatchEvent::Renamed { from, to } => {
                self.apply_remove(&from).await;
                self.apply_write(&to).await;
            }
        }
    }

    async fn apply_remove(&self, path: &Path) {
        let Some(name) = plugin_name(path) else {
            return;
        };
        if let Err(e) = self.unload(&name).await {
            debug!(plugin = %name, error = %e, "nothing to unload");
        }
    }

    async fn apply_write(&self, path: &Path) {
        let Some(name) = plugin_name(path) else {
            return;
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                if let Err(e) = self.reload(&name, content).await {
                    error!(plugin = %name, error = %e, "hot reload failed");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot read plugin file"),
        }
    }
}

fn lookup(
    inner: &Weak<ManagerInner>,
    find: impl FnOnce(&PluginIndex) -> Option<String>,
) -> Option<Arc<Plugin>> {
    let inner = inner.upgrade()?;
    let index = inner.index.read();
    let name = find(&index)?;
    index.plugins.get(&name).cloned()
}

fn plugin_error(name: &str, source: PluginError) -> ManagerError {
    ManagerError::Plugin {
        name: name.to_string(),
        source,
    }
}

/// Plugin identity for a script path: the file stem.
pub fn plugin_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
