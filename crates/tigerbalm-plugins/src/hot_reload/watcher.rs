//! Plugin directory watcher.
//!
//! notify delivers raw events on its own thread. A forwarding task folds them
//! into [`WatchEvent`]s, drops anything that is not a plugin file, debounces
//! repeats and hands the rest to the manager.

use std::collections::HashMap;
use std::mem::{Discriminant, discriminant};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tigerbalm_kernel::config::PluginConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to a plugin file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Created or written.
    Changed(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl WatchEvent {
    /// Path the debounce window is keyed on.
    fn key(&self) -> &Path {
        match self {
            WatchEvent::Changed(path) | WatchEvent::Removed(path) => path,
            WatchEvent::Renamed { to, .. } => to,
        }
    }
}

/// Which files count as plugins, and how close together repeated events for
/// one file may arrive before they are collapsed.
#[derive(Debug, Clone)]
pub struct PluginFilter {
    pub extension: String,
    pub debounce: Duration,
}

impl Default for PluginFilter {
    fn default() -> Self {
        Self {
            extension: "rhai".to_string(),
            debounce: Duration::from_millis(200),
        }
    }
}

impl From<&PluginConfig> for PluginFilter {
    fn from(config: &PluginConfig) -> Self {
        Self {
            extension: config.extension.trim_start_matches('.').to_string(),
            debounce: Duration::from_millis(config.debounce_ms),
        }
    }
}

impl PluginFilter {
    /// Hidden files and editor leftovers (`a.rhai~`, `a.rhai.swp`) are
    /// rejected by the exact extension match.
    pub fn accepts(&self, path: &Path) -> bool {
        let visible = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'));
        visible && path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
    }

    /// Plugin files directly under `dir`, sorted by name.
    pub fn scan(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && self.accepts(&path) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Fold one notify event into plugin events. `pending` carries the
    /// source half of a rename reported as two events.
    fn fold(&self, event: notify::Event, pending: &mut Option<PathBuf>) -> Vec<WatchEvent> {
        if event.kind == EventKind::Modify(ModifyKind::Name(RenameMode::Both)) {
            let [from, to] = event.paths.as_slice() else {
                return Vec::new();
            };
            let event = match (self.accepts(from), self.accepts(to)) {
                (true, true) => WatchEvent::Renamed {
                    from: from.clone(),
                    to: to.clone(),
                },
                (true, false) => WatchEvent::Removed(from.clone()),
                (false, true) => WatchEvent::Changed(to.clone()),
                (false, false) => return Vec::new(),
            };
            return vec![event];
        }

        let mut out = Vec::new();
        for path in event.paths.into_iter().filter(|p| self.accepts(p)) {
            match event.kind {
                EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
                    out.push(WatchEvent::Changed(path));
                }
                EventKind::Remove(_) => out.push(WatchEvent::Removed(path)),
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => *pending = Some(path),
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    out.push(match pending.take() {
                        Some(from) => WatchEvent::Renamed { from, to: path },
                        None => WatchEvent::Changed(path),
                    });
                }
                _ => {}
            }
        }
        out
    }
}

/// Running watch on one directory. Dropping the notify handle closes the raw
/// channel, which ends the forwarding task.
pub struct PluginWatcher {
    notify: RecommendedWatcher,
    forward: JoinHandle<()>,
}

impl PluginWatcher {
    /// Watch `dir` non-recursively and return the filtered event stream.
    pub fn spawn(
        dir: &Path,
        filter: PluginFilter,
    ) -> notify::Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut notify = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if raw_tx.send(event).is_err() {
                        debug!("watch forwarder gone");
                    }
                }
                Err(e) => warn!(error = %e, "notify error"),
            }
        })?;
        notify.watch(dir, RecursiveMode::NonRecursive)?;

        let (tx, rx) = mpsc::channel(256);
        let forward = tokio::spawn(async move {
            let mut debounce = Debounce::new(filter.debounce);
            let mut pending = None;
            while let Some(raw) = raw_rx.recv().await {
                for event in filter.fold(raw, &mut pending) {
                    if !debounce.fresh(&event, Instant::now()) {
                        continue;
                    }
                    debug!(?event, "plugin file event");
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        info!(dir = %dir.display(), "watching plugin directory");
        Ok((Self { notify, forward }, rx))
    }

    pub fn stop(self) {
        drop(self.notify);
        self.forward.abort();
    }
}

struct Debounce {
    window: Duration,
    seen: HashMap<PathBuf, (Discriminant<WatchEvent>, Instant)>,
}

impl Debounce {
    fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// False for a repeat of the same event kind on the same path inside
    /// the window.
    fn fresh(&mut self, event: &WatchEvent, now: Instant) -> bool {
        let kind = discriminant(event);
        let repeat = self
            .seen
            .get(event.key())
            .is_some_and(|(k, at)| *k == kind && now.duration_since(*at) < self.window);
        if !repeat {
            self.seen.insert(event.key().to_path_buf(), (kind, now));
        }
        !repeat
    }
}
