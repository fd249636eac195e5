//! Hot reload
//!
//! The watcher feeds filesystem events for the plugin directory into one
//! channel; [`PluginManager::watch`](crate::manager::PluginManager::watch)
//! consumes it in a single task so load, reload and unload never overlap.

mod watcher;

pub use watcher::{PluginFilter, PluginWatcher, WatchEvent};
