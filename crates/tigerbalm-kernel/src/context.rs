//! Identity of the plugin that owns an interpreter instance.

use serde::{Deserialize, Serialize};

/// Set once when an interpreter is built. Capability lookups that need a
/// plugin-scoped resource (its logger) resolve through this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginContext {
    pub name: String,
}

impl PluginContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
