//! Tigerbalm plugin runtime.
//!
//! - [`rhai_runtime`]: plugins, their interpreter pools and registration
//! - [`capability`]: what a script can reach through `require(..)`
//! - [`marshal`]: records to and from Rhai values
//! - [`logger`]: per-plugin rotating log sinks
//! - [`hot_reload`]: filesystem watching
//! - [`manager`]: load/reload/unload and binding plugins onto the bus

pub mod capability;
pub mod error;
pub mod hot_reload;
pub mod logger;
pub mod manager;
pub mod marshal;
pub mod rhai_runtime;

pub use capability::{CapabilityBroker, CapabilityTable};
pub use error::{PluginError, PluginResult};
pub use logger::{LoggerFactory, PluginLogger};
pub use manager::{ManagerError, PluginManager};
pub use rhai_runtime::{Plugin, Registration};
