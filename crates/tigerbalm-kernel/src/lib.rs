//! Tigerbalm kernel.
//!
//! The kernel holds the pieces every other crate in the workspace agrees on:
//!
//! - [`bus`]: the slot-based dispatch bus and the [`Slot`](bus::Slot) contract
//!   transports implement
//! - [`message`]: the HTTP and Kafka records handed to plugin handlers
//! - [`context`]: the identity a script-side capability call resolves against
//! - [`config`]: the typed host configuration and its loader
//! - [`level`]: log levels shared by the host and plugin log sinks

// bus module
pub mod bus;
pub use bus::*;

// message module
pub mod message;
pub use message::{
    ConsumeKey, ConsumerGroupMessage, MessageSink, ProducerMessage, Request, Response, RouteKey,
    SinkClosed,
};

// context module
pub mod context;
pub use context::PluginContext;

// config module
pub mod config;

// level module
pub mod level;
pub use level::LogLevel;
