//! Tigerbalm gateway.
//!
//! - [`slot`]: the HTTP [`Slot`](tigerbalm_kernel::Slot), served through axum
//! - [`host`]: assembly of bus, transports, capabilities and plugins
//! - [`telemetry`]: host log setup

pub mod error;
pub mod host;
pub mod slot;
pub mod telemetry;

pub use error::{GatewayError, GatewayResult};
pub use host::Host;
pub use slot::HttpSlot;
