//! Rhai plugin runtime
//!
//! A plugin is one Rhai script. Loading it compiles the script, runs its
//! top-level body and calls `register()`, which returns the bindings the
//! plugin wants:
//!
//! ```rhai
//! fn register() {
//!     #{
//!         route: #{
//!             "match": #{ path: "/echo", method: "GET" },
//!             handler: Fn("on_http"),
//!         },
//!         consume: #{
//!             "match": #{ topic: "orders", group: "billing" },
//!             handler: Fn("on_message"),
//!         },
//!     }
//! }
//!
//! fn on_http(req) {
//!     require("log").info(`echo ${req.Url}`);
//!     #{ status: 200, body: req.Body }
//! }
//!
//! fn on_message(msg) {}
//! ```
//!
//! An interpreter instance cannot run two calls at once, so each plugin keeps
//! a pool of instances. Every instance is produced by a [`HandlerFactory`]
//! that repeats the full load, giving it its own engine, scope and handler
//! pointers.

mod instance;
mod plugin;
mod pool;
mod types;

pub use instance::{HandlerFactory, Interpreter};
pub use plugin::Plugin;
pub use pool::InstancePool;
pub use types::{REGISTER_FN, Registration};
