//! The slot contract and the values that flow through it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{BusResult, DispatchResult};
use crate::message::{ConsumerGroupMessage, Request, Response};

/// Transport families a slot can serve. One slot is registered per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Http,
    Redis,
    Kafka,
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotType::Http => "http",
            SlotType::Redis => "redis",
            SlotType::Kafka => "kafka",
        };
        f.write_str(name)
    }
}

/// One opaque match argument. Each slot decides how many it takes and of
/// which kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchArg {
    Str(String),
    Int(i64),
}

impl MatchArg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MatchArg::Str(s) => Some(s),
            MatchArg::Int(_) => None,
        }
    }
}

impl fmt::Display for MatchArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchArg::Str(s) => write!(f, "{s:?}"),
            MatchArg::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for MatchArg {
    fn from(value: &str) -> Self {
        MatchArg::Str(value.to_string())
    }
}

impl From<String> for MatchArg {
    fn from(value: String) -> Self {
        MatchArg::Str(value)
    }
}

impl From<i64> for MatchArg {
    fn from(value: i64) -> Self {
        MatchArg::Int(value)
    }
}

/// Pulls exactly `N` string arguments out of `matches`.
///
/// Returns `None` and logs a warning when the arity or an argument kind is
/// wrong, so slots can no-op without failing the bus.
pub fn string_matches<const N: usize>(slot: SlotType, matches: &[MatchArg]) -> Option<[&str; N]> {
    if matches.len() != N {
        warn!(
            slot = %slot,
            expected = N,
            got = matches.len(),
            "ignoring handler call with wrong number of match arguments"
        );
        return None;
    }
    let mut out = [""; N];
    for (i, arg) in matches.iter().enumerate() {
        match arg.as_str() {
            Some(s) => out[i] = s,
            None => {
                warn!(slot = %slot, index = i, arg = %arg, "ignoring non-string match argument");
                return None;
            }
        }
    }
    Some(out)
}

/// An event delivered to a handler.
#[derive(Debug, Clone)]
pub enum Event {
    Http(Request),
    Kafka(ConsumerGroupMessage),
}

/// What a handler hands back to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Response for the HTTP slot.
    Http(Response),
    /// Processing finished; nothing to send back.
    Done,
}

/// A handler closure registered with a slot.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, DispatchResult<Reply>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult<Reply>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// A transport-specific handler registry exposed to the bus.
///
/// Implementations own their handler table and its locking. Match arguments
/// are validated here, not by the bus: a call with the wrong arity or kinds
/// is logged and ignored (`Ok(())`).
#[async_trait]
pub trait Slot: Send + Sync {
    /// Transport family served by this slot.
    fn slot_type(&self) -> SlotType;

    /// Bind `handler` under `matches`.
    async fn add_handler(&self, handler: Handler, matches: &[MatchArg]) -> BusResult<()>;

    /// Remove whatever is bound under `matches`.
    async fn del_handler(&self, matches: &[MatchArg]) -> BusResult<()>;
}
