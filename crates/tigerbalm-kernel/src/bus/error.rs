//! Typed errors and result aliases for the dispatch bus.

use error_stack::Report;
use thiserror::Error;

use super::SlotType;

/// Error-stack backed result alias for bus operations.
///
/// Equivalent to `Result<T, error_stack::Report<BusError>>`.
pub type BusResult<T> = ::std::result::Result<T, Report<BusError>>;

/// Extension trait to convert `Result<T, BusError>` into [`BusResult<T>`].
pub trait IntoBusReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> BusResult<T>;
}

impl<T> IntoBusReport<T> for ::std::result::Result<T, BusError> {
    #[inline]
    fn into_report(self) -> BusResult<T> {
        self.map_err(Report::new)
    }
}

/// Errors raised while registering or removing slot handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// No slot is registered for the requested type.
    #[error("no such slot: {0}")]
    NoSuchSlot(SlotType),

    /// The match key is already bound; the caller must deregister it first.
    #[error("duplicate registration on {slot} slot: {key}")]
    DuplicateRegistration { slot: SlotType, key: String },

    /// The slot accepted the call but its transport refused it.
    #[error("{slot} slot failure: {reason}")]
    SlotFailure { slot: SlotType, reason: String },
}

impl BusError {
    /// Shorthand for [`BusError::DuplicateRegistration`].
    pub fn duplicate(slot: SlotType, key: impl Into<String>) -> Self {
        Self::DuplicateRegistration {
            slot,
            key: key.into(),
        }
    }

    /// Shorthand for [`BusError::SlotFailure`].
    pub fn slot_failure(slot: SlotType, reason: impl Into<String>) -> Self {
        Self::SlotFailure {
            slot,
            reason: reason.into(),
        }
    }
}

/// Result alias for handler invocations.
pub type DispatchResult<T> = ::std::result::Result<T, DispatchError>;

/// Errors a dispatched handler can report back to its transport.
///
/// Transports map these onto their own failure surface: the HTTP slot turns
/// them into status codes, the Kafka slot logs them and moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// Nothing is bound for the event's key.
    #[error("no handler bound for {0}")]
    NotFound(String),

    /// The inbound event could not be decoded.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No interpreter instance could be produced for the call.
    #[error("interpreter unavailable: {0}")]
    InterpreterUnavailable(String),

    /// The handler ran and failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The handler returned a reply of the wrong kind for the transport.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}
