//! Records handed between transports and plugin handlers.

pub mod http;
pub mod kafka;

pub use http::{CONTENT_LENGTH, Request, Response, RouteKey};
pub use kafka::{ConsumeKey, ConsumerGroupMessage, MessageSink, ProducerMessage, SinkClosed};
