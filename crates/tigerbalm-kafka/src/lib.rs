//! Tigerbalm Kafka transport.
//!
//! - [`producer`]: shared intake, per-topic worker lanes, success/failure
//!   reporting and a lossless shutdown
//! - [`consumer_group`]: `(topic, group)` subscriptions feeding handlers or an
//!   output queue
//! - [`slot`]: the bus [`Slot`](tigerbalm_kernel::Slot) over a consumer group
//! - [`client`]: the broker seams, with backends in [`backend`]

pub mod backend;
pub mod client;
pub mod consumer_group;
pub mod error;
pub mod producer;
pub mod slot;

pub use backend::MemoryBroker;
pub use consumer_group::{ConsumerGroup, GroupOptions};
pub use error::{KafkaError, KafkaResult};
pub use producer::{Producer, ProducerInput, ProducerOptions};
pub use slot::KafkaSlot;
