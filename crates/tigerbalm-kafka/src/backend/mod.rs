//! Broker backends.

mod lanes;
mod memory;

#[cfg(feature = "rdkafka")]
mod librdkafka;

pub use memory::{DEFAULT_PARTITIONS, MemoryBroker};

#[cfg(feature = "rdkafka")]
pub use librdkafka::{RdGroupConnector, RdProducerConnector};
