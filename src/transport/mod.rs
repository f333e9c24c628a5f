//! Broker implementations.
//!
//! Concrete implementations of the domain-level broker traits. Networked
//! brokers sit behind feature flags; the in-memory broker is always built.
//!
//! Pool, client and server code must not depend on transport-specific types.

mod amqp;
mod memory;

pub use memory::{MemoryBroker, MemoryConnector};

#[cfg(feature = "transport_lapin")]
pub use amqp::{create_lapin_connector, LapinConnector};
