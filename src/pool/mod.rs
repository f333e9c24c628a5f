//! Two-level broker resource pool.
//!
//! [`ConnectionPool`] owns a bounded set of connections; each connection owns
//! a [`ChannelPool`] bounding the channels checked out on it. Callers borrow a
//! channel as a [`ChannelLease`] and give it back by dropping it.

mod channel_pool;
mod connection_pool;

pub use channel_pool::ChannelPool;
pub use connection_pool::{ChannelLease, ConnectionPool, PoolStats};
