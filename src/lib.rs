//! Request/response RPC over a queue-based message broker.
//!
//! The crate has three cooperating parts:
//!
//! - a two-level pool ([`ConnectionPool`] of [`ChannelPool`]s) bounding
//!   broker connections and the channels checked out on each,
//! - an [`RpcClient`] that publishes requests tagged with a correlation id
//!   and its private reply queue, then awaits the matching reply,
//! - an [`RpcServer`] that consumes a well-known request queue with bounded
//!   prefetch, runs a [`RequestHandler`] and publishes the correlated reply.
//!
//! Trace context travels in a `traceparent` header (see [`trace`]).
//!
//! Brokers plug in through the [`Connector`] trait. [`MemoryBroker`] is an
//! in-process implementation, always available; an AMQP 0-9-1 connector
//! backed by `lapin` sits behind the `transport_lapin` feature.

mod macros;
mod sync;

mod client;
mod domain;
mod pool;
mod server;
mod transport;

mod correlation;
mod error;
mod retry;
mod rpc_config;

pub mod trace;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use client::RpcClient;
pub use server::{handler_fn, json_handler, HandlerPtr, Request, RequestHandler, RpcServer};

pub use pool::{ChannelLease, ChannelPool, ConnectionPool, PoolStats};

pub use retry::RetryConfig;
pub use rpc_config::{FailurePolicy, PoolConfig, RpcConfig};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use transport::{MemoryBroker, MemoryConnector};

#[cfg(feature = "transport_lapin")]
pub use transport::{create_lapin_connector, LapinConnector};

pub use domain::{
    //
    Acker,
    BrokerChannel,
    BrokerConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumeOptions,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryMode,
    DeliveryStream,
    Envelope,
    Headers,
    QueueOptions,
    ATTEMPT_HEADER,
    STATUS_ERROR,
    STATUS_HEADER,
};
