//! RPC client.
//!
//! [`RpcClient`] turns one-way publishing into an awaitable call. A single
//! background reply loop consumes the client's private reply queue and
//! matches each reply to its waiting request through the correlation id.
//!
//! # Concurrency
//!
//! Any number of requests may be in flight. The pending map supports atomic
//! insert and remove-if-present, so the reply loop and a timing-out caller
//! can never both resolve the same request. Correlation ids are fresh UUIDs,
//! so a reply arriving after its request gave up finds nothing and is
//! dropped.

mod pending;
mod rpc_client;

pub use rpc_client::RpcClient;
