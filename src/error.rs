use thiserror::Error;

/// Errors that can occur while pooling broker resources or performing RPC
/// calls.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Pool or RPC settings are out of bounds. Raised at startup, before any
    /// traffic is served.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No reply arrived (or no channel became free) within the deadline.
    #[error("request timed out")]
    Timeout,

    /// The caller (or a shutdown) cancelled the operation.
    #[error("request cancelled")]
    Cancelled,

    /// The reply consumer stopped because its channel or connection died.
    #[error("broker connection lost")]
    ConnectionLost,

    /// The connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Non-retryable broker or transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transient transport failure; eligible for `retry_with_backoff`.
    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A server-side request handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The server answered with an error reply.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// A pending request with this correlation id is already registered.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),

    /// An exclusive queue is owned by another connection.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// Error reported by the AMQP client library.
    #[cfg(feature = "transport_lapin")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl RpcError {
    /// Build a handler failure from anything printable.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        // ---
        RpcError::Handler(msg.to_string())
    }
}

/// Result type alias for pool and RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
