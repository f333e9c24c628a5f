// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the minimal surface of a queue-based broker that the
//! pools and the RPC client/server need: connections that host channels, and
//! channels that declare queues, publish envelopes and consume deliveries
//! with manual acknowledgement.
//!
//! It intentionally avoids any reference to a concrete client library.
//! Concrete implementations live under `src/transport/`; the in-memory broker
//! is the reference implementation of these semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// String-keyed message headers.
pub type Headers = HashMap<String, String>;

/// Reply header marking the payload as an error message.
pub const STATUS_HEADER: &str = "x-rpc-status";
pub const STATUS_ERROR: &str = "error";

/// Request header counting delivery attempts made by the server, starting
/// at 1. Absent on a request that has not been retried.
pub const ATTEMPT_HEADER: &str = "x-rpc-attempt";

/// Whether the broker should persist a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_amqp(value: u8) -> Self {
        if value == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// A message as published to, or delivered by, the broker.
///
/// # Examples
///
/// ```
/// # use amqp_rpc::Envelope;
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Arc::from("rpc_queue"),
///     Bytes::from_static(b"ping"),
///     Arc::from("correlation-123"),
///     Arc::from("amq.gen-reply"),
///     Arc::from("text/plain"),
/// );
/// assert_eq!(request.exchange.as_ref(), "");
///
/// let reply = Envelope::response(
///     Arc::from("amq.gen-reply"),
///     Bytes::from_static(b"pong"),
///     Arc::from("correlation-123"),
///     Arc::from("text/plain"),
/// );
/// assert!(reply.reply_to.is_none());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Exchange to publish through. Empty means the default exchange, which
    /// routes by queue name.
    pub exchange: Arc<str>,

    /// Routing key; with the default exchange this is the queue name.
    pub routing_key: Arc<str>,

    /// Correlation identifier linking a reply to its request.
    pub correlation_id: Option<Arc<str>>,

    /// Queue the reply must be published to. Requests only.
    pub reply_to: Option<Arc<str>>,

    /// Informational payload format, e.g. `application/json`.
    pub content_type: Option<Arc<str>>,

    pub delivery_mode: DeliveryMode,

    /// Application headers, including propagated trace context.
    pub headers: Headers,

    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    // ---
    /// Create a request envelope routed through the default exchange.
    pub fn request(
        routing_key: Arc<str>,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Arc<str>,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            exchange: Arc::from(""),
            routing_key,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(content_type),
            delivery_mode: DeliveryMode::Transient,
            headers: Headers::new(),
            payload,
        }
    }

    /// Create a reply envelope addressed to the requester's reply queue.
    pub fn response(
        reply_to: Arc<str>,
        payload: Bytes,
        correlation_id: Arc<str>,
        content_type: Arc<str>,
    ) -> Self {
        // ---
        Self {
            exchange: Arc::from(""),
            routing_key: reply_to,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(content_type),
            delivery_mode: DeliveryMode::Transient,
            headers: Headers::new(),
            payload,
        }
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = Arc::from(exchange);
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Whether this reply reports a server-side failure.
    pub fn is_error_reply(&self) -> bool {
        self.header(STATUS_HEADER) == Some(STATUS_ERROR)
    }

    /// Delivery attempts recorded on this request (1 when never retried).
    pub fn attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Well-known request queue: non-durable, shared, kept when idle.
    pub fn request_queue() -> Self {
        Self::default()
    }

    /// Private reply queue: exclusive to the client connection, auto-deleted.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Deliveries count as acknowledged as soon as they are sent.
    pub no_ack: bool,
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
///
/// Must be settled with [`ack`](Self::ack) or [`nack`](Self::nack) unless
/// the consumer was started with `no_ack`. Only the first settlement reaches
/// the broker; later calls are no-ops.
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
    settled: AtomicBool,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        // ---
        Self {
            envelope,
            delivery_tag,
            redelivered,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        // ---
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        // ---
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Deliveries for one consumer. Ends when the channel or connection closes.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// A multiplexed session over one connection.
///
/// Channels are not meant to be driven by two borrowers at once; the pools
/// hand each one to a single holder at a time.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Identifier, unique within the owning connection.
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Declare `name` (idempotent) and return its name. An empty name asks
    /// the broker to generate a unique one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Bound unacknowledged deliveries for consumers started afterwards.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn publish(&self, env: Envelope) -> Result<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

pub type ChannelPtr = Arc<dyn BrokerChannel>;

/// A transport-level session to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<ChannelPtr>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<()>;
}

pub type ConnectionPtr = Arc<dyn BrokerConnection>;

/// Opens broker connections for the pool.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Unreachable brokers should map to
    /// [`RpcError::TransportRetryable`](crate::RpcError::TransportRetryable)
    /// so the pool's connect backoff applies.
    async fn connect(&self, uri: &str) -> Result<ConnectionPtr>;
}

pub type ConnectorPtr = Arc<dyn Connector>;
