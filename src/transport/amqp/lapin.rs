//! AMQP 0-9-1 broker backed by `lapin`.
//!
//! Maps the domain broker traits one-to-one onto lapin's connection and
//! channel types:
//!
//! - [`LapinConnector`] opens a `lapin::Connection` per pooled connection.
//! - Each pooled channel is a `lapin::Channel`; queue declaration, prefetch
//!   (`basic.qos`), publish and consume go straight to it.
//! - Every `basic.consume` gets a forwarding task that turns lapin
//!   deliveries into domain [`Delivery`] values carrying a lapin acker.
//!
//! ## Message properties
//!
//! Envelope fields travel as AMQP basic properties (`correlation_id`,
//! `reply_to`, `content_type`, `delivery_mode`). String headers travel in
//! the properties' header table as long strings; non-string header values
//! on incoming messages are ignored.
//!
//! ## Failure mapping
//!
//! Failure to open a connection maps to
//! [`RpcError::TransportRetryable`] so the pool's connect backoff applies.
//! Failures on an open channel map to [`RpcError::Transport`]. Ack and nack
//! failures surface as [`RpcError::Amqp`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lapin::{
    //
    message::Delivery as LapinDelivery,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::mpsc;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
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
    Result,
    RpcError,
};

/// Buffer between a lapin consumer and its delivery stream.
const DELIVERY_BUFFER: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opens lapin connections for the pool.
#[derive(Default, Clone)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl std::fmt::Debug for LapinConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapinConnector").finish_non_exhaustive()
    }
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom lapin connection properties (client name, executor, ...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }

    pub fn into_ptr(self) -> ConnectorPtr {
        Arc::new(self)
    }
}

/// Connector for an AMQP broker with default connection properties.
pub fn create_lapin_connector() -> ConnectorPtr {
    LapinConnector::new().into_ptr()
}

#[async_trait::async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<ConnectionPtr> {
        // ---
        log_debug!("amqp: connecting to broker");

        let connection = Connection::connect(uri, self.properties.clone())
            .await
            .map_err(|e| {
                let msg = format!("amqp: connection failed: {e}");
                log_error!("{msg}");
                RpcError::TransportRetryable(msg)
            })?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        log_info!("amqp: connection {id} established");

        Ok(Arc::new(LapinConnection { id, connection }))
    }
}

pub struct LapinConnection {
    id: u64,
    connection: Connection,
}

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<ChannelPtr> {
        // ---
        let channel = self.connection.create_channel().await.map_err(|e| {
            RpcError::Transport(format!("amqp: channel creation failed: {e}"))
        })?;

        log_debug!("amqp: connection {} opened channel {}", self.id, channel.id());
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.is_open() {
            self.connection
                .close(200, "Normal shutdown".into())
                .await
                .map_err(|e| RpcError::Transport(format!("amqp: connection close failed: {e}")))?;
            log_info!("amqp: connection {} closed", self.id);
        }
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        let declared = queue.name().as_str().to_string();
        log_debug!("amqp: declared queue {declared}");
        Ok(declared)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: basic.qos failed: {e}")))
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let properties = to_properties(&env);

        self.channel
            .basic_publish(
                env.exchange.as_ref().into(),
                env.routing_key.as_ref().into(),
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("amqp: published to {}", env.routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        // ---
        let consume_opts = BasicConsumeOptions {
            no_ack: options.no_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue.into(),
                options.consumer_tag.as_str().into(),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("amqp: consuming {queue}");

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let queue = queue.to_string();

        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if tx.send(from_lapin(delivery)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("amqp: consumer error on {queue}: {e}");
                        break;
                    }
                }
            }
            log_info!("amqp: consumer ended for {queue}");
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.is_open() {
            self.channel
                .close(200, "Normal shutdown".into())
                .await
                .map_err(|e| RpcError::Transport(format!("amqp: channel close failed: {e}")))?;
        }
        Ok(())
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait::async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        // ---
        self.acker
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await?;
        Ok(())
    }
}

fn to_properties(env: &Envelope) -> BasicProperties {
    // ---
    let mut properties =
        BasicProperties::default().with_delivery_mode(env.delivery_mode.as_amqp());

    if let Some(id) = &env.correlation_id {
        properties = properties.with_correlation_id(id.as_ref().into());
    }
    if let Some(reply_to) = &env.reply_to {
        properties = properties.with_reply_to(reply_to.as_ref().into());
    }
    if let Some(content_type) = &env.content_type {
        properties = properties.with_content_type(content_type.as_ref().into());
    }
    if !env.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &env.headers {
            table.insert(key.as_str().into(), AMQPValue::LongString(value.clone().into()));
        }
        properties = properties.with_headers(table);
    }
    properties
}

fn from_lapin(delivery: LapinDelivery) -> Delivery {
    // ---
    let envelope = to_envelope(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        &delivery.properties,
        delivery.data,
    );

    Delivery::new(
        envelope,
        delivery.delivery_tag,
        delivery.redelivered,
        Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    )
}

fn to_envelope(
    exchange: &str,
    routing_key: &str,
    props: &BasicProperties,
    payload: Vec<u8>,
) -> Envelope {
    // ---
    let text = |s: &Option<lapin::types::ShortString>| -> Option<Arc<str>> {
        s.as_ref().map(|v| Arc::from(v.as_str()))
    };

    let mut headers = Headers::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(s.as_bytes()).into_owned(),
                );
            }
        }
    }

    Envelope {
        exchange: Arc::from(exchange),
        routing_key: Arc::from(routing_key),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        content_type: text(props.content_type()),
        delivery_mode: props
            .delivery_mode()
            .map_or(DeliveryMode::Transient, DeliveryMode::from_amqp),
        headers,
        payload: payload.into(),
    }
}
