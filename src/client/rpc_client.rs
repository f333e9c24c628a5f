use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pending::{PendingGuard, PendingRequests};
use crate::sync::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    trace,
    ChannelLease,
    ConnectionPool,
    ConsumeOptions,
    CorrelationId,
    DeliveryStream,
    Envelope,
    QueueOptions,
    Result,
    RpcConfig,
    RpcError,
};

/// Awaitable request/response calls over a pooled broker.
///
/// At startup the client declares a broker-named, exclusive reply queue and
/// consumes it for its whole lifetime. Each send publishes the request with
/// a fresh correlation id and that queue as `reply_to`, then waits for the
/// reply loop to hand over the matching reply.
///
/// Cheap to clone; clones share the reply queue and pending map.
///
/// ```
/// # async fn example() -> amqp_rpc::Result<()> {
/// use amqp_rpc::{handler_fn, ConnectionPool, MemoryBroker, PoolConfig, RpcClient, RpcConfig, RpcServer};
///
/// let broker = MemoryBroker::new();
/// let pool = ConnectionPool::open(PoolConfig::new("memory://"), broker.connector()).await?;
/// let config = RpcConfig::new("echo").with_content_type("text/plain");
///
/// let server = RpcServer::new(pool.clone(), config.clone(), handler_fn(|req| async move {
///     Ok(req.payload)
/// }));
/// server.start().await?;
///
/// let client = RpcClient::start(pool, config).await?;
/// let reply = client.send("hello").await?;
/// assert_eq!(reply, "hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    pool: ConnectionPool,
    config: RpcConfig,
    reply_queue: Arc<str>,
    pending: Arc<PendingRequests>,
    token: CancellationToken,
    lost: Arc<AtomicBool>,
    consumer: Mutex<Option<ChannelLease>>,
    reply_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        // ---
        if !self.token.is_cancelled() {
            Ok(())
        } else if self.lost.load(Ordering::SeqCst) {
            Err(RpcError::ConnectionLost)
        } else {
            Err(RpcError::Cancelled)
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        self.token.cancel();

        // still consuming the reply queue; must not go back to the pool open
        let lease = lock_ignore_poison(&self.consumer).take();
        if let Some(lease) = lease {
            log_debug!("rpc client dropped without shutdown; discarding reply channel");
            lease.discard();
        }
    }
}

impl RpcClient {
    /// Declare the reply queue and start consuming it.
    ///
    /// The consuming channel stays checked out of `pool` until
    /// [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidConfig`] for a bad `config`; pool and broker errors
    /// while setting up the reply queue.
    pub async fn start(pool: ConnectionPool, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let lease = pool.get_channel_timeout(config.request_timeout).await?;
        let reply_queue = lease.declare_queue("", QueueOptions::reply_queue()).await?;
        let stream = lease
            .consume(
                &reply_queue,
                ConsumeOptions {
                    consumer_tag: format!("rpc-client-{reply_queue}"),
                    no_ack: true,
                },
            )
            .await?;

        let pending = Arc::new(PendingRequests::new());
        let token = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let reply_task = tokio::spawn(reply_loop(
            Arc::clone(&pending),
            stream,
            token.clone(),
            Arc::clone(&lost),
        ));

        log_info!(
            "rpc client started: requests to {}, replies on {reply_queue}",
            config.request_queue
        );

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                config,
                reply_queue: Arc::from(reply_queue),
                pending,
                token,
                lost,
                consumer: Mutex::new(Some(lease)),
                reply_task: Mutex::new(Some(reply_task)),
            }),
        })
    }

    /// Send `payload` and wait for the reply, bounded by the configured
    /// request timeout.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if no reply arrives in time
    /// - [`RpcError::Remote`] if the server answered with an error reply
    /// - [`RpcError::Cancelled`] if the client is shut down meanwhile
    /// - [`RpcError::ConnectionLost`] if the reply consumer dies meanwhile
    /// - pool and publish errors
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.send_with_timeout(payload, self.inner.config.request_timeout)
            .await
    }

    /// [`send`](Self::send) with an explicit deadline covering channel
    /// acquisition, publish and the wait for the reply.
    pub async fn send_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        // ---
        tokio::time::timeout(timeout, self.dispatch(payload.into()))
            .await
            .map_err(|_| RpcError::Timeout)?
    }

    /// [`send_with_timeout`](Self::send_with_timeout) that also gives up with
    /// [`RpcError::Cancelled`] as soon as `token` fires.
    pub async fn send_with_cancel(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Bytes> {
        // ---
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RpcError::Cancelled),
            reply = self.send_with_timeout(payload, timeout) => reply,
        }
    }

    /// JSON round trip: serialize `request`, send it, deserialize the reply.
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        // ---
        let payload = serde_json::to_vec(request)?;
        let reply = self.send(payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Requests currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Broker-assigned name of this client's reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Stop the reply loop and close the reply channel.
    ///
    /// Outstanding requests resolve with [`RpcError::Cancelled`]; later sends
    /// fail the same way.
    pub async fn shutdown(&self) {
        // ---
        self.inner.token.cancel();

        let task = lock_ignore_poison(&self.inner.reply_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let lease = lock_ignore_poison(&self.inner.consumer).take();
        if let Some(lease) = lease {
            if let Err(e) = lease.close().await {
                log_debug!("closing reply channel failed: {e}");
            }
        }
        log_info!("rpc client on {} shut down", self.inner.reply_queue);
    }

    async fn dispatch(&self, payload: Bytes) -> Result<Bytes> {
        // ---
        let inner = &*self.inner;
        inner.ensure_running()?;

        let id = CorrelationId::generate();
        let reply = inner.pending.register(id.clone())?;
        let _guard = PendingGuard::new(&inner.pending, id.clone());

        // the reply loop may have stopped between the check and register
        inner.ensure_running()?;

        let mut request = Envelope::request(
            Arc::from(inner.config.request_queue.as_str()),
            payload,
            id.as_arc(),
            Arc::clone(&inner.reply_queue),
            Arc::clone(&inner.config.content_type),
        )
        .with_delivery_mode(inner.config.delivery_mode);

        let cx = trace::producer_context(&inner.config.request_queue);
        trace::inject_context(&cx, &mut request.headers);

        {
            let lease = inner.pool.get_channel().await?;
            lease.publish(request).await?;
        }
        log_debug!("sent request {id} to {}", inner.config.request_queue);

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionLost),
        }
    }
}

async fn reply_loop(
    pending: Arc<PendingRequests>,
    mut stream: DeliveryStream,
    token: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    // ---
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                pending.fail_all(|| RpcError::Cancelled);
                break;
            }
            next = stream.recv() => next,
        };

        let Some(delivery) = next else {
            log_warn!("reply consumer ended; failing pending requests");
            lost.store(true, Ordering::SeqCst);
            token.cancel();
            pending.fail_all(|| RpcError::ConnectionLost);
            break;
        };

        dispatch_reply(&pending, delivery.envelope);
    }
}

fn dispatch_reply(pending: &PendingRequests, reply: Envelope) {
    // ---
    let Some(id) = reply.correlation_id.clone() else {
        log_debug!("dropping reply without correlation id");
        return;
    };
    let id = CorrelationId::from(id);

    let result = if reply.is_error_reply() {
        Err(RpcError::Remote(
            String::from_utf8_lossy(&reply.payload).into_owned(),
        ))
    } else {
        Ok(reply.payload)
    };

    if !pending.complete(&id, result) {
        log_debug!("dropping late or unknown reply {id}");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{STATUS_ERROR, STATUS_HEADER};

    fn reply(id: Option<&str>, body: &'static str) -> Envelope {
        let mut env = Envelope::response(
            Arc::from("amq.gen-test"),
            Bytes::from_static(body.as_bytes()),
            Arc::from("unused"),
            Arc::from("text/plain"),
        );
        env.correlation_id = id.map(Arc::from);
        env
    }

    #[tokio::test]
    async fn reply_resolves_matching_request() {
        // ---
        let pending = PendingRequests::new();
        let id = CorrelationId::from("c-1");
        let rx = pending.register(id).unwrap();

        dispatch_reply(&pending, reply(Some("c-1"), "pong"));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from("pong"));
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        // ---
        let pending = PendingRequests::new();
        let rx = pending.register(CorrelationId::from("c-1")).unwrap();

        let env = reply(Some("c-1"), "boom").with_header(STATUS_HEADER, STATUS_ERROR);
        dispatch_reply(&pending, env);

        match rx.await.unwrap() {
            Err(RpcError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unmatched_replies_are_dropped() {
        // ---
        let pending = PendingRequests::new();
        let _rx = pending.register(CorrelationId::from("c-1")).unwrap();

        dispatch_reply(&pending, reply(None, "x"));
        dispatch_reply(&pending, reply(Some("other"), "x"));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn dropped_client_does_not_hand_its_reply_channel_to_the_pool() {
        // ---
        let broker = crate::MemoryBroker::new();
        let pool = ConnectionPool::open(
            crate::PoolConfig::new("memory://")
                .with_connections(1, 1)
                .with_channels(1, 1),
            broker.connector(),
        )
        .await
        .unwrap();

        let client = RpcClient::start(pool.clone(), RpcConfig::new("work")).await.unwrap();
        let reply_channel = lock_ignore_poison(&client.inner.consumer)
            .as_ref()
            .map(|lease| Arc::clone(lease.channel()))
            .unwrap();
        drop(client);

        let lease = pool
            .get_channel_timeout(Duration::from_millis(200))
            .await
            .unwrap();
        assert_ne!(lease.id(), reply_channel.id());

        for _ in 0..100 {
            if !reply_channel.is_open() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!reply_channel.is_open());
    }
}
