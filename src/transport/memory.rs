//! In-memory broker.
//!
//! A pure in-process implementation of the domain-level broker traits. It is
//! intended for testing, local execution, and as the reference for broker
//! semantics.
//!
//! ## Reference Semantics
//!
//! - Only the default exchange exists: a message is routed to the queue
//!   named by its routing key. Publishing to a queue that does not exist
//!   drops the message silently.
//! - Competing consumers share a queue; each message goes to one of them.
//! - A channel's prefetch (set before `consume`) bounds the unacknowledged
//!   deliveries each of its consumers may hold.
//! - `nack(requeue = true)`, and any delivery dropped without being settled,
//!   puts the message back on its queue flagged `redelivered`.
//! - Exclusive queues belong to the declaring connection and vanish with it.
//!   Auto-delete queues vanish once their last consumer goes away.
//! - Closing a connection closes all of its channels and ends their
//!   consumers.
//!
//! ## Non-Goals
//!
//! Persistence, exchanges other than the default one, and the exact failure
//! modes of a networked broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sync::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    Acker,
    BrokerChannel,
    BrokerConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumeOptions,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    Envelope,
    QueueOptions,
    Result,
    RpcError,
};

/// Capacity of each consumer's delivery buffer when no prefetch is set.
const UNBOUNDED_CONSUMER_BUFFER: usize = 64;

struct Queued {
    envelope: Envelope,
    redelivered: bool,
}

struct MemoryQueue {
    // ---
    name: String,
    options: QueueOptions,
    owner: Option<u64>,
    tx: mpsc::UnboundedSender<Queued>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>,
    depth: AtomicUsize,
    consumers: AtomicUsize,
    deleted: CancellationToken,
}

impl MemoryQueue {
    fn new(name: String, options: QueueOptions, owner: Option<u64>) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            options,
            owner,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            deleted: CancellationToken::new(),
        }
    }

    fn push(&self, envelope: Envelope, redelivered: bool) {
        // ---
        if self.deleted.is_cancelled() {
            return;
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Queued { envelope, redelivered }).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn check_owner(&self, connection_id: u64) -> Result<()> {
        // ---
        match self.owner {
            Some(owner) if owner != connection_id => Err(RpcError::ResourceLocked(format!(
                "queue '{}' is exclusive to another connection",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Shared in-process broker.
///
/// Every [`MemoryConnector`] created from the same broker sees the same
/// queues, exactly as clients of one networked broker would.
///
/// ```
/// # async fn example() -> amqp_rpc::Result<()> {
/// use amqp_rpc::{ConnectionPool, MemoryBroker, PoolConfig};
///
/// let broker = MemoryBroker::new();
/// let pool = ConnectionPool::open(PoolConfig::new("memory://"), broker.connector()).await?;
/// let lease = pool.get_channel().await?;
/// assert!(lease.channel().is_open());
/// # Ok(())
/// # }
/// ```
pub struct MemoryBroker {
    // ---
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    next_id: AtomicU64,
    fail_connects: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_connects: AtomicUsize::new(0),
        })
    }

    /// Connector handing out connections to this broker.
    pub fn connector(self: &Arc<Self>) -> ConnectorPtr {
        Arc::new(MemoryConnector {
            broker: Arc::clone(self),
        })
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock_ignore_poison(&self.queues).contains_key(name)
    }

    /// Messages waiting in `name` (not yet delivered to a consumer).
    pub fn queue_depth(&self, name: &str) -> usize {
        // ---
        lock_ignore_poison(&self.queues)
            .get(name)
            .map_or(0, |q| q.depth.load(Ordering::SeqCst))
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        // ---
        let mut conns = lock_ignore_poison(&self.connections);
        conns.retain(|c| c.strong_count() > 0);
        conns
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .count()
    }

    /// Make the next `n` connection attempts fail as unreachable.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Drop every open connection, as a broker restart would.
    pub async fn close_all_connections(&self) {
        // ---
        let conns: Vec<Arc<MemoryConnection>> = lock_ignore_poison(&self.connections)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for conn in conns {
            conn.shut();
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock_ignore_poison(&self.queues).get(name).cloned()
    }

    fn declare(&self, name: &str, options: QueueOptions, connection_id: u64) -> Result<String> {
        // ---
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut queues = lock_ignore_poison(&self.queues);
        if let Some(existing) = queues.get(&name) {
            existing.check_owner(connection_id)?;
            return Ok(name);
        }

        let owner = options.exclusive.then_some(connection_id);
        queues.insert(
            name.clone(),
            Arc::new(MemoryQueue::new(name.clone(), options, owner)),
        );
        log_debug!("memory broker: declared queue {name}");
        Ok(name)
    }

    fn route(&self, env: Envelope) -> Result<()> {
        // ---
        if !env.exchange.is_empty() {
            return Err(RpcError::Transport(format!(
                "memory broker has no exchange '{}'",
                env.exchange
            )));
        }

        match self.queue(&env.routing_key) {
            Some(queue) => queue.push(env, false),
            None => log_debug!("memory broker: no queue '{}', message dropped", env.routing_key),
        }
        Ok(())
    }

    fn delete_queue(&self, name: &str) {
        // ---
        if let Some(queue) = lock_ignore_poison(&self.queues).remove(name) {
            queue.deleted.cancel();
            log_debug!("memory broker: deleted queue {name}");
        }
    }

    fn delete_exclusive_queues(&self, connection_id: u64) {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);
        queues.retain(|_, q| {
            let owned = q.owner == Some(connection_id);
            if owned {
                q.deleted.cancel();
            }
            !owned
        });
    }
}

/// Opens [`MemoryConnection`]s on a [`MemoryBroker`].
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _uri: &str) -> Result<ConnectionPtr> {
        // ---
        let refused = self
            .broker
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RpcError::TransportRetryable(
                "memory broker refused connection".into(),
            ));
        }

        let conn = Arc::new(MemoryConnection {
            id: self.broker.next_id(),
            broker: Arc::clone(&self.broker),
            token: CancellationToken::new(),
        });
        lock_ignore_poison(&self.broker.connections).push(Arc::downgrade(&conn));
        log_debug!("memory broker: connection {} opened", conn.id);
        Ok(conn)
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: Arc<MemoryBroker>,
    token: CancellationToken,
}

impl MemoryConnection {
    fn shut(&self) {
        // ---
        if !self.token.is_cancelled() {
            self.token.cancel();
            self.broker.delete_exclusive_queues(self.id);
            log_debug!("memory broker: connection {} closed", self.id);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shut();
    }
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn create_channel(&self) -> Result<ChannelPtr> {
        // ---
        if !self.is_open() {
            return Err(RpcError::Transport(format!(
                "connection {} is closed",
                self.id
            )));
        }

        Ok(Arc::new(MemoryChannel {
            id: self.broker.next_id(),
            connection_id: self.id,
            broker: Arc::clone(&self.broker),
            token: self.token.child_token(),
            prefetch: AtomicU16::new(0),
            next_tag: Arc::new(AtomicU64::new(0)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        Ok(())
    }
}

pub struct MemoryChannel {
    // ---
    id: u64,
    connection_id: u64,
    broker: Arc<MemoryBroker>,
    token: CancellationToken,
    prefetch: AtomicU16,
    next_tag: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.token.is_cancelled() {
            return Err(RpcError::Transport(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        self.broker.declare(name, options, self.connection_id)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.broker.route(env)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        // ---
        self.ensure_open()?;

        let queue = self
            .broker
            .queue(queue)
            .ok_or_else(|| RpcError::Transport(format!("no queue '{queue}'")))?;
        queue.check_owner(self.connection_id)?;

        let prefetch = self.prefetch.load(Ordering::SeqCst) as usize;
        let limit = (prefetch > 0 && !options.no_ack).then(|| Arc::new(Semaphore::new(prefetch)));
        let buffer = if prefetch > 0 { prefetch } else { UNBOUNDED_CONSUMER_BUFFER };
        let (tx, rx) = mpsc::channel(buffer);

        queue.consumers.fetch_add(1, Ordering::SeqCst);

        let consumer = MemoryConsumer {
            queue,
            broker: Arc::clone(&self.broker),
            token: self.token.clone(),
            limit,
            no_ack: options.no_ack,
            next_tag: Arc::clone(&self.next_tag),
            tag: options.consumer_tag,
        };
        tokio::spawn(consumer.run(tx));

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

/// Background task pumping one queue into one consumer's delivery stream.
struct MemoryConsumer {
    queue: Arc<MemoryQueue>,
    broker: Arc<MemoryBroker>,
    token: CancellationToken,
    limit: Option<Arc<Semaphore>>,
    no_ack: bool,
    next_tag: Arc<AtomicU64>,
    tag: String,
}

impl MemoryConsumer {
    async fn run(self, tx: mpsc::Sender<Delivery>) {
        // ---
        log_debug!("memory broker: consumer '{}' started on {}", self.tag, self.queue.name);

        loop {
            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(p) => Some(p),
                        Err(_) => break,
                    },
                    _ = self.token.cancelled() => break,
                    _ = self.queue.deleted.cancelled() => break,
                    _ = tx.closed() => break,
                },
                None => None,
            };

            let next = {
                let mut rx = tokio::select! {
                    guard = self.queue.rx.lock() => guard,
                    _ = self.token.cancelled() => break,
                    _ = self.queue.deleted.cancelled() => break,
                    _ = tx.closed() => break,
                };
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = self.token.cancelled() => None,
                    _ = self.queue.deleted.cancelled() => None,
                    _ = tx.closed() => None,
                }
            };
            let Some(msg) = next else { break };
            self.queue.depth.fetch_sub(1, Ordering::SeqCst);

            let acker = MemoryAcker {
                queue: Arc::clone(&self.queue),
                envelope: msg.envelope.clone(),
                permit: Mutex::new(permit),
                settled: AtomicBool::new(self.no_ack),
            };
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery::new(msg.envelope, tag, msg.redelivered, Box::new(acker));

            // A rejected send drops the delivery, which requeues it.
            if tx.send(delivery).await.is_err() {
                break;
            }
        }

        let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.queue.options.auto_delete {
            self.broker.delete_queue(&self.queue.name);
        }
        log_debug!("memory broker: consumer '{}' stopped on {}", self.tag, self.queue.name);
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    envelope: Envelope,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) {
        // ---
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        if requeue {
            self.queue.push(self.envelope.clone(), true);
        }
        lock_ignore_poison(&self.permit).take();
    }
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(requeue);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(true);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn message(queue: &str, body: &'static str) -> Envelope {
        Envelope::request(
            Arc::from(queue),
            Bytes::from_static(body.as_bytes()),
            Arc::from("c-1"),
            Arc::from("replies"),
            Arc::from("text/plain"),
        )
    }

    async fn channel(broker: &Arc<MemoryBroker>) -> (ConnectionPtr, ChannelPtr) {
        let conn = broker.connector().connect("memory://").await.unwrap();
        let chan = conn.create_channel().await.unwrap();
        (conn, chan)
    }

    #[tokio::test]
    async fn messages_wait_in_queue_until_consumed() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, chan) = channel(&broker).await;

        chan.declare_queue("work", QueueOptions::request_queue()).await.unwrap();
        chan.publish(message("work", "a")).await.unwrap();
        assert_eq!(broker.queue_depth("work"), 1);

        let mut stream = chan.consume("work", ConsumeOptions::default()).await.unwrap();
        let delivery = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.payload, Bytes::from_static(b"a"));
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn publish_to_missing_queue_is_dropped() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, chan) = channel(&broker).await;

        chan.publish(message("nowhere", "x")).await.unwrap();
        assert!(!broker.queue_exists("nowhere"));
    }

    #[tokio::test]
    async fn server_named_queue_is_generated() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, chan) = channel(&broker).await;

        let name = chan.declare_queue("", QueueOptions::reply_queue()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn prefetch_holds_back_until_ack() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, chan) = channel(&broker).await;

        chan.declare_queue("work", QueueOptions::request_queue()).await.unwrap();
        chan.set_prefetch(1).await.unwrap();
        chan.publish(message("work", "a")).await.unwrap();
        chan.publish(message("work", "b")).await.unwrap();

        let mut stream = chan.consume("work", ConsumeOptions::default()).await.unwrap();
        let first = stream.recv().await.unwrap();
        assert!(timeout(Duration::from_millis(50), stream.recv()).await.is_err());

        first.ack().await.unwrap();
        let second = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.envelope.payload, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, chan) = channel(&broker).await;

        chan.declare_queue("work", QueueOptions::request_queue()).await.unwrap();
        chan.set_prefetch(1).await.unwrap();
        chan.publish(message("work", "a")).await.unwrap();

        let mut stream = chan.consume("work", ConsumeOptions::default()).await.unwrap();
        let first = stream.recv().await.unwrap();
        first.nack(true).await.unwrap();

        let again = timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(again.redelivered);
        assert_eq!(again.envelope.payload, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn exclusive_queue_dies_with_its_connection() {
        // ---
        let broker = MemoryBroker::new();
        let (conn, chan) = channel(&broker).await;
        let (_other, other_chan) = channel(&broker).await;

        let name = chan.declare_queue("", QueueOptions::reply_queue()).await.unwrap();
        let locked = other_chan.consume(&name, ConsumeOptions::default()).await;
        assert!(matches!(locked, Err(RpcError::ResourceLocked(_))));

        conn.close().await.unwrap();
        assert!(!chan.is_open());
        assert!(!broker.queue_exists(&name));
    }

    #[tokio::test]
    async fn closing_channel_ends_delivery_stream() {
        // ---
        let broker = MemoryBroker::new();
        let (_conn, chan) = channel(&broker).await;

        chan.declare_queue("work", QueueOptions::request_queue()).await.unwrap();
        let mut stream = chan.consume("work", ConsumeOptions::default()).await.unwrap();
        chan.close().await.unwrap();

        let end = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert!(end.is_none());
        assert!(chan.publish(message("work", "x")).await.is_err());
    }

    #[tokio::test]
    async fn refused_connects_are_retryable() {
        // ---
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);

        let first = broker.connector().connect("memory://").await;
        assert!(matches!(first, Err(RpcError::TransportRetryable(_))));
        assert!(broker.connector().connect("memory://").await.is_ok());
    }
}
