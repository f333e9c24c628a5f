use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::retry::retry_with_backoff;
use crate::sync::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BrokerChannel,
    ChannelPool,
    ChannelPtr,
    ConnectionPtr,
    ConnectorPtr,
    PoolConfig,
    Result,
    RpcError,
};

/// Point-in-time counts for a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: usize,
    pub checked_out: usize,
    pub free: usize,
}

struct Inner {
    // ---
    connector: ConnectorPtr,
    config: PoolConfig,
    pools: Mutex<Vec<Arc<ChannelPool>>>,
    creating: tokio::sync::Mutex<()>,
    capacity: Arc<Semaphore>,
    closed: CancellationToken,
}

/// Bounded set of broker connections, each owning one [`ChannelPool`].
///
/// `get_channel` tries every live connection's pool once, opens a new
/// connection when all are saturated and the maximum allows, and otherwise
/// waits on a counting semaphore sized `max_connections *
/// max_channels_per_connection` until some lease is dropped.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    /// Validate `config` and open its starting connections.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidConfig`] for bad bounds, before any connection is
    /// attempted; connector errors once retries are exhausted.
    pub async fn open(config: PoolConfig, connector: ConnectorPtr) -> Result<Self> {
        // ---
        config.validate()?;

        let pool = Self {
            inner: Arc::new(Inner {
                connector,
                capacity: Arc::new(Semaphore::new(config.capacity())),
                config,
                pools: Mutex::new(Vec::new()),
                creating: tokio::sync::Mutex::new(()),
                closed: CancellationToken::new(),
            }),
        };

        for _ in 0..pool.inner.config.starting_connections {
            let channels = pool.open_connection().await?;
            lock_ignore_poison(&pool.inner.pools).push(channels);
        }

        log_info!(
            "connection pool opened: {} of {} connections",
            pool.inner.config.starting_connections,
            pool.inner.config.max_connections
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a channel, waiting for capacity if the pool is saturated.
    ///
    /// The wait itself is unbounded; use [`get_channel_timeout`] or
    /// [`get_channel_cancellable`] to bound it.
    ///
    /// [`get_channel_timeout`]: Self::get_channel_timeout
    /// [`get_channel_cancellable`]: Self::get_channel_cancellable
    pub async fn get_channel(&self) -> Result<ChannelLease> {
        // ---
        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.capacity).acquire_owned() => {
                permit.map_err(|_| RpcError::PoolClosed)?
            }
            _ = self.inner.closed.cancelled() => return Err(RpcError::PoolClosed),
        };

        loop {
            if self.inner.closed.is_cancelled() {
                return Err(RpcError::PoolClosed);
            }

            if let Some((pool, channel)) = self.acquire_existing().await? {
                return Ok(ChannelLease {
                    pool,
                    channel,
                    discard: false,
                    _permit: permit,
                });
            }

            if self.grow().await? {
                continue;
            }

            // Another holder is between taking a pool slot and its permit.
            tokio::task::yield_now().await;
        }
    }

    /// [`get_channel`](Self::get_channel) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] when no channel frees up in time.
    pub async fn get_channel_timeout(&self, timeout: Duration) -> Result<ChannelLease> {
        // ---
        tokio::time::timeout(timeout, self.get_channel())
            .await
            .map_err(|_| RpcError::Timeout)?
    }

    /// [`get_channel`](Self::get_channel) abandoned when `token` fires.
    ///
    /// # Errors
    ///
    /// [`RpcError::Cancelled`] when the token is cancelled first.
    pub async fn get_channel_cancellable(&self, token: &CancellationToken) -> Result<ChannelLease> {
        // ---
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RpcError::Cancelled),
            lease = self.get_channel() => lease,
        }
    }

    /// Return a leased channel to its connection's pool.
    ///
    /// Equivalent to dropping the lease.
    pub fn return_channel(&self, lease: ChannelLease) {
        log_debug!("returning channel {}", lease.channel.id());
        drop(lease);
    }

    pub fn stats(&self) -> PoolStats {
        // ---
        let pools = lock_ignore_poison(&self.inner.pools);
        PoolStats {
            connections: pools.len(),
            checked_out: pools.iter().map(|p| p.checked_out()).sum(),
            free: pools.iter().map(|p| p.free()).sum(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Close free channels and every connection.
    ///
    /// Later acquisitions, including ones already waiting, fail with
    /// [`RpcError::PoolClosed`]. Outstanding leases stay valid until their
    /// connection notices the close.
    pub async fn close(&self) {
        // ---
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        self.inner.capacity.close();

        let pools = std::mem::take(&mut *lock_ignore_poison(&self.inner.pools));
        for pool in pools {
            pool.close().await;
            if let Err(e) = pool.connection().close().await {
                log_warn!("closing connection {} failed: {e}", pool.connection().id());
            }
        }
        log_info!("connection pool closed");
    }

    async fn acquire_existing(&self) -> Result<Option<(Arc<ChannelPool>, ChannelPtr)>> {
        // ---
        let pools = lock_ignore_poison(&self.inner.pools).clone();

        for pool in pools {
            if !pool.connection().is_open() {
                self.evict(&pool);
                continue;
            }
            match pool.try_acquire().await {
                Ok(Some(channel)) => return Ok(Some((pool, channel))),
                Ok(None) => continue,
                Err(_) if !pool.connection().is_open() => self.evict(&pool),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Open one more connection if below the maximum. Returns whether the
    /// set of connections changed.
    async fn grow(&self) -> Result<bool> {
        // ---
        let _creating = self.inner.creating.lock().await;

        let live = lock_ignore_poison(&self.inner.pools).len();
        if live >= self.inner.config.max_connections {
            return Ok(false);
        }

        let pool = self.open_connection().await?;
        if self.inner.closed.is_cancelled() {
            if let Err(e) = pool.connection().close().await {
                log_warn!("closing connection {} failed: {e}", pool.connection().id());
            }
            return Err(RpcError::PoolClosed);
        }
        lock_ignore_poison(&self.inner.pools).push(pool);
        Ok(true)
    }

    async fn open_connection(&self) -> Result<Arc<ChannelPool>> {
        // ---
        let inner = &*self.inner;
        let connection = retry_with_backoff(inner.config.connect_retry.as_ref(), "connect", move || {
            inner.connector.connect(&inner.config.uri)
        })
        .await?;

        log_debug!("opened connection {}", connection.id());

        let pool = match ChannelPool::open(
            Arc::clone(&connection),
            inner.config.starting_channels,
            inner.config.max_channels_per_connection,
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                log_warn!("connection {}: opening channels failed: {e}", connection.id());
                if let Err(close) = connection.close().await {
                    log_warn!("closing connection {} failed: {close}", connection.id());
                }
                return Err(e);
            }
        };
        Ok(Arc::new(pool))
    }

    fn evict(&self, dead: &Arc<ChannelPool>) {
        // ---
        let mut pools = lock_ignore_poison(&self.inner.pools);
        let before = pools.len();
        pools.retain(|p| !Arc::ptr_eq(p, dead));
        if pools.len() < before {
            log_warn!("evicted dead connection {}", dead.connection().id());
        }
    }
}

/// A channel checked out of a [`ConnectionPool`].
///
/// Dereferences to the channel. Dropping the lease returns the channel to
/// the pool it came from (or discards it if it was closed meanwhile) and then
/// frees its pool-wide capacity unit.
pub struct ChannelLease {
    // ---
    pool: Arc<ChannelPool>,
    channel: ChannelPtr,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl ChannelLease {
    pub fn channel(&self) -> &ChannelPtr {
        &self.channel
    }

    pub fn connection(&self) -> &ConnectionPtr {
        self.pool.connection()
    }

    /// Give up the lease without handing the channel to anyone else.
    ///
    /// For channels left with broker-side state (a consumer, an exclusive
    /// queue) that cannot be closed in place: the channel is closed in the
    /// background and a fresh one takes its slot.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.discard {
            self.pool.discard(Arc::clone(&self.channel));
        } else {
            self.pool.release(Arc::clone(&self.channel));
        }
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("connection", &self.pool.connection().id())
            .field("channel", &self.channel.id())
            .finish()
    }
}
