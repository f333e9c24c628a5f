use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::sync::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_warn,
    ChannelPtr,
    ConnectionPtr,
    Result,
};

#[derive(Default)]
struct PoolState {
    free: Vec<ChannelPtr>,
    // keyed by channel identity; broker channel numbers get recycled
    checked_out: HashSet<usize>,
}

fn key(channel: &ChannelPtr) -> usize {
    Arc::as_ptr(channel).cast::<()>() as usize
}

/// Bounded set of channels over one connection.
///
/// A channel is either free (held here) or checked out to exactly one
/// borrower. The capacity semaphore always holds `max - checked_out`
/// permits; acquisition takes one, release gives it back.
///
/// Most callers go through [`ConnectionPool`](crate::ConnectionPool), whose
/// [`ChannelLease`](crate::ChannelLease) returns channels here on drop.
pub struct ChannelPool {
    // ---
    connection: ConnectionPtr,
    max: usize,
    state: Mutex<PoolState>,
    capacity: Arc<Semaphore>,
}

impl ChannelPool {
    /// Open a pool on `connection`, eagerly creating `starting` channels.
    pub async fn open(connection: ConnectionPtr, starting: usize, max: usize) -> Result<Self> {
        // ---
        let mut free = Vec::with_capacity(starting.min(max));
        for _ in 0..starting.min(max) {
            free.push(connection.create_channel().await?);
        }
        log_debug!(
            "connection {}: channel pool opened with {} of {max} channels",
            connection.id(),
            free.len()
        );

        Ok(Self {
            connection,
            max,
            state: Mutex::new(PoolState {
                free,
                checked_out: HashSet::new(),
            }),
            capacity: Arc::new(Semaphore::new(max)),
        })
    }

    pub fn connection(&self) -> &ConnectionPtr {
        &self.connection
    }

    pub fn max_channels(&self) -> usize {
        self.max
    }

    pub fn checked_out(&self) -> usize {
        lock_ignore_poison(&self.state).checked_out.len()
    }

    pub fn free(&self) -> usize {
        lock_ignore_poison(&self.state).free.len()
    }

    /// Check out a channel without waiting.
    ///
    /// Hands out a free channel if there is one, otherwise creates one while
    /// below the maximum. Returns `Ok(None)` when the pool is saturated.
    ///
    /// # Errors
    ///
    /// Channel creation failures propagate; the capacity unit taken for the
    /// attempt is given back.
    pub async fn try_acquire(&self) -> Result<Option<ChannelPtr>> {
        // ---
        let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned() else {
            return Ok(None);
        };

        let reused = {
            let mut state = lock_ignore_poison(&self.state);
            let mut found = None;
            while let Some(channel) = state.free.pop() {
                if channel.is_open() {
                    state.checked_out.insert(key(&channel));
                    found = Some(channel);
                    break;
                }
                log_debug!("discarding closed channel {}", channel.id());
            }
            found
        };

        let channel = match reused {
            Some(channel) => channel,
            None => {
                // permit drops on error, restoring capacity
                let channel = self.connection.create_channel().await?;
                lock_ignore_poison(&self.state)
                    .checked_out
                    .insert(key(&channel));
                log_debug!(
                    "connection {}: created channel {}",
                    self.connection.id(),
                    channel.id()
                );
                channel
            }
        };

        permit.forget();
        Ok(Some(channel))
    }

    /// Give a checked-out channel back.
    ///
    /// Open channels return to the free set; closed ones are dropped. Either
    /// way one capacity unit is restored. Releasing a channel that is not
    /// checked out (for example a second time) changes nothing.
    pub fn release(&self, channel: ChannelPtr) {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if !state.checked_out.remove(&key(&channel)) {
                log_warn!(
                    "connection {}: ignoring release of channel {} which is not checked out",
                    self.connection.id(),
                    channel.id()
                );
                return;
            }
            if channel.is_open() {
                state.free.push(channel);
            } else {
                log_debug!("discarding closed channel {} on release", channel.id());
            }
        }
        self.capacity.add_permits(1);
    }

    /// Take a checked-out channel out of service instead of returning it.
    ///
    /// The channel never goes back to the free set; it is closed in the
    /// background and its capacity unit restored. Used when a borrower can
    /// no longer close the channel itself, as in a `Drop` impl.
    pub fn discard(&self, channel: ChannelPtr) {
        // ---
        if !lock_ignore_poison(&self.state).checked_out.remove(&key(&channel)) {
            log_warn!(
                "connection {}: ignoring discard of channel {} which is not checked out",
                self.connection.id(),
                channel.id()
            );
            return;
        }
        self.capacity.add_permits(1);

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = channel.close().await {
                        log_debug!("closing discarded channel {} failed: {e}", channel.id());
                    }
                });
            }
            Err(_) => log_warn!(
                "no runtime to close discarded channel {}; dropping it open",
                channel.id()
            ),
        }
    }

    /// Close every free channel. Checked-out channels are left to their
    /// borrowers.
    pub async fn close(&self) {
        // ---
        let free = std::mem::take(&mut lock_ignore_poison(&self.state).free);
        for channel in free {
            if let Err(e) = channel.close().await {
                log_debug!("closing channel {} failed: {e}", channel.id());
            }
        }
    }
}
