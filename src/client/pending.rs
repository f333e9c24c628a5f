use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::{CorrelationId, Result, RpcError};

pub(crate) type ReplySender = oneshot::Sender<Result<Bytes>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Bytes>>;

/// Requests waiting for their reply, keyed by correlation id.
///
/// Touched concurrently by the sending path, the reply loop and the
/// timeout/cancellation path. Every resolution goes through an atomic
/// remove, so exactly one of them ever owns an entry's sender.
#[derive(Default)]
pub(crate) struct PendingRequests {
    // ---
    requests: DashMap<CorrelationId, ReplySender>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Fails if `id` is already pending.
    pub fn register(&self, id: CorrelationId) -> Result<ReplyReceiver> {
        // ---
        match self.requests.entry(id) {
            Entry::Occupied(e) => Err(RpcError::DuplicateCorrelationId(e.key().to_string())),
            Entry::Vacant(e) => {
                let (tx, rx) = oneshot::channel();
                e.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Resolve the request registered under `id`, if it is still pending.
    ///
    /// Returns false for unknown ids (late or foreign replies).
    pub fn complete(&self, id: &CorrelationId, reply: Result<Bytes>) -> bool {
        // ---
        match self.requests.remove(id) {
            Some((_, tx)) => {
                // receiver gone means the caller already gave up
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.requests.remove(id).is_some()
    }

    /// Resolve every pending request with the error built by `err`.
    pub fn fail_all(&self, err: impl Fn() -> RpcError) -> usize {
        // ---
        let ids: Vec<CorrelationId> = self.requests.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.complete(id, Err(err())))
            .count()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Removes a pending entry when the send that registered it finishes, on
/// every path including timeout and cancellation (future dropped).
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests, id: CorrelationId) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}
