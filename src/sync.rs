use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Every mutex guarded this way protects bookkeeping that is updated in
/// single statements (free lists, id sets, queue maps), so a panic in another
/// holder cannot leave it half-written.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
