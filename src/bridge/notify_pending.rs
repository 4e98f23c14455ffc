//! Correlates a `RetrieveCache` notification sent to the kernel with the matching
//! `NOTIFY_REPLY` request that eventually comes back in, per §4.8.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use parking_lot::Mutex;

/// The bytes of a completed `RetrieveCache` round trip.
pub type RetrievedBytes = Vec<u8>;

/// Waiter side of a pending retrieve, handed back to the caller of
/// [`PendingRetrieves::begin`].
pub struct RetrieveWaiter {
    rx: mpsc::Receiver<RetrievedBytes>,
}

impl RetrieveWaiter {
    /// Blocks until the kernel's `NOTIFY_REPLY` completes this retrieval, or returns `None`
    /// if the pending entry was dropped (e.g. on unmount) without ever completing.
    pub fn wait(self) -> Option<RetrievedBytes> {
        self.rx.recv().ok()
    }
}

/// Tracks outstanding `RetrieveCache` notifications by a server-allocated notify-unique.
#[derive(Default)]
pub struct PendingRetrieves {
    next_unique: AtomicU64,
    waiting: Mutex<HashMap<u64, mpsc::Sender<RetrievedBytes>>>,
}

impl PendingRetrieves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh notify-unique and registers a waiter for it. The caller sends the
    /// `RetrieveCache` notification carrying this unique, then blocks on the returned
    /// [`RetrieveWaiter`] (typically from a different thread than the one that will deliver
    /// the reply).
    pub fn begin(&self) -> (u64, RetrieveWaiter) {
        let unique = self.next_unique.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel();
        self.waiting.lock().insert(unique, tx);
        (unique, RetrieveWaiter { rx })
    }

    /// Completes the pending retrieve for `notify_unique` with `data`, called from the
    /// dispatcher's `NotifyReply` handler. Silently drops unmatched or duplicate replies: the
    /// kernel may send a stale `NOTIFY_REPLY` after a retrieval already timed out.
    pub fn complete(&self, notify_unique: u64, data: RetrievedBytes) {
        if let Some(tx) = self.waiting.lock().remove(&notify_unique) {
            let _ = tx.send(data);
        }
    }

    /// Drops every outstanding waiter, waking them with `None`. Called on unmount so that no
    /// thread blocks forever on a retrieval that can never complete.
    pub fn abort_all(&self) {
        self.waiting.lock().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn complete_wakes_the_waiter() {
        let pending = PendingRetrieves::new();
        let (unique, waiter) = pending.begin();
        let handle = thread::spawn(move || waiter.wait());
        pending.complete(unique, vec![1, 2, 3]);
        assert_eq!(handle.join().unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn abort_all_wakes_waiters_with_none() {
        let pending = PendingRetrieves::new();
        let (_, waiter) = pending.begin();
        pending.abort_all();
        assert_eq!(waiter.wait(), None);
    }

    #[test]
    fn unmatched_complete_is_harmless() {
        let pending = PendingRetrieves::new();
        pending.complete(999, vec![]);
    }
}
