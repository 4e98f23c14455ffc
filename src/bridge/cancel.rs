//! Per-request cancellation, wired to the kernel's `INTERRUPT` opcode.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::RequestId;

/// A liveness flag shared between the dispatcher and a running handler. Cloning is cheap;
/// all clones observe the same underlying flag.
#[derive(Debug, Clone)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// True once the kernel has sent `INTERRUPT` for this request.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn fire(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Maps an in-flight request's unique id to its cancel flag so that a later `INTERRUPT` for
/// the same id can fire it. Entries are removed once the matching reply has been sent;
/// `INTERRUPT`'s own reply is sent unconditionally whether or not the target was found, per
/// the protocol.
#[derive(Debug, Default)]
pub struct CancelTable {
    inner: Mutex<HashMap<u64, Cancel>>,
}

impl CancelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh cancel flag for `unique`. Call once per dispatched request, before
    /// invoking the handler.
    pub fn begin(&self, unique: RequestId) -> Cancel {
        let c = Cancel::new();
        self.inner.lock().insert(unique.0, c.clone());
        c
    }

    /// Call once the handler for `unique` has produced its reply.
    pub fn end(&self, unique: RequestId) {
        self.inner.lock().remove(&unique.0);
    }

    /// Fires the cancel flag for `unique`, if a handler is still in flight for it. Does
    /// nothing (not an error) if the request already completed or never existed — INTERRUPT
    /// races the normal completion path by design.
    pub fn interrupt(&self, unique: RequestId) {
        if let Some(c) = self.inner.lock().get(&unique.0) {
            c.fire();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interrupt_fires_known_request() {
        let table = CancelTable::new();
        let cancel = table.begin(RequestId(7));
        assert!(!cancel.is_cancelled());
        table.interrupt(RequestId(7));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn interrupt_on_unknown_request_is_noop() {
        let table = CancelTable::new();
        table.interrupt(RequestId(42));
    }

    #[test]
    fn end_removes_entry() {
        let table = CancelTable::new();
        let cancel = table.begin(RequestId(1));
        table.end(RequestId(1));
        table.interrupt(RequestId(1));
        assert!(!cancel.is_cancelled());
    }
}
