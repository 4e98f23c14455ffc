//! 64-bit opaque handle allocation shared by the inode tree (nodeids) and the file-handle
//! table (Fh values). Handle 0 is reserved by the protocol and never returned by `register`;
//! handle 1 is reserved for the mount root's nodeid and is pre-seeded by callers that need it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A thread-safe handle→object table. Implementations differ in how they pick handle values
/// and whether they recycle them; all satisfy the same refcounting contract.
pub trait HandleMap<T>: Send + Sync {
    /// Registers `obj`, or bumps the refcount if an identical registration already exists
    /// under `key`. Returns the assigned handle and the object's current generation.
    fn register(&self, key: u64, obj: Arc<T>) -> (u64, u64);

    /// Looks up a previously registered handle.
    fn decode(&self, handle: u64) -> Option<Arc<T>>;

    /// Decrements the refcount by `n`. Returns `Some(obj)` with the now-unregistered object
    /// if the count reached zero, `None` if the handle is still referenced.
    ///
    /// # Panics
    /// Panics on an underflow (forgetting more than was ever looked up) — that is a caller
    /// bug, not a recoverable runtime condition.
    fn forget(&self, handle: u64, n: u64) -> Option<Arc<T>>;

    /// The handle currently assigned to `key`, or 0 if not registered.
    fn handle_for(&self, key: u64) -> u64;

    fn count(&self) -> usize;

    fn has(&self, handle: u64) -> bool {
        self.decode(handle).is_some()
    }
}

struct Slot<T> {
    obj: Option<Arc<T>>,
    generation: u64,
    lookups: u64,
}

/// Grow-only slice of slots plus a free-id stack. On reuse the slot's generation is bumped,
/// so a stale (handle, generation) pair from before a free/reuse cycle is distinguishable.
pub struct RecyclingHandleMap<T> {
    slots: Mutex<RecyclingInner<T>>,
    by_key: Mutex<HashMap<u64, u64>>,
}

struct RecyclingInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u64>,
}

impl<T> Default for RecyclingHandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecyclingHandleMap<T> {
    pub fn new() -> Self {
        Self {
            // index 0 and index 1 are never assigned: both are permanent dummy slots so the
            // first real registration lands at slots[2], keeping handle 1 free for a caller
            // that needs it pinned (e.g. the mount root's nodeid).
            slots: Mutex::new(RecyclingInner {
                slots: vec![
                    Slot {
                        obj: None,
                        generation: 0,
                        lookups: 0,
                    },
                    Slot {
                        obj: None,
                        generation: 0,
                        lookups: 0,
                    },
                ],
                free: Vec::new(),
            }),
            by_key: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> HandleMap<T> for RecyclingHandleMap<T> {
    fn register(&self, key: u64, obj: Arc<T>) -> (u64, u64) {
        let mut by_key = self.by_key.lock();
        if let Some(&handle) = by_key.get(&key) {
            let mut inner = self.slots.lock();
            let idx = handle as usize;
            let slot = &mut inner.slots[idx];
            slot.lookups += 1;
            return (handle, slot.generation);
        }
        let mut inner = self.slots.lock();
        let handle = if let Some(h) = inner.free.pop() {
            let idx = h as usize;
            inner.slots[idx].generation += 1;
            inner.slots[idx].obj = Some(obj);
            inner.slots[idx].lookups = 1;
            h
        } else {
            let idx = inner.slots.len() as u64;
            inner.slots.push(Slot {
                obj: Some(obj),
                generation: 0,
                lookups: 1,
            });
            idx
        };
        let generation = inner.slots[handle as usize].generation;
        by_key.insert(key, handle);
        (handle, generation)
    }

    fn decode(&self, handle: u64) -> Option<Arc<T>> {
        let inner = self.slots.lock();
        inner.slots.get(handle as usize).and_then(|s| s.obj.clone())
    }

    fn forget(&self, handle: u64, n: u64) -> Option<Arc<T>> {
        let mut inner = self.slots.lock();
        let idx = handle as usize;
        let slot = &mut inner.slots[idx];
        assert!(
            slot.lookups >= n,
            "forget underflow: handle {handle} has {} lookups, asked to drop {n}",
            slot.lookups
        );
        slot.lookups -= n;
        if slot.lookups == 0 {
            let obj = slot.obj.take();
            inner.free.push(handle);
            drop(inner);
            self.by_key.lock().retain(|_, &mut h| h != handle);
            obj
        } else {
            None
        }
    }

    fn handle_for(&self, key: u64) -> u64 {
        self.by_key.lock().get(&key).copied().unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.by_key.lock().len()
    }
}

/// Never recycles a handle once assigned; used on hosts where the kernel (or an intervening
/// NFS re-export) copes poorly with id reuse. Memory grows monotonically with distinct keys
/// ever seen.
pub struct MonotonicHandleMap<T> {
    next: AtomicU64,
    objs: Mutex<HashMap<u64, (Arc<T>, u64)>>,
    by_key: Mutex<HashMap<u64, u64>>,
}

impl<T> Default for MonotonicHandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MonotonicHandleMap<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(2), // 0 reserved by protocol, 1 reserved for the mount root
            objs: Mutex::new(HashMap::new()),
            by_key: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> HandleMap<T> for MonotonicHandleMap<T> {
    fn register(&self, key: u64, obj: Arc<T>) -> (u64, u64) {
        let mut by_key = self.by_key.lock();
        if let Some(&handle) = by_key.get(&key) {
            let mut objs = self.objs.lock();
            let entry = objs.get_mut(&handle).expect("handle registered in by_key must exist");
            entry.1 += 1;
            return (handle, 0);
        }
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.objs.lock().insert(handle, (obj, 1));
        by_key.insert(key, handle);
        (handle, 0)
    }

    fn decode(&self, handle: u64) -> Option<Arc<T>> {
        self.objs.lock().get(&handle).map(|(o, _)| o.clone())
    }

    fn forget(&self, handle: u64, n: u64) -> Option<Arc<T>> {
        let mut objs = self.objs.lock();
        let done = {
            let entry = objs
                .get_mut(&handle)
                .unwrap_or_else(|| panic!("forget of unregistered handle {handle}"));
            assert!(
                entry.1 >= n,
                "forget underflow: handle {handle} has {} lookups, asked to drop {n}",
                entry.1
            );
            entry.1 -= n;
            entry.1 == 0
        };
        if done {
            let (obj, _) = objs.remove(&handle).expect("just checked present");
            drop(objs);
            self.by_key.lock().retain(|_, &mut h| h != handle);
            Some(obj)
        } else {
            None
        }
    }

    fn handle_for(&self, key: u64) -> u64 {
        self.by_key.lock().get(&key).copied().unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.by_key.lock().len()
    }
}

/// Derives the handle from the object's heap address (`ptr >> 3`, pointers are at least
/// 8-byte aligned) combined with a rolling sanity nonce in the high bits, so a handle from a
/// previous process incarnation (or a corrupted kernel message) is detected rather than
/// silently dereferenced. An auxiliary map keeps the `Arc` alive for as long as the handle is
/// registered.
pub struct AddressHandleMap<T> {
    nonce: AtomicU64,
    pins: Mutex<HashMap<u64, (Arc<T>, u64, u64)>>, // handle -> (obj, generation, lookups)
    by_key: Mutex<HashMap<u64, u64>>,
}

const NONCE_SHIFT: u32 = 45;
const NONCE_MASK: u64 = (1 << (64 - NONCE_SHIFT)) - 1;

impl<T> Default for AddressHandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AddressHandleMap<T> {
    pub fn new() -> Self {
        Self {
            nonce: AtomicU64::new(1),
            pins: Mutex::new(HashMap::new()),
            by_key: Mutex::new(HashMap::new()),
        }
    }

    fn encode(ptr: usize, nonce: u64) -> u64 {
        assert_eq!(ptr % 8, 0, "AddressHandleMap requires 8-byte aligned objects");
        ((nonce & NONCE_MASK) << NONCE_SHIFT) | ((ptr as u64 >> 3) & ((1 << NONCE_SHIFT) - 1))
    }
}

impl<T> HandleMap<T> for AddressHandleMap<T> {
    fn register(&self, key: u64, obj: Arc<T>) -> (u64, u64) {
        let mut by_key = self.by_key.lock();
        if let Some(&handle) = by_key.get(&key) {
            let mut pins = self.pins.lock();
            let entry = pins.get_mut(&handle).expect("handle registered in by_key must exist");
            entry.2 += 1;
            return (handle, entry.1);
        }
        let ptr = Arc::as_ptr(&obj) as usize;
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let handle = Self::encode(ptr, nonce);
        self.pins.lock().insert(handle, (obj, nonce, 1));
        by_key.insert(key, handle);
        (handle, nonce)
    }

    fn decode(&self, handle: u64) -> Option<Arc<T>> {
        self.pins.lock().get(&handle).map(|(o, _, _)| o.clone())
    }

    fn forget(&self, handle: u64, n: u64) -> Option<Arc<T>> {
        let mut pins = self.pins.lock();
        let done = {
            let entry = pins
                .get_mut(&handle)
                .unwrap_or_else(|| panic!("forget of unregistered handle {handle}"));
            assert!(
                entry.2 >= n,
                "forget underflow: handle {handle} has {} lookups, asked to drop {n}",
                entry.2
            );
            entry.2 -= n;
            entry.2 == 0
        };
        if done {
            let (obj, _, _) = pins.remove(&handle).expect("just checked present");
            drop(pins);
            self.by_key.lock().retain(|_, &mut h| h != handle);
            Some(obj)
        } else {
            None
        }
    }

    fn handle_for(&self, key: u64) -> u64 {
        self.by_key.lock().get(&key).copied().unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.by_key.lock().len()
    }
}

/// Selects which [`HandleMap`] implementation backs a server's nodeid space (and, reused, its
/// file-handle space). A startup-time choice per §4.3 of the design notes — all three satisfy
/// the same refcounting contract, they differ only in how a handle value is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleMapKind {
    /// Grow-only slot table plus a free-id stack; bumps `generation` on reuse. The default —
    /// portable to any host and exercises the generation invariant kernels rely on.
    #[default]
    Recycling,
    /// Monotonic counter, never reused; for hosts (or intervening re-exports) that cope poorly
    /// with id reuse.
    Monotonic,
    /// Derives the handle from the registered object's heap address plus a rolling sanity
    /// nonce, at the cost of pinning every live object in an auxiliary map.
    Address,
}

impl HandleMapKind {
    /// Builds the selected implementation, boxed behind the shared [`HandleMap`] trait.
    pub fn build<T: Send + Sync + 'static>(self) -> Box<dyn HandleMap<T>> {
        match self {
            HandleMapKind::Recycling => Box::new(RecyclingHandleMap::new()),
            HandleMapKind::Monotonic => Box::new(MonotonicHandleMap::new()),
            HandleMapKind::Address => Box::new(AddressHandleMap::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exercise<M: HandleMap<u32> + Default>() {
        let map = M::default();
        let (h1, g1) = map.register(1, Arc::new(10));
        assert_ne!(h1, 0);
        let (h1_again, g1_again) = map.register(1, Arc::new(10));
        assert_eq!(h1, h1_again);
        assert_eq!(g1, g1_again);
        assert_eq!(*map.decode(h1).unwrap(), 10);

        let (h2, _) = map.register(2, Arc::new(20));
        assert_ne!(h1, h2);

        assert!(map.forget(h1, 1).is_none(), "one lookup remains");
        let dropped = map.forget(h1, 1).expect("last lookup should unregister");
        assert_eq!(*dropped, 10);
        assert!(map.decode(h1).is_none());
        assert_eq!(map.handle_for(1), 0);
    }

    #[test]
    fn recycling_contract() {
        exercise::<RecyclingHandleMap<u32>>();
    }

    #[test]
    fn monotonic_contract() {
        exercise::<MonotonicHandleMap<u32>>();
    }

    #[test]
    fn address_based_contract() {
        exercise::<AddressHandleMap<u32>>();
    }

    #[test]
    fn recycling_bumps_generation_on_reuse() {
        let map = RecyclingHandleMap::<u32>::new();
        let (h1, g1) = map.register(1, Arc::new(1));
        map.forget(h1, 1);
        let (h2, g2) = map.register(2, Arc::new(2));
        assert_eq!(h1, h2, "freed slot should be reused");
        assert!(g2 > g1, "generation must strictly increase on reuse");
    }

    #[test]
    #[should_panic(expected = "forget underflow")]
    fn forget_underflow_panics() {
        let map = RecyclingHandleMap::<u32>::new();
        let (h, _) = map.register(1, Arc::new(1));
        map.forget(h, 2);
    }

    #[test]
    fn recycling_reserves_handles_zero_and_one() {
        let map = RecyclingHandleMap::<u32>::new();
        let (h, _) = map.register(1, Arc::new(1));
        assert!(h > 1, "handles 0 and 1 must stay reserved, got {h}");
    }

    #[test]
    fn kind_build_selects_implementation() {
        for kind in [HandleMapKind::Recycling, HandleMapKind::Monotonic, HandleMapKind::Address] {
            let map: Box<dyn HandleMap<u32>> = kind.build();
            let (h, _) = map.register(1, Arc::new(7));
            assert!(h > 1);
            assert_eq!(*map.decode(h).unwrap(), 7);
        }
    }
}
