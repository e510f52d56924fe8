//! Bounded cache of recently appended entries.
//!
//! The cache holds the last `capacity` decoded entries, keyed by entry
//! index. Slots form a ring indexed by `index % capacity`, so admitting
//! index `i` implicitly evicts index `i - capacity`. Readers positioned
//! inside the cached window skip disk decoding entirely; the cached
//! serialized size lets them advance their file cursor past the on-disk
//! record without re-parsing it.
//!
//! Single writer, many readers: the writer publishes the highest cached
//! index with a release store after filling the slot; readers acquire-load
//! the cursor and verify the slot's exact index, so they observe either the
//! prior or the new entry, never a torn one.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
};

use gneiss_types::Index;

use crate::Indexed;

/// Ring of the most recently written entries, keyed by entry index.
#[derive(Debug)]
pub struct EntryCache<E> {
    slots: Box<[RwLock<Option<Arc<Indexed<E>>>>]>,
    /// Highest cached index; 0 when nothing has been cached yet.
    last_index: AtomicU64,
}

impl<E> EntryCache<E> {
    /// Creates an empty cache with room for `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        let slots = (0..capacity).map(|_| RwLock::new(None)).collect();
        Self {
            slots,
            last_index: AtomicU64::new(0),
        }
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Inserts an entry, evicting the entry `capacity` indices behind it.
    pub fn put(&self, entry: Arc<Indexed<E>>) {
        let index = entry.index().as_u64();
        let slot = (index % self.slots.len() as u64) as usize;
        *self.slots[slot].write().expect("cache slot lock poisoned") = Some(entry);
        self.last_index.store(index, Ordering::Release);
    }

    /// Returns the cached entry at `index`, or `None` on a miss.
    pub fn get(&self, index: Index) -> Option<Arc<Indexed<E>>> {
        let target = index.as_u64();
        if target == 0 || target > self.last_index.load(Ordering::Acquire) {
            return None;
        }
        let slot = (target % self.slots.len() as u64) as usize;
        let guard = self.slots[slot].read().expect("cache slot lock poisoned");
        guard
            .as_ref()
            .filter(|entry| entry.index().as_u64() == target)
            .cloned()
    }

    /// The highest cached index, or [`Index::ZERO`] if the cache is empty.
    ///
    /// Readers use this to distinguish a miss inside the cached window from
    /// an index definitively past it.
    pub fn last_index(&self) -> Index {
        Index::new(self.last_index.load(Ordering::Acquire))
    }

    /// Drops all cached entries with index above `new_last_index`.
    pub fn truncate(&self, new_last_index: Index) {
        let new_last = new_last_index.as_u64();
        if self.last_index.load(Ordering::Acquire) <= new_last {
            return;
        }
        // Lower the cursor first so readers stop consulting stale slots,
        // then clear them.
        self.last_index.store(new_last, Ordering::Release);
        for slot in &self.slots {
            let mut guard = slot.write().expect("cache slot lock poisoned");
            if guard.as_ref().is_some_and(|e| e.index().as_u64() > new_last) {
                *guard = None;
            }
        }
    }
}
