//! Bounded in-process cache tier.

use super::entry::CacheEntry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    tick: u64,
}

/// Outcome of a memory-tier read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemoryRead {
    Hit(Vec<u8>),
    Expired,
    Absent,
}

/// Memory tier keyed by cache key.
///
/// Recency is an access tick rather than a timestamp so that entries touched
/// within the same millisecond still order deterministically.
#[derive(Debug, Default)]
pub(crate) struct MemoryTier {
    slots: DashMap<String, Slot>,
    bytes: AtomicU64,
    clock: AtomicU64,
}

impl MemoryTier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Reads a value, refreshing its recency. Expired entries are removed.
    pub(crate) fn get(&self, key: &str, now_ms: u64) -> MemoryRead {
        let expired = match self.slots.get_mut(key) {
            None => return MemoryRead::Absent,
            Some(mut slot) => {
                if slot.entry.is_expired(now_ms) {
                    true
                } else {
                    slot.tick = self.next_tick();
                    slot.entry.last_accessed_ms = now_ms;
                    return MemoryRead::Hit(slot.entry.value.clone());
                }
            }
        };
        if expired {
            self.remove(key);
        }
        MemoryRead::Expired
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Inserts an entry, returning the one it replaced.
    pub(crate) fn insert(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let size = entry.size_bytes;
        let tick = self.next_tick();
        let replaced = self.slots.insert(entry.key.clone(), Slot { entry, tick });
        self.bytes.fetch_add(size, Ordering::Relaxed);
        replaced.map(|old| {
            self.bytes.fetch_sub(old.entry.size_bytes, Ordering::Relaxed);
            old.entry
        })
    }

    pub(crate) fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.slots.remove(key).map(|(_, slot)| {
            self.bytes.fetch_sub(slot.entry.size_bytes, Ordering::Relaxed);
            slot.entry
        })
    }

    /// Picks the least recently used key not in `pinned`, ties broken by the
    /// earliest creation time.
    pub(crate) fn lru_candidate(&self, pinned: &HashSet<String>) -> Option<String> {
        self.slots
            .iter()
            .filter(|slot| !pinned.contains(slot.key()))
            .min_by_key(|slot| (slot.tick, slot.entry.created_at_ms))
            .map(|slot| slot.key().clone())
    }

    /// Removes entries matching `predicate`, returning how many went.
    pub(crate) fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            if predicate(&slot.entry) {
                self.bytes.fetch_sub(slot.entry.size_bytes, Ordering::Relaxed);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub(crate) fn clear(&self) {
        self.slots.clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
