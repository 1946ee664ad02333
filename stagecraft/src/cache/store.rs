//! The two-tier result cache.

use super::disk::{DiskTier, InMemoryDiskTier};
use super::entry::{now_ms, CacheEntry, CacheStats, CacheTier};
use super::memory::{MemoryRead, MemoryTier};
use super::single_flight::{self, Admission, CacheClaim, CacheLookup, InFlight, WaitOutcome};
use crate::config::CacheConfig;
use crate::context::StageInputs;
use crate::errors::CacheError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct Inner {
    max_entries: usize,
    max_bytes: u64,
    default_ttl: Duration,
    memory: MemoryTier,
    disk: Arc<dyn DiskTier>,
    in_flight: InFlight,
    admission: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

/// A shared, two-tier result cache.
///
/// Cloning is cheap; clones share the same tiers and counters. Internal
/// storage failures are logged and degrade to misses, never surfaced.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Creates a store over the given disk tier.
    #[must_use]
    pub fn new(config: &CacheConfig, disk: Arc<dyn DiskTier>) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_entries: config.max_memory_entries,
                max_bytes: config.max_memory_size_bytes,
                default_ttl: Duration::from_millis(config.default_ttl_ms),
                memory: MemoryTier::new(),
                disk,
                in_flight: InFlight::new(),
                admission: Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expired_removed: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a store whose disk tier lives in process memory.
    #[must_use]
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(config, Arc::new(InMemoryDiskTier::new()))
    }

    /// Creates a store from configuration, opening SQLite at `disk_path`
    /// (or an in-memory database when no path is set).
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` if the database cannot be opened.
    #[cfg(feature = "sqlite")]
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let disk = match &config.disk_path {
            Some(path) => super::disk::SqliteDiskTier::open(path)?,
            None => super::disk::SqliteDiskTier::open_in_memory()?,
        };
        Ok(Self::new(config, Arc::new(disk)))
    }

    /// Creates a store from configuration.
    ///
    /// # Errors
    ///
    /// Never fails without the `sqlite` feature.
    #[cfg(not(feature = "sqlite"))]
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self::in_memory(config))
    }

    pub(crate) fn in_flight(&self) -> &InFlight {
        &self.inner.in_flight
    }

    /// The TTL applied when a caller passes zero.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Looks up a key, claiming it on a miss.
    ///
    /// If another caller already holds the claim this waits for it to be
    /// fulfilled and returns the value as a hit.
    pub async fn get(&self, key: &str) -> CacheLookup {
        loop {
            if let Some(value) = self.lookup(key) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Hit(value);
            }
            match self.inner.in_flight.admit(key) {
                Admission::Claimed => {
                    // A claimant may have published between the lookup and the claim.
                    if let Some(value) = self.lookup(key) {
                        self.inner.in_flight.complete(key, value.clone());
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        return CacheLookup::Hit(value);
                    }
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    return CacheLookup::Miss(CacheClaim::new(key.to_string(), self.clone()));
                }
                Admission::Wait(rx) => match single_flight::wait(rx).await {
                    WaitOutcome::Fulfilled(value) => {
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        return CacheLookup::Hit(value);
                    }
                    WaitOutcome::Abandoned => {
                        debug!(key, "Cache claim abandoned, retrying");
                    }
                },
            }
        }
    }

    /// Looks up a key without claiming it.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        let value = self.lookup(key);
        let counter = if value.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Stores a value. A zero `ttl` uses the default TTL.
    pub fn set<I, S>(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert_entry(key, value, ttl, tags.into_iter().map(Into::into).collect());
    }

    pub(crate) fn insert_entry(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: BTreeSet<String>) {
        let ttl = if ttl.is_zero() { self.inner.default_ttl } else { ttl };
        if let Err(e) = self.inner.disk.remove(key) {
            warn!(key, error = %e, "Failed to drop stale disk copy");
        }
        self.admit(CacheEntry::new(key, value, ttl, tags, now_ms()));
    }

    /// Removes a key from both tiers.
    pub fn delete(&self, key: &str) -> bool {
        let in_memory = self.inner.memory.remove(key).is_some();
        let on_disk = self.inner.disk.remove(key).unwrap_or_else(|e| {
            warn!(key, error = %e, "Disk tier delete failed");
            false
        });
        in_memory || on_disk
    }

    /// Removes every entry carrying exactly `tag`, returning how many went.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let from_memory = self.inner.memory.remove_where(|e| e.has_tag(tag));
        let from_disk = self.inner.disk.remove_by_tag(tag).unwrap_or_else(|e| {
            warn!(tag, error = %e, "Disk tier tag invalidation failed");
            0
        });
        debug!(tag, removed = from_memory + from_disk, "Invalidated cache tag");
        from_memory + from_disk
    }

    /// Empties both tiers. Counters are kept.
    pub fn clear(&self) {
        self.inner.memory.clear();
        if let Err(e) = self.inner.disk.clear() {
            warn!(error = %e, "Disk tier clear failed");
        }
    }

    /// Purges expired entries from both tiers.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let from_memory = self.inner.memory.remove_where(|e| e.is_expired(now));
        let from_disk = self.inner.disk.remove_expired(now).unwrap_or_else(|e| {
            warn!(error = %e, "Disk tier sweep failed");
            0
        });
        let removed = from_memory + from_disk;
        if removed > 0 {
            self.inner
                .expired_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Spawns a task that sweeps expired entries every `every`.
    ///
    /// The task ends once every handle to the store has been dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Self { inner }.sweep_expired();
            }
        })
    }

    /// Returns occupancy and hit statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let disk_entries = self.inner.disk.len().unwrap_or_else(|e| {
            warn!(error = %e, "Disk tier count failed");
            0
        });
        let disk_bytes = self.inner.disk.size_bytes().unwrap_or_else(|e| {
            warn!(error = %e, "Disk tier size failed");
            0
        });
        let memory_entries = self.inner.memory.len();
        let memory_size_bytes = self.inner.memory.size_bytes();
        CacheStats {
            total_entries: memory_entries + disk_entries,
            memory_entries,
            disk_entries,
            total_size_bytes: memory_size_bytes + disk_bytes,
            memory_size_bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            hit_rate: 0.0,
            miss_rate: 0.0,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expired_removed: self.inner.expired_removed.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
        }
        .with_rates()
    }

    /// Reads memory first, then disk, promoting disk hits.
    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        let now = now_ms();
        match self.inner.memory.get(key, now) {
            MemoryRead::Hit(value) => return Some(value),
            MemoryRead::Expired => {
                self.inner.expired_removed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            MemoryRead::Absent => {}
        }

        match self.inner.disk.get(key) {
            Ok(Some(entry)) if entry.is_expired(now) => {
                self.remove_from_disk(key);
                self.inner.expired_removed.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(Some(mut entry)) => {
                self.remove_from_disk(key);
                entry.last_accessed_ms = now;
                let value = entry.value.clone();
                debug!(key, "Promoting cache entry to memory");
                self.admit(entry.in_tier(CacheTier::Memory));
                Some(value)
            }
            Ok(None) => None,
            Err(e @ CacheError::Corruption { .. }) => {
                warn!(key, error = %e, "Discarding corrupted cache entry");
                self.remove_from_disk(key);
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Disk tier read failed");
                None
            }
        }
    }

    fn remove_from_disk(&self, key: &str) {
        if let Err(e) = self.inner.disk.remove(key) {
            warn!(key, error = %e, "Disk tier delete failed");
        }
    }

    fn demote(&self, entry: CacheEntry) {
        if self.inner.memory.contains(&entry.key) {
            debug!(key = %entry.key, "Key re-admitted before demotion, skipping disk write");
            return;
        }
        let entry = entry.in_tier(CacheTier::Disk);
        if let Err(e) = self.inner.disk.put(&entry) {
            warn!(key = %entry.key, error = %e, "Failed to demote cache entry, dropping it");
        }
    }

    /// Inserts into memory and demotes LRU entries until the tier is within
    /// its bounds. Entries larger than the whole memory budget go to disk.
    ///
    /// Victims are chosen under the admission lock; disk writes happen after
    /// it is released.
    fn admit(&self, entry: CacheEntry) {
        for victim in self.select_victims(entry) {
            self.demote(victim);
        }
    }

    fn select_victims(&self, entry: CacheEntry) -> Vec<CacheEntry> {
        let _admission = self.inner.admission.lock();

        if entry.size_bytes > self.inner.max_bytes {
            self.inner.memory.remove(&entry.key);
            return vec![entry];
        }

        let mut pinned = self.inner.in_flight.keys();
        pinned.insert(entry.key.clone());
        self.inner.memory.insert(entry);

        let mut victims = Vec::new();
        while self.inner.memory.len() > self.inner.max_entries
            || self.inner.memory.size_bytes() > self.inner.max_bytes
        {
            let Some(victim) = self.inner.memory.lru_candidate(&pinned) else {
                warn!(
                    entries = self.inner.memory.len(),
                    "Memory tier over capacity but every entry is pinned"
                );
                break;
            };
            if let Some(evicted) = self.inner.memory.remove(&victim) {
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                victims.push(evicted);
            }
        }
        victims
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("max_entries", &self.inner.max_entries)
            .field("max_bytes", &self.inner.max_bytes)
            .field("memory_entries", &self.inner.memory.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Builds the cache key for a stage output.
///
/// The key hashes the canonical JSON of the tool, stage, request input and
/// the outputs of the stage's dependencies.
#[must_use]
pub fn stage_cache_key(
    tool: &str,
    stage_id: &str,
    input: &serde_json::Value,
    dependencies: &StageInputs,
) -> String {
    let material = serde_json::json!({
        "tool": tool,
        "stage": stage_id,
        "input": input,
        "dependencies": dependencies.to_json(),
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    format!("stage:{}", hex::encode(Sha256::digest(&bytes)))
}
