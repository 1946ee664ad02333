//! Cache entries and statistics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// The tier an entry currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Bounded in-process tier.
    Memory,
    /// Persistent overflow tier.
    Disk,
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key.
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Invalidation tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Creation time (epoch ms).
    pub created_at_ms: u64,
    /// Time to live in milliseconds.
    pub ttl_ms: u64,
    /// Current tier.
    pub tier: CacheTier,
    /// Size of `value` in bytes.
    pub size_bytes: u64,
    /// Last read or write (epoch ms).
    pub last_accessed_ms: u64,
}

impl CacheEntry {
    /// Creates a memory-tier entry.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: Duration,
        tags: BTreeSet<String>,
        now_ms: u64,
    ) -> Self {
        let size_bytes = value.len() as u64;
        Self {
            key: key.into(),
            value,
            tags,
            created_at_ms: now_ms,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            tier: CacheTier::Memory,
            size_bytes,
            last_accessed_ms: now_ms,
        }
    }

    /// Epoch ms after which the entry is expired.
    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.created_at_ms.saturating_add(self.ttl_ms)
    }

    /// Returns true once `created_at + ttl < now`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms() < now_ms
    }

    /// Returns true if the entry carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the entry moved to `tier`.
    #[must_use]
    pub fn in_tier(mut self, tier: CacheTier) -> Self {
        self.tier = tier;
        self
    }
}

/// A point-in-time view of cache occupancy and effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries across both tiers.
    pub total_entries: usize,
    /// Entries in the memory tier.
    pub memory_entries: usize,
    /// Entries in the disk tier.
    pub disk_entries: usize,
    /// Value bytes across both tiers.
    pub total_size_bytes: u64,
    /// Value bytes in the memory tier.
    pub memory_size_bytes: u64,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up.
    pub hit_rate: f64,
    /// `misses / (hits + misses)`, 0 when nothing was looked up.
    pub miss_rate: f64,
    /// Memory entries demoted to disk.
    pub evictions: u64,
    /// Expired entries removed lazily or by the sweeper.
    pub expired_removed: u64,
    /// Keys currently being computed under a claim.
    pub in_flight: usize,
}

impl CacheStats {
    /// Fills in the hit and miss rates from the counters.
    #[must_use]
    pub fn with_rates(mut self) -> Self {
        let lookups = self.hits + self.misses;
        if lookups > 0 {
            #[allow(clippy::cast_precision_loss)]
            let total = lookups as f64;
            #[allow(clippy::cast_precision_loss)]
            {
                self.hit_rate = self.hits as f64 / total;
                self.miss_rate = self.misses as f64 / total;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new("k", vec![1, 2, 3], Duration::from_millis(10), BTreeSet::new(), 1_000);
        assert_eq!(entry.size_bytes, 3);
        assert_eq!(entry.tier, CacheTier::Memory);
        assert!(!entry.is_expired(1_010));
        assert!(entry.is_expired(1_011));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = CacheEntry::new("k", vec![], Duration::MAX, BTreeSet::new(), 5);
        assert!(!entry.is_expired(u64::MAX - 1));
    }

    #[test]
    fn test_stats_rates() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        }
        .with_rates();
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert!((stats.miss_rate - 0.25).abs() < f64::EPSILON);

        let empty = CacheStats::default().with_rates();
        assert!(empty.hit_rate.abs() < f64::EPSILON);
    }
}
