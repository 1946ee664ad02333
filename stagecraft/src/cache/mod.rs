//! Two-tier result cache.
//!
//! A bounded memory tier backed by a persistent disk tier, with TTL expiry,
//! exact tag invalidation, LRU demotion and single-flight computation of
//! missing keys.

mod disk;
mod entry;
mod memory;
mod single_flight;
mod store;

pub use disk::{DiskTier, InMemoryDiskTier};
#[cfg(feature = "sqlite")]
pub use disk::SqliteDiskTier;
pub use entry::{now_ms, CacheEntry, CacheStats, CacheTier};
pub use single_flight::{CacheClaim, CacheLookup};
pub use store::{stage_cache_key, CacheStore};
