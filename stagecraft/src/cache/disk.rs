//! Persistent overflow tier.
//!
//! The memory tier demotes least-recently-used entries here. Reads promote
//! entries back, so a key lives in at most one tier at a time.

use super::entry::{CacheEntry, CacheTier};
use crate::errors::CacheError;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Storage backend for demoted cache entries.
///
/// Implementations report unreadable rows as [`CacheError::Corruption`];
/// the store logs, deletes and treats them as misses.
pub trait DiskTier: Send + Sync {
    /// Writes an entry, replacing any previous one for the key.
    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Reads an entry.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Removes an entry, returning whether it existed.
    fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every entry carrying `tag`.
    fn remove_by_tag(&self, tag: &str) -> Result<usize, CacheError>;

    /// Removes every entry expired at `now_ms`.
    fn remove_expired(&self, now_ms: u64) -> Result<usize, CacheError>;

    /// Removes everything.
    fn clear(&self) -> Result<(), CacheError>;

    /// Number of stored entries.
    fn len(&self) -> Result<usize, CacheError>;

    /// Total value bytes stored.
    fn size_bytes(&self) -> Result<u64, CacheError>;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

/// A disk tier kept in process memory, for tests and builds without SQLite.
#[derive(Debug, Default)]
pub struct InMemoryDiskTier {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryDiskTier {
    /// Creates an empty tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiskTier for InMemoryDiskTier {
    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(entry.key.clone(), entry.clone().in_tier(CacheTier::Disk));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn remove_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.has_tag(tag));
        Ok(before - entries.len())
    }

    fn remove_expired(&self, now_ms: u64) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now_ms));
        Ok(before - entries.len())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.lock().len())
    }

    fn size_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.entries.lock().values().map(|e| e.size_bytes).sum())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDiskTier;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{CacheEntry, CacheError, CacheTier, DiskTier};
    use parking_lot::Mutex;
    use rusqlite::{params, Connection, OptionalExtension};
    use sha2::{Digest, Sha256};
    use std::collections::BTreeSet;
    use std::path::Path;

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS cache_entries (
            key              TEXT PRIMARY KEY,
            value            BLOB NOT NULL,
            checksum         TEXT NOT NULL,
            created_at_ms    INTEGER NOT NULL,
            ttl_ms           INTEGER NOT NULL,
            last_accessed_ms INTEGER NOT NULL,
            size_bytes       INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS cache_tags (
            key TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (key, tag)
        );
        CREATE INDEX IF NOT EXISTS idx_cache_tags_tag ON cache_tags(tag);
    ";

    const DELETE_ORPHAN_TAGS: &str =
        "DELETE FROM cache_tags WHERE key NOT IN (SELECT key FROM cache_entries)";

    fn checksum(value: &[u8]) -> String {
        hex::encode(Sha256::digest(value))
    }

    fn to_sql(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    /// SQLite-backed disk tier.
    ///
    /// Values are stored with a SHA-256 checksum; tags live in a side table so
    /// tag invalidation never matches substrings.
    #[derive(Debug)]
    pub struct SqliteDiskTier {
        conn: Mutex<Connection>,
    }

    impl SqliteDiskTier {
        /// Opens (or creates) a database file.
        ///
        /// # Errors
        ///
        /// Returns `CacheError::Storage` if the database cannot be opened.
        pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
            Self::with_connection(Connection::open(path)?)
        }

        /// Opens a private in-memory database.
        ///
        /// # Errors
        ///
        /// Returns `CacheError::Storage` if SQLite fails to initialise.
        pub fn open_in_memory() -> Result<Self, CacheError> {
            Self::with_connection(Connection::open_in_memory()?)
        }

        fn with_connection(conn: Connection) -> Result<Self, CacheError> {
            conn.execute_batch(SCHEMA)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    struct RawRow {
        value: Vec<u8>,
        checksum: String,
        created_at_ms: i64,
        ttl_ms: i64,
        last_accessed_ms: i64,
        size_bytes: i64,
    }

    fn decode(key: &str, row: RawRow, tags: BTreeSet<String>) -> Result<CacheEntry, CacheError> {
        let corrupt = |reason: String| CacheError::Corruption {
            key: key.to_string(),
            reason,
        };
        let unsigned = |field: &str, v: i64| {
            u64::try_from(v).map_err(|_| corrupt(format!("negative {field}: {v}")))
        };
        if checksum(&row.value) != row.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let size_bytes = unsigned("size_bytes", row.size_bytes)?;
        if size_bytes != row.value.len() as u64 {
            return Err(corrupt(format!(
                "size {size_bytes} does not match value length {}",
                row.value.len()
            )));
        }
        Ok(CacheEntry {
            key: key.to_string(),
            value: row.value,
            tags,
            created_at_ms: unsigned("created_at_ms", row.created_at_ms)?,
            ttl_ms: unsigned("ttl_ms", row.ttl_ms)?,
            tier: CacheTier::Disk,
            size_bytes,
            last_accessed_ms: unsigned("last_accessed_ms", row.last_accessed_ms)?,
        })
    }

    impl DiskTier for SqliteDiskTier {
        fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM cache_tags WHERE key = ?1", params![entry.key])?;
            tx.execute(
                "INSERT INTO cache_entries (key, value, checksum, created_at_ms, ttl_ms,
                                            last_accessed_ms, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     checksum = excluded.checksum,
                     created_at_ms = excluded.created_at_ms,
                     ttl_ms = excluded.ttl_ms,
                     last_accessed_ms = excluded.last_accessed_ms,
                     size_bytes = excluded.size_bytes",
                params![
                    entry.key,
                    entry.value,
                    checksum(&entry.value),
                    to_sql(entry.created_at_ms),
                    to_sql(entry.ttl_ms),
                    to_sql(entry.last_accessed_ms),
                    to_sql(entry.size_bytes),
                ],
            )?;
            {
                let mut stmt = tx.prepare("INSERT INTO cache_tags (key, tag) VALUES (?1, ?2)")?;
                for tag in &entry.tags {
                    stmt.execute(params![entry.key, tag])?;
                }
            }
            tx.commit()?;
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
            let conn = self.conn.lock();
            let row = conn
                .query_row(
                    "SELECT value, checksum, created_at_ms, ttl_ms, last_accessed_ms, size_bytes
                     FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(RawRow {
                            value: row.get(0)?,
                            checksum: row.get(1)?,
                            created_at_ms: row.get(2)?,
                            ttl_ms: row.get(3)?,
                            last_accessed_ms: row.get(4)?,
                            size_bytes: row.get(5)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| match e {
                    rusqlite::Error::FromSqlConversionFailure(..)
                    | rusqlite::Error::InvalidColumnType(..) => CacheError::Corruption {
                        key: key.to_string(),
                        reason: e.to_string(),
                    },
                    other => CacheError::from(other),
                })?;
            let Some(row) = row else {
                return Ok(None);
            };
            let mut stmt = conn.prepare("SELECT tag FROM cache_tags WHERE key = ?1")?;
            let tags = stmt
                .query_map(params![key], |r| r.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            decode(key, row, tags).map(Some)
        }

        fn remove(&self, key: &str) -> Result<bool, CacheError> {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            tx.execute("DELETE FROM cache_tags WHERE key = ?1", params![key])?;
            tx.commit()?;
            Ok(removed > 0)
        }

        fn remove_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM cache_entries
                 WHERE key IN (SELECT key FROM cache_tags WHERE tag = ?1)",
                params![tag],
            )?;
            tx.execute(DELETE_ORPHAN_TAGS, [])?;
            tx.commit()?;
            Ok(removed)
        }

        fn remove_expired(&self, now_ms: u64) -> Result<usize, CacheError> {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM cache_entries WHERE created_at_ms + ttl_ms < ?1",
                params![to_sql(now_ms)],
            )?;
            tx.execute(DELETE_ORPHAN_TAGS, [])?;
            tx.commit()?;
            Ok(removed)
        }

        fn clear(&self) -> Result<(), CacheError> {
            self.conn
                .lock()
                .execute_batch("DELETE FROM cache_entries; DELETE FROM cache_tags;")?;
            Ok(())
        }

        fn len(&self) -> Result<usize, CacheError> {
            let count: i64 =
                self.conn
                    .lock()
                    .query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        }

        fn size_bytes(&self) -> Result<u64, CacheError> {
            let total: i64 = self.conn.lock().query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                [],
                |r| r.get(0),
            )?;
            Ok(u64::try_from(total).unwrap_or(0))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        fn entry(key: &str, tags: &[&str]) -> CacheEntry {
            CacheEntry::new(
                key,
                key.as_bytes().to_vec(),
                Duration::from_secs(60),
                tags.iter().map(ToString::to_string).collect(),
                1_000,
            )
        }

        #[test]
        fn test_put_get_roundtrip() {
            let tier = SqliteDiskTier::open_in_memory().unwrap();
            tier.put(&entry("alpha", &["docs", "rust"])).unwrap();

            let got = tier.get("alpha").unwrap().unwrap();
            assert_eq!(got.value, b"alpha");
            assert_eq!(got.tier, CacheTier::Disk);
            assert!(got.has_tag("docs") && got.has_tag("rust"));
            assert_eq!(tier.len().unwrap(), 1);
            assert_eq!(tier.size_bytes().unwrap(), 5);
        }

        #[test]
        fn test_put_replaces_tags() {
            let tier = SqliteDiskTier::open_in_memory().unwrap();
            tier.put(&entry("k", &["old"])).unwrap();
            tier.put(&entry("k", &["new"])).unwrap();
            assert_eq!(tier.remove_by_tag("old").unwrap(), 0);
            assert_eq!(tier.remove_by_tag("new").unwrap(), 1);
            assert!(tier.is_empty().unwrap());
        }

        #[test]
        fn test_tag_match_is_exact() {
            let tier = SqliteDiskTier::open_in_memory().unwrap();
            tier.put(&entry("a", &["user"])).unwrap();
            tier.put(&entry("b", &["user:1"])).unwrap();
            tier.put(&entry("c", &["superuser"])).unwrap();
            assert_eq!(tier.remove_by_tag("user").unwrap(), 1);
            assert!(tier.get("b").unwrap().is_some());
            assert!(tier.get("c").unwrap().is_some());
        }

        #[test]
        fn test_remove_expired() {
            let tier = SqliteDiskTier::open_in_memory().unwrap();
            tier.put(&CacheEntry::new("short", vec![1], Duration::from_millis(5), BTreeSet::new(), 1_000))
                .unwrap();
            tier.put(&entry("long", &[])).unwrap();
            assert_eq!(tier.remove_expired(2_000).unwrap(), 1);
            assert!(tier.get("short").unwrap().is_none());
            assert!(tier.get("long").unwrap().is_some());
        }

        #[test]
        fn test_tampered_value_is_corruption() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cache.db");
            let tier = SqliteDiskTier::open(&path).unwrap();
            tier.put(&entry("k", &[])).unwrap();

            let raw = Connection::open(&path).unwrap();
            raw.execute("UPDATE cache_entries SET value = x'00ff' WHERE key = 'k'", [])
                .unwrap();

            assert!(matches!(tier.get("k"), Err(CacheError::Corruption { .. })));
        }

        #[test]
        fn test_persists_across_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cache.db");
            SqliteDiskTier::open(&path).unwrap().put(&entry("k", &["t"])).unwrap();

            let reopened = SqliteDiskTier::open(&path).unwrap();
            assert!(reopened.get("k").unwrap().unwrap().has_tag("t"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[test]
    fn test_in_memory_disk_tier() {
        let tier = InMemoryDiskTier::new();
        let tags: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        tier.put(&CacheEntry::new("k", vec![1, 2], Duration::from_secs(1), tags, 0))
            .unwrap();
        assert_eq!(tier.get("k").unwrap().map(|e| e.tier), Some(CacheTier::Disk));
        assert_eq!(tier.size_bytes().unwrap(), 2);
        assert_eq!(tier.remove_by_tag("a").unwrap(), 1);
        assert!(tier.is_empty().unwrap());
    }
}
