//! Unified request cache.
//!
//! One abstraction over both cache tiers, keyed by request identity:
//! - memory tier for short-lived lookups (address histories, index data)
//! - SQLite tier for immutable payloads (confirmed transactions, ledger
//!   events), promoted into memory on first read
//!
//! WAL mode keeps concurrent investor tasks from serializing on reads.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    expires_at INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
) WITHOUT ROWID;
"#;

/// How long a persistent hit stays promoted in the memory tier.
const PROMOTE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Memory only; lost on process exit.
    Memory,
    /// Memory plus SQLite; survives across runs.
    Persistent,
}

struct MemEntry {
    json: String,
    expires_at: Option<Instant>,
}

pub struct CacheStore {
    conn: Mutex<Connection>,
    memory: Mutex<HashMap<String, MemEntry>>,
}

impl CacheStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache database {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize cache schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            memory: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a cached value, consulting memory first, then SQLite.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(json) = self.get_memory(key) {
            return serde_json::from_str(&json).ok();
        }

        let json = self.get_persistent(key)?;
        // Promote so repeated lookups in the same run stay off disk.
        self.put_memory(key, json.clone(), Some(PROMOTE_TTL));
        serde_json::from_str(&json).ok()
    }

    pub fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tier: CacheTier,
    ) -> Result<()> {
        let json = serde_json::to_string(value).context("failed to serialize cache value")?;
        self.put_memory(key, json.clone(), ttl);

        if tier == CacheTier::Persistent {
            let expires_at = ttl.map(|d| unix_now() + d.as_secs() as i64);
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO cache_entries (key, value_json, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = ?2, expires_at = ?3",
                params![key, json, expires_at],
            )
            .context("failed to write cache entry")?;
        }
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        self.memory.lock().remove(key);
        let conn = self.conn.lock();
        if let Err(e) = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]) {
            warn!(key, error = %e, "failed to invalidate persistent cache entry");
        }
    }

    fn get_memory(&self, key: &str) -> Option<String> {
        let mut memory = self.memory.lock();
        match memory.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|t| t <= Instant::now()) {
                    memory.remove(key);
                    None
                } else {
                    Some(entry.json.clone())
                }
            }
            None => None,
        }
    }

    fn put_memory(&self, key: &str, json: String, ttl: Option<Duration>) {
        self.memory.lock().insert(
            key.to_string(),
            MemEntry {
                json,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn get_persistent(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value_json, expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let (json, expires_at) = row?;
        if expires_at.is_some_and(|t| t <= unix_now()) {
            drop(conn);
            self.invalidate(key);
            return None;
        }
        Some(json)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = CacheStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_memory_round_trip() {
        let (_dir, cache) = temp_cache();
        cache.put("k", &vec![1u64, 2, 3], None, CacheTier::Memory).unwrap();
        let got: Vec<u64> = cache.get("k").unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn test_persistent_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();

        {
            let cache = CacheStore::open(path).unwrap();
            cache
                .put("tx.abc", &"payload".to_string(), None, CacheTier::Persistent)
                .unwrap();
        }

        let cache = CacheStore::open(path).unwrap();
        let got: String = cache.get("tx.abc").unwrap();
        assert_eq!(got, "payload");
    }

    #[test]
    fn test_memory_only_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();

        {
            let cache = CacheStore::open(path).unwrap();
            cache
                .put("volatile", &1u32, None, CacheTier::Memory)
                .unwrap();
        }

        let cache = CacheStore::open(path).unwrap();
        assert_eq!(cache.get::<u32>("volatile"), None);
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let (_dir, cache) = temp_cache();
        cache
            .put("fleeting", &1u32, Some(Duration::ZERO), CacheTier::Memory)
            .unwrap();
        assert_eq!(cache.get::<u32>("fleeting"), None);
    }

    #[test]
    fn test_invalidate_removes_both_tiers() {
        let (_dir, cache) = temp_cache();
        cache
            .put("gone", &1u32, None, CacheTier::Persistent)
            .unwrap();
        cache.invalidate("gone");
        assert_eq!(cache.get::<u32>("gone"), None);
    }
}
