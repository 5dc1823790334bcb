//! Per-investor balance snapshot store.
//!
//! One row per public key holding the last fully computed state. The next
//! run's update gate reads it back to decide whether the expensive matcher
//! pass can be skipped. Snapshots are overwritten wholesale, never patched.

use crate::models::BalanceSnapshot;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS snapshots (
    pubkey TEXT PRIMARY KEY,
    snapshot_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open snapshot database {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize snapshot schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn load(&self, pubkey: &str) -> Result<Option<BalanceSnapshot>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE pubkey = ?1",
                params![pubkey],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read snapshot")?;

        match json {
            Some(json) => {
                let snapshot = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt snapshot for pubkey {pubkey}"))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO snapshots (pubkey, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(pubkey) DO UPDATE SET snapshot_json = ?2, updated_at = ?3",
            params![snapshot.pubkey, json, snapshot.updated_at],
        )
        .context("failed to write snapshot")?;
        Ok(())
    }
}
