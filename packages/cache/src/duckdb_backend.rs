//! `DuckDB`-backed store: a single `cache` table keyed by cache key.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;

use crate::{CacheBackend, CacheError, CacheRecord, GuardOutcome, WriteGuard};

/// `duckdb::Connection` is `Send` but not `Sync`, so it lives behind a
/// `Mutex`. Holding the lock across read-compare-write makes guarded writes
/// atomic for every caller sharing this backend.
pub struct DuckDbBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for DuckDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbBackend").finish_non_exhaustive()
    }
}

impl DuckDbBackend {
    /// Opens (or creates) the cache database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the connection or schema creation fails.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                written_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn acquire(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn select(conn: &Connection, key: &str) -> Result<Option<CacheRecord>, CacheError> {
    let mut stmt = conn.prepare("SELECT value, written_at FROM cache WHERE key = ?")?;
    let row = stmt.query_row([key], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    });
    let (value, written_at) = match row {
        Ok(row) => row,
        Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(CacheError::DuckDb(e)),
    };
    let timestamp = DateTime::parse_from_rfc3339(&written_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::Unavailable {
            message: format!("Bad timestamp for {key}: {e}"),
        })?;
    Ok(Some(CacheRecord {
        key: key.to_string(),
        value: serde_json::from_str(&value)?,
        timestamp,
    }))
}

fn upsert(conn: &Connection, record: &CacheRecord) -> Result<(), CacheError> {
    let value = serde_json::to_string(&record.value)?;
    conn.execute(
        "INSERT INTO cache (key, value, written_at) VALUES (?, ?, ?)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, written_at = EXCLUDED.written_at",
        duckdb::params![record.key, value, record.timestamp.to_rfc3339()],
    )?;
    Ok(())
}

#[async_trait]
impl CacheBackend for DuckDbBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        select(&self.acquire(), key)
    }

    async fn write(&self, record: CacheRecord) -> Result<(), CacheError> {
        upsert(&self.acquire(), &record)
    }

    async fn write_guarded(
        &self,
        record: CacheRecord,
        guard: &WriteGuard,
    ) -> Result<GuardOutcome, CacheError> {
        let conn = self.acquire();
        let existing = select(&conn, &record.key)?;
        if !guard.matches(existing.as_ref()) {
            return Ok(GuardOutcome::Conflict {
                current: guard.current(existing.as_ref()).map(String::from),
            });
        }
        upsert(&conn, &record)?;
        drop(conn);
        Ok(GuardOutcome::Written)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.acquire()
            .execute("DELETE FROM cache WHERE key = ?", [key])?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let conn = self.acquire();
        let mut stmt = conn.prepare("SELECT key FROM cache ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
