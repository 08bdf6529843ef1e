//! Directory-backed store: one JSON document per key.
//!
//! Writes go to a temporary sibling and are renamed into place, so readers
//! never observe a half-written record. Guarded writes serialize on a
//! `{key}.lock` file created with `create_new`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::{CacheBackend, CacheError, CacheRecord, CollectionSummary, GuardOutcome, WriteGuard};

const RECORD_EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";
const LOCK_POLL: Duration = Duration::from_millis(50);
const LOCK_ATTEMPTS: u32 = 100;
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Stores each record as `{dir}/{encoded key}.json`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::debug!("File cache at {}", dir.display());
        Ok(Self { dir })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", encode_key(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{LOCK_EXTENSION}", encode_key(key)))
    }

    async fn read_text(&self, key: &str) -> Result<Option<String>, CacheError> {
        match tokio::fs::read_to_string(self.record_path(key)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_write(
        &self,
        record: CacheRecord,
        guard: &WriteGuard,
    ) -> Result<GuardOutcome, CacheError> {
        let existing = self.read(&record.key).await?;
        if !guard.matches(existing.as_ref()) {
            return Ok(GuardOutcome::Conflict {
                current: guard.current(existing.as_ref()).map(String::from),
            });
        }
        self.write(record).await?;
        Ok(GuardOutcome::Written)
    }

    async fn acquire_lock(&self, key: &str) -> Result<LockFile, CacheError> {
        let path = self.lock_path(key);
        for _ in 0..LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockFile { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        log::warn!("Removing stale lock {}", path.display());
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CacheError::LockTimeout {
            key: key.to_string(),
        })
    }
}

struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn release(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            log::warn!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Percent-encodes every byte outside `[A-Za-z0-9_.-]`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[derive(Deserialize)]
struct RawRecord<'a> {
    #[serde(borrow)]
    value: &'a RawValue,
    timestamp: DateTime<Utc>,
}

fn summarize_text(text: &str, array_field: &str) -> Result<Option<CollectionSummary>, CacheError> {
    let record: RawRecord<'_> = serde_json::from_str(text)?;
    let Ok(fields) = serde_json::from_str::<BTreeMap<String, &RawValue>>(record.value.get())
    else {
        return Ok(None);
    };
    let Some(array) = fields.get(array_field) else {
        return Ok(None);
    };
    let Ok(items) = serde_json::from_str::<Vec<&RawValue>>(array.get()) else {
        return Ok(None);
    };
    let decode = |raw: Option<&&RawValue>| -> Result<Option<serde_json::Value>, CacheError> {
        raw.map(|raw| serde_json::from_str(raw.get()))
            .transpose()
            .map_err(CacheError::from)
    };
    Ok(Some(CollectionSummary {
        count: items.len(),
        first: decode(items.first())?,
        last: decode(items.last())?,
        timestamp: record.timestamp,
    }))
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        let Some(text) = self.read_text(key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn write(&self, record: CacheRecord) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&record)?;
        write_atomically(&self.record_path(&record.key), &bytes).await
    }

    async fn write_guarded(
        &self,
        record: CacheRecord,
        guard: &WriteGuard,
    ) -> Result<GuardOutcome, CacheError> {
        let lock = self.acquire_lock(&record.key).await?;
        let result = self.compare_and_write(record, guard).await;
        lock.release().await;
        result
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn summarize(
        &self,
        key: &str,
        array_field: &str,
    ) -> Result<Option<CollectionSummary>, CacheError> {
        match self.read_text(key).await? {
            Some(text) => summarize_text(&text, array_field),
            None => Ok(None),
        }
    }
}
