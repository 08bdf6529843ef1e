//! In-process backend for tests and dry runs.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{CacheBackend, CacheError, CacheRecord, GuardOutcome, WriteGuard};

/// Records held in a map behind an async mutex.
///
/// Reads and writes can be made to fail on demand to exercise degraded
/// paths.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, CacheRecord>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                message: "reads disabled".to_string(),
            });
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                message: "writes disabled".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        self.check_reads()?;
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn write(&self, record: CacheRecord) -> Result<(), CacheError> {
        self.check_writes()?;
        self.records.lock().await.insert(record.key.clone(), record);
        Ok(())
    }

    async fn write_guarded(
        &self,
        record: CacheRecord,
        guard: &WriteGuard,
    ) -> Result<GuardOutcome, CacheError> {
        self.check_writes()?;
        let mut records = self.records.lock().await;
        let existing = records.get(&record.key);
        if !guard.matches(existing) {
            return Ok(GuardOutcome::Conflict {
                current: guard.current(existing).map(String::from),
            });
        }
        records.insert(record.key.clone(), record);
        drop(records);
        Ok(GuardOutcome::Written)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.check_writes()?;
        self.records.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.check_reads()?;
        Ok(self.records.lock().await.keys().cloned().collect())
    }
}
