use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    CacheBackend, CacheError, CacheRecord, Clock, CollectionSummary, GuardOutcome, SystemClock,
    WriteGuard, keys::freshness_for, memory::MemoryBackend,
};

/// Field stamped into object values on every write.
const TIMESTAMP_FIELD: &str = "timestamp";

/// Cache facade used by the pipeline.
///
/// Writes are stamped with the clock's current time and fail loudly. Reads
/// apply the key's freshness window, delete stale records, and degrade
/// backend failures to "absent" so a flaky store never aborts a collection
/// on its own.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Wraps `backend` using wall-clock time.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    /// Wraps `backend` with an explicit clock.
    #[must_use]
    pub fn with_clock(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// An empty in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Current time according to the store's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The store's clock, for components that must agree with it.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn stamp(&self, key: &str, mut value: serde_json::Value) -> CacheRecord {
        let timestamp = self.clock.now();
        if let Some(object) = value.as_object_mut() {
            object.insert(
                TIMESTAMP_FIELD.to_string(),
                serde_json::Value::String(timestamp.to_rfc3339()),
            );
        }
        CacheRecord {
            key: key.to_string(),
            value,
            timestamp,
        }
    }

    /// Writes `value` under `key`, stamping the current time.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend write fails.
    pub async fn store(&self, key: &str, value: serde_json::Value) -> Result<(), CacheError> {
        let record = self.stamp(key, value);
        self.backend.write(record).await?;
        log::debug!("Stored {key}");
        Ok(())
    }

    /// Serializes and writes `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if serialization or the backend write fails.
    pub async fn store_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.store(key, serde_json::to_value(value)?).await
    }

    /// Writes `value` only if the stored value still satisfies `guard`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails. A failed precondition is
    /// not an error; it is reported as [`GuardOutcome::Conflict`].
    pub async fn store_guarded(
        &self,
        key: &str,
        value: serde_json::Value,
        guard: &WriteGuard,
    ) -> Result<GuardOutcome, CacheError> {
        let record = self.stamp(key, value);
        let outcome = self.backend.write_guarded(record, guard).await?;
        if let GuardOutcome::Conflict { current } = &outcome {
            log::warn!(
                "Guarded write to {key} rejected: expected {:?}, found {current:?}",
                guard.expected
            );
        }
        Ok(outcome)
    }

    /// Reads the full record for `key`, or `None` if absent, stale, or the
    /// backend is failing.
    pub async fn get_record(&self, key: &str) -> Option<CacheRecord> {
        let record = match self.backend.read(key).await {
            Ok(record) => record?,
            Err(e) => {
                log::warn!("Cache read of {key} failed, treating as absent: {e}");
                return None;
            }
        };

        if freshness_for(key).is_fresh(record.timestamp, self.clock.now()) {
            return Some(record);
        }

        log::debug!("Expiring stale cache entry {key}");
        if let Err(e) = self.backend.remove(key).await {
            log::warn!("Failed to delete stale entry {key}: {e}");
        }
        None
    }

    /// Reads the value for `key`. See [`Self::get_record`].
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.get_record(key).await.map(|record| record.value)
    }

    /// Reads and deserializes the value for `key`. A value that does not
    /// decode as `T` is logged and treated as absent.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                log::warn!("Cached value at {key} has unexpected shape: {e}");
                None
            }
        }
    }

    /// Deletes `key`. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.remove(key).await?;
        log::debug!("Deleted {key}");
        Ok(())
    }

    /// Count plus head/tail element of the array at `array_field`, read
    /// without decoding the whole collection.
    pub async fn summary(&self, key: &str, array_field: &str) -> Option<CollectionSummary> {
        let summary = match self.backend.summarize(key, array_field).await {
            Ok(summary) => summary?,
            Err(e) => {
                log::warn!("Cache summary of {key} failed: {e}");
                return None;
            }
        };
        freshness_for(key)
            .is_fresh(summary.timestamp, self.clock.now())
            .then_some(summary)
    }

    /// Lists stored keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend cannot list keys.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut keys = self.backend.keys().await?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
