//! Storage backend trait and the record types it moves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CacheError;

/// A stored value together with its key and write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Flat-namespace key.
    pub key: String,
    /// Arbitrary JSON payload.
    pub value: serde_json::Value,
    /// When the record was written. Drives expiry.
    pub timestamp: DateTime<Utc>,
}

/// Precondition for a guarded write.
///
/// The write only happens when the string at `field` in the currently
/// stored value equals `expected`. `expected = None` means "no record, or
/// the field is absent/null".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteGuard {
    /// Top-level field of the stored JSON object to compare.
    pub field: String,
    /// Value the field must currently hold.
    pub expected: Option<String>,
}

impl WriteGuard {
    /// Creates a guard on `field`.
    #[must_use]
    pub fn new(field: &str, expected: Option<&str>) -> Self {
        Self {
            field: field.to_string(),
            expected: expected.map(String::from),
        }
    }

    /// Returns the guarded field's current value in `record`.
    #[must_use]
    pub fn current<'a>(&self, record: Option<&'a CacheRecord>) -> Option<&'a str> {
        record?.value.get(&self.field)?.as_str()
    }

    /// Returns `true` when `record` satisfies the guard.
    #[must_use]
    pub fn matches(&self, record: Option<&CacheRecord>) -> bool {
        self.current(record) == self.expected.as_deref()
    }
}

/// Result of a guarded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The precondition held and the record was written.
    Written,
    /// Another writer changed the record first; nothing was written.
    Conflict {
        /// The guarded field's value as found in the store.
        current: Option<String>,
    },
}

/// Head/tail view of a stored JSON array, read without materializing typed
/// elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    /// Number of elements in the array.
    pub count: usize,
    /// First element, if any.
    pub first: Option<serde_json::Value>,
    /// Last element, if any.
    pub last: Option<serde_json::Value>,
    /// Write time of the record holding the array.
    pub timestamp: DateTime<Utc>,
}

impl CollectionSummary {
    /// Builds a summary from an already-decoded record value.
    #[must_use]
    pub fn from_value(
        value: &serde_json::Value,
        array_field: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<Self> {
        let items = value.get(array_field)?.as_array()?;
        Some(Self {
            count: items.len(),
            first: items.first().cloned(),
            last: items.last().cloned(),
            timestamp,
        })
    }
}

/// Raw storage operations. Freshness, stamping, and failure policy live in
/// [`crate::CacheStore`]; backends only move records.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads the record for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be read.
    async fn read(&self, key: &str) -> Result<Option<CacheRecord>, CacheError>;

    /// Writes (inserts or replaces) a record.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be written.
    async fn write(&self, record: CacheRecord) -> Result<(), CacheError>;

    /// Atomically checks `guard` against the stored record and writes
    /// `record` only if it holds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be read or written.
    async fn write_guarded(
        &self,
        record: CacheRecord,
        guard: &WriteGuard,
    ) -> Result<GuardOutcome, CacheError>;

    /// Removes `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be written.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Lists every stored key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be listed.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Summarizes the array at `array_field` of the record for `key`.
    ///
    /// The default implementation reads the whole record; backends that can
    /// avoid that should override it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the storage cannot be read.
    async fn summarize(
        &self,
        key: &str,
        array_field: &str,
    ) -> Result<Option<CollectionSummary>, CacheError> {
        Ok(self.read(key).await?.and_then(|record| {
            CollectionSummary::from_value(&record.value, array_field, record.timestamp)
        }))
    }
}
