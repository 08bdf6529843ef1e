#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Key/value cache store for the seawatch pipeline.
//!
//! The same store serves as a short-lived fetch cache and as the durable
//! "last known incident set" per source. Records carry their write time;
//! [`CacheStore::get`] applies the freshness policy from [`keys`] lazily,
//! deleting stale records on read instead of sweeping in the background.
//!
//! Storage is pluggable through [`CacheBackend`]: [`memory::MemoryBackend`]
//! for tests and dry runs, [`file::FileBackend`] for a local data directory,
//! and a `DuckDB` backend behind the `duckdb` feature.

pub mod backend;
pub mod clock;
#[cfg(feature = "duckdb")]
pub mod duckdb_backend;
pub mod file;
pub mod keys;
pub mod memory;
mod store;

pub use backend::{CacheBackend, CacheRecord, CollectionSummary, GuardOutcome, WriteGuard};
pub use clock::{Clock, ManualClock, SystemClock};
pub use store::CacheStore;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The underlying storage refused the operation.
    #[error("Cache unavailable: {message}")]
    Unavailable {
        /// Description of what went wrong.
        message: String,
    },

    /// A guarded write could not acquire the key's lock in time.
    #[error("Timed out waiting for lock on key {key}")]
    LockTimeout {
        /// The contended key.
        key: String,
    },

    /// `DuckDB` error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}
