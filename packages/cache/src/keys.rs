//! Cache key namespace and the freshness policy attached to it.
//!
//! Keys are flat strings. The prefix/suffix decides how long a record stays
//! fresh: reference tables are refreshed daily, pipeline state never expires,
//! and everything else is treated as a short-lived fetch cache.

use chrono::{DateTime, Duration, Utc};

/// Run log key.
pub const FUNCTION_RUNS: &str = "function-runs";

/// Hashes last handed to post-processing, keyed by source.
pub const LAST_PROCESSED_HASHES: &str = "last-processed-hashes";

/// Prefix of reference table keys.
pub const REFERENCE_PREFIX: &str = "reference-";

const DURABLE_SUFFIXES: &[&str] = &["-incidents", "-hash", "-metrics"];

/// Key holding the incident set for `source`.
#[must_use]
pub fn incidents(source: &str) -> String {
    format!("{source}-incidents")
}

/// Key holding the content hash of the stored incident set for `source`.
#[must_use]
pub fn hash(source: &str) -> String {
    format!("{source}-hash")
}

/// Key holding collection metrics samples for `source`.
#[must_use]
pub fn metrics(source: &str) -> String {
    format!("{source}-metrics")
}

/// Key holding the last raw payload fetched for `source`.
#[must_use]
pub fn payload(source: &str) -> String {
    format!("{source}-payload")
}

/// Key holding the reference table `table`.
#[must_use]
pub fn reference(table: &str) -> String {
    format!("{REFERENCE_PREFIX}{table}")
}

/// Every key that belongs to `source`.
#[must_use]
pub fn source_keys(source: &str) -> [String; 4] {
    [
        incidents(source),
        hash(source),
        metrics(source),
        payload(source),
    ]
}

/// How long a record stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never expires.
    Durable,
    /// Expires after the given window.
    Window(Duration),
}

impl Freshness {
    /// Returns `true` if a record written at `written` is still fresh at
    /// `now`.
    #[must_use]
    pub fn is_fresh(self, written: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Durable => true,
            Self::Window(window) => now.signed_duration_since(written) < window,
        }
    }
}

/// Returns the freshness policy for `key`.
#[must_use]
pub fn freshness_for(key: &str) -> Freshness {
    if key.starts_with(REFERENCE_PREFIX) {
        Freshness::Window(Duration::hours(24))
    } else if key == FUNCTION_RUNS
        || key == LAST_PROCESSED_HASHES
        || DURABLE_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
    {
        Freshness::Durable
    } else {
        Freshness::Window(Duration::hours(1))
    }
}
