#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Sync reports, stored incident sets, run log entries, and runtime
//! configuration.

use std::{path::PathBuf, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use seawatch_incident_models::Incident;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

// ── Sync outcome ─────────────────────────────────────────────────────────

/// Terminal status of one source invocation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SyncStatus {
    /// New incidents were merged and persisted.
    Success,
    /// The candidate set hashed the same as the stored one.
    NoChange,
    /// The source returned no usable incidents.
    NoData,
    /// The invocation failed.
    Error,
}

impl SyncStatus {
    /// Run log status for an invocation ending with this status.
    #[must_use]
    pub const fn run_status(self) -> RunStatus {
        match self {
            Self::Success | Self::NoChange | Self::NoData => RunStatus::Success,
            Self::Error => RunStatus::Error,
        }
    }
}

/// JSON status payload emitted once per source invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Terminal status.
    pub status: SyncStatus,
    /// One-line human-readable summary.
    pub message: String,
    /// Source id.
    pub source: String,
    /// Incidents in the stored set after the run.
    pub total: usize,
    /// Incidents added by this run.
    pub new: usize,
    /// Records that could not be used (malformed or dropped by policy).
    pub skipped: usize,
    /// Incidents retained with validation warnings.
    pub invalid: usize,
    /// Content hash of this run's candidate set.
    pub hash: Option<String>,
    /// Whether the collected count looked anomalously low.
    pub anomaly: bool,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
}

impl SyncReport {
    /// An `error` report for `source`.
    #[must_use]
    pub fn error(source: &str, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: SyncStatus::Error,
            message: message.into(),
            source: source.to_string(),
            total: 0,
            new: 0,
            skipped: 0,
            invalid: 0,
            hash: None,
            anomaly: false,
            duration_ms,
        }
    }
}

// ── Stored incident set ──────────────────────────────────────────────────

/// Counts attached to a stored incident set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentSetMetadata {
    /// Source id.
    pub source: String,
    /// Incidents in the set.
    pub total_count: usize,
    /// Incidents added by the run that wrote the set.
    pub new_count: usize,
    /// Records skipped by that run.
    pub skipped_count: usize,
    /// Incidents retained with warnings by that run.
    pub invalid_count: usize,
}

/// Value stored under `{source}-incidents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentSet {
    /// Deduplicated incidents, sorted by the source's ordering key, newest
    /// first.
    pub incidents: Vec<Incident>,
    /// Content hash of the candidate set that produced this version.
    pub hash: String,
    /// Write time (stamped by the cache store).
    pub timestamp: DateTime<Utc>,
    /// Run counts.
    pub metadata: IncidentSetMetadata,
}

// ── Run log ──────────────────────────────────────────────────────────────

/// Status of a run log entry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    /// The invocation began.
    Started,
    /// The invocation finished without error.
    Success,
    /// The invocation failed.
    Error,
}

/// One run log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Function name, e.g. `sync:recaap`.
    pub function: String,
    /// Entry status.
    pub status: RunStatus,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Elapsed milliseconds (0 for `started`).
    pub duration: u64,
    /// Free-form details (counts, error message).
    #[serde(default)]
    pub details: serde_json::Value,
}

impl RunLogEntry {
    /// Creates an entry with a fresh id.
    #[must_use]
    pub fn new(
        function: impl Into<String>,
        status: RunStatus,
        timestamp: DateTime<Utc>,
        duration: u64,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            function: function.into(),
            status,
            timestamp,
            duration,
            details,
        }
    }
}

/// Value stored under `function-runs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLogDocument {
    /// Entries, most recent first.
    #[serde(default)]
    pub runs: Vec<RunLogEntry>,
}

/// Per-function aggregate over a run log window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionHealth {
    /// Function name.
    pub function: String,
    /// Terminal entries in the window.
    pub runs: usize,
    /// Entries with status `success`.
    pub successes: usize,
    /// Entries with status `error`.
    pub errors: usize,
    /// Status of the most recent entry (including `started`).
    pub last_status: RunStatus,
    /// Time of the most recent entry.
    pub last_run: DateTime<Utc>,
    /// Mean duration of terminal entries.
    pub average_duration_ms: u64,
}

// ── Collection metrics ───────────────────────────────────────────────────

/// One collection's volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    /// When the collection ran.
    pub timestamp: DateTime<Utc>,
    /// Candidate incidents collected.
    pub collected: usize,
    /// Incidents that were new.
    pub new_count: usize,
}

/// Value stored under `{source}-metrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsHistory {
    /// Samples, most recent first.
    #[serde(default)]
    pub samples: Vec<MetricsSample>,
}

// ── Runtime configuration ────────────────────────────────────────────────

/// Default data directory for the file store.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default per-invocation time budget.
pub const DEFAULT_INVOCATION_BUDGET_SECS: u64 = 60;

/// Which cache backend to open.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StoreKind {
    /// One JSON document per key under the data directory.
    #[default]
    File,
    /// Process-local map; nothing survives the invocation.
    Memory,
    /// `DuckDB` database file under the data directory.
    #[strum(serialize = "duckdb")]
    #[serde(rename = "duckdb")]
    DuckDb,
}

/// Errors reading runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable held an unparseable value.
    #[error("Invalid value for {name}: {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Runtime settings, read from `SEAWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Directory holding the file or `DuckDB` store.
    pub data_dir: PathBuf,
    /// Cache backend.
    pub store: StoreKind,
    /// Source ids to sync with `sync-all`; `None` means all.
    pub sources: Option<Vec<String>>,
    /// Per-attempt HTTP timeout.
    pub http_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay.
    pub retry_delay: Duration,
    /// Budget one invocation should fit in.
    pub invocation_budget: Duration,
    /// Base URL for remote reference tables.
    pub reference_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            store: StoreKind::default(),
            sources: None,
            http_timeout: Duration::from_secs(8),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            invocation_budget: Duration::from_secs(DEFAULT_INVOCATION_BUDGET_SECS),
            reference_url: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

impl SyncConfig {
    /// Reads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`. Unset and blank variables keep
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("SEAWATCH_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(store) = get("SEAWATCH_STORE") {
            config.store = parse_var("SEAWATCH_STORE", store)?;
        }
        if let Some(sources) = get("SEAWATCH_SOURCES") {
            config.sources = Some(
                sources
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        if let Some(secs) = get("SEAWATCH_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(parse_var("SEAWATCH_HTTP_TIMEOUT_SECS", secs)?);
        }
        if let Some(retries) = get("SEAWATCH_MAX_RETRIES") {
            config.max_retries = parse_var("SEAWATCH_MAX_RETRIES", retries)?;
        }
        if let Some(ms) = get("SEAWATCH_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(parse_var("SEAWATCH_RETRY_DELAY_MS", ms)?);
        }
        if let Some(secs) = get("SEAWATCH_INVOCATION_BUDGET_SECS") {
            config.invocation_budget =
                Duration::from_secs(parse_var("SEAWATCH_INVOCATION_BUDGET_SECS", secs)?);
        }
        config.reference_url = get("SEAWATCH_REFERENCE_URL");

        Ok(config)
    }
}
