//! Run log: a capped, most-recent-first list of invocation entries stored
//! under `function-runs`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use seawatch_cache::{CacheStore, keys};
use seawatch_ingest_models::{FunctionHealth, RunLogDocument, RunLogEntry, RunStatus};

use crate::{SyncError, update_shared};

/// Maximum number of retained entries.
pub const MAX_RUN_LOG_ENTRIES: usize = 100;

/// Prepends `entry`, dropping the oldest entries beyond the cap. Every
/// source appends to the same log, so the write is guarded and retried.
///
/// # Errors
///
/// Returns [`SyncError`] if the log cannot be written or stays contended.
pub async fn append(store: &CacheStore, entry: RunLogEntry) -> Result<(), SyncError> {
    log::debug!("Run log: {} {}", entry.function, entry.status);
    update_shared(store, keys::FUNCTION_RUNS, |doc: &mut RunLogDocument| {
        doc.runs.insert(0, entry.clone());
        doc.runs.truncate(MAX_RUN_LOG_ENTRIES);
    })
    .await
}

/// Entries recorded at or after `since`, most recent first.
pub async fn entries(store: &CacheStore, since: DateTime<Utc>) -> Vec<RunLogEntry> {
    let doc: RunLogDocument = store.get_as(keys::FUNCTION_RUNS).await.unwrap_or_default();
    doc.runs
        .into_iter()
        .filter(|entry| entry.timestamp >= since)
        .collect()
}

/// Aggregates `entries` per function. Only terminal entries count as runs.
#[must_use]
pub fn summarize(entries: &[RunLogEntry]) -> Vec<FunctionHealth> {
    let mut grouped: BTreeMap<&str, Vec<&RunLogEntry>> = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.function.as_str()).or_default().push(entry);
    }

    grouped
        .into_iter()
        .filter_map(|(function, entries)| {
            let latest = entries.iter().max_by_key(|entry| entry.timestamp)?;
            let terminal: Vec<&&RunLogEntry> = entries
                .iter()
                .filter(|entry| entry.status != RunStatus::Started)
                .collect();
            let total_duration: u64 = terminal.iter().map(|entry| entry.duration).sum();
            let runs = terminal.len();
            Some(FunctionHealth {
                function: function.to_string(),
                runs,
                successes: terminal
                    .iter()
                    .filter(|entry| entry.status == RunStatus::Success)
                    .count(),
                errors: terminal
                    .iter()
                    .filter(|entry| entry.status == RunStatus::Error)
                    .count(),
                last_status: latest.status,
                last_run: latest.timestamp,
                average_duration_ms: if runs == 0 {
                    0
                } else {
                    total_duration / runs as u64
                },
            })
        })
        .collect()
}

/// Per-function health over entries since `since`.
pub async fn health(store: &CacheStore, since: DateTime<Utc>) -> Vec<FunctionHealth> {
    summarize(&entries(store, since).await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use seawatch_cache::{ManualClock, file::FileBackend, memory::MemoryBackend};

    use super::*;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_710_000_000, 0).unwrap()
    }

    fn store() -> (CacheStore, Arc<ManualClock>, Arc<MemoryBackend>) {
        let clock = Arc::new(ManualClock::new(start()));
        let backend = Arc::new(MemoryBackend::new());
        (
            CacheStore::with_clock(backend.clone(), clock.clone()),
            clock,
            backend,
        )
    }

    fn entry(function: &str, status: RunStatus, at: DateTime<Utc>, duration: u64) -> RunLogEntry {
        RunLogEntry::new(function, status, at, duration, serde_json::json!({}))
    }

    #[tokio::test]
    async fn keeps_most_recent_hundred() {
        let (store, _, _) = store();
        for i in 0..105 {
            append(
                &store,
                entry(&format!("sync:{i}"), RunStatus::Success, start(), 1),
            )
            .await
            .unwrap();
        }
        let all = entries(&store, start() - Duration::days(1)).await;
        assert_eq!(all.len(), MAX_RUN_LOG_ENTRIES);
        assert_eq!(all[0].function, "sync:104");
        assert_eq!(all[99].function, "sync:5");
    }

    #[tokio::test]
    async fn entries_filter_by_window() {
        let (store, _, _) = store();
        append(&store, entry("sync:imb", RunStatus::Success, start() - Duration::hours(30), 5))
            .await
            .unwrap();
        append(&store, entry("sync:imb", RunStatus::Error, start() - Duration::hours(2), 7))
            .await
            .unwrap();

        let recent = entries(&store, start() - Duration::hours(24)).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn failed_append_is_an_error() {
        let (store, _, backend) = store();
        backend.set_fail_writes(true);
        assert!(
            append(&store, entry("sync:imb", RunStatus::Started, start(), 0))
                .await
                .is_err()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(Arc::new(FileBackend::open(dir.path()).await.unwrap()));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    append(
                        &store,
                        entry(&format!("sync:{i}"), RunStatus::Success, start(), 1),
                    )
                    .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut functions: Vec<String> = entries(&store, start() - Duration::days(1))
            .await
            .into_iter()
            .map(|entry| entry.function)
            .collect();
        functions.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("sync:{i}")).collect();
        assert_eq!(functions, expected);
    }

    #[tokio::test]
    async fn each_append_rewrites_the_revision() {
        let (store, _, _) = store();
        append(&store, entry("sync:imb", RunStatus::Started, start(), 0))
            .await
            .unwrap();
        let revision = store.get(keys::FUNCTION_RUNS).await.unwrap()["revision"].clone();
        append(&store, entry("sync:imb", RunStatus::Success, start(), 4))
            .await
            .unwrap();

        let value = store.get(keys::FUNCTION_RUNS).await.unwrap();
        assert_ne!(value["revision"], revision);
        assert_eq!(entries(&store, start()).await.len(), 2);
    }

    #[test]
    fn health_groups_by_function() {
        let entries = vec![
            entry("sync:ukmto", RunStatus::Started, start(), 0),
            entry("sync:ukmto", RunStatus::Error, start() - Duration::minutes(1), 300),
            entry("sync:recaap", RunStatus::Success, start() - Duration::minutes(5), 1200),
            entry("sync:ukmto", RunStatus::Success, start() - Duration::hours(1), 100),
        ];
        let health = summarize(&entries);

        assert_eq!(health.len(), 2);
        assert_eq!(health[0].function, "sync:recaap");
        assert_eq!(health[0].runs, 1);
        assert_eq!(health[0].average_duration_ms, 1200);

        let ukmto = &health[1];
        assert_eq!(ukmto.runs, 2);
        assert_eq!(ukmto.successes, 1);
        assert_eq!(ukmto.errors, 1);
        assert_eq!(ukmto.last_status, RunStatus::Started);
        assert_eq!(ukmto.last_run, start());
        assert_eq!(ukmto.average_duration_ms, 200);
    }
}
