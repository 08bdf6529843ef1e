//! Post-collection handoff.
//!
//! A successful change enqueues a [`FollowUpJob`]; a single worker task
//! hands each job to a [`FollowUpHandler`] (downstream enrichment lives
//! outside this workspace). Handled jobs advance the source's entry in
//! `last-processed-hashes`; failed ones are written to the run log as
//! `followup:{source}` errors.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use seawatch_cache::{CacheStore, keys};
use seawatch_ingest_models::{RunLogEntry, RunStatus};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{SyncError, run_log, update_shared};

/// Jobs buffered before `enqueue` starts refusing.
pub const QUEUE_CAPACITY: usize = 64;

/// New data for downstream processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpJob {
    /// Source id.
    pub source: String,
    /// Content hash of the run that produced the job.
    pub hash: String,
    /// Incidents added by that run.
    pub new_source_ids: Vec<String>,
}

/// Errors from the follow-up queue or its handler.
#[derive(Debug, thiserror::Error)]
pub enum FollowUpError {
    /// The handler rejected the job.
    #[error("Follow-up handler failed: {0}")]
    Handler(String),

    /// The queue is full or its worker has stopped.
    #[error("Follow-up queue unavailable: {0}")]
    Unavailable(String),
}

/// Processes one job.
#[async_trait]
pub trait FollowUpHandler: Send + Sync {
    /// Handles `job`.
    ///
    /// # Errors
    ///
    /// Returns [`FollowUpError::Handler`] if processing failed; the job is
    /// not retried.
    async fn handle(&self, job: &FollowUpJob) -> Result<(), FollowUpError>;
}

/// Handler that only logs the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl FollowUpHandler for LogHandler {
    async fn handle(&self, job: &FollowUpJob) -> Result<(), FollowUpError> {
        log::info!(
            "{}: {} new incident(s) ready for downstream processing (hash {})",
            job.source,
            job.new_source_ids.len(),
            job.hash
        );
        Ok(())
    }
}

/// Worker totals returned by [`FollowUpQueue::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowUpStats {
    /// Jobs the handler accepted.
    pub processed: usize,
    /// Jobs the handler rejected.
    pub failed: usize,
}

/// Bounded job queue with one worker task.
#[derive(Debug)]
pub struct FollowUpQueue {
    tx: mpsc::Sender<FollowUpJob>,
    worker: JoinHandle<FollowUpStats>,
}

impl FollowUpQueue {
    /// Starts the worker. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(handler: Arc<dyn FollowUpHandler>, store: CacheStore) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(run_worker(rx, handler, store));
        Self { tx, worker }
    }

    /// Queues `job` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`FollowUpError::Unavailable`] if the queue is full or the
    /// worker has stopped.
    pub fn enqueue(&self, job: FollowUpJob) -> Result<(), FollowUpError> {
        self.tx
            .try_send(job)
            .map_err(|e| FollowUpError::Unavailable(e.to_string()))
    }

    /// Closes the queue, waits for queued jobs to drain, and returns the
    /// worker's totals.
    pub async fn shutdown(self) -> FollowUpStats {
        drop(self.tx);
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("Follow-up worker panicked: {e}");
                FollowUpStats::default()
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<FollowUpJob>,
    handler: Arc<dyn FollowUpHandler>,
    store: CacheStore,
) -> FollowUpStats {
    let mut stats = FollowUpStats::default();
    while let Some(job) = rx.recv().await {
        let start = Instant::now();
        match handler.handle(&job).await {
            Ok(()) => {
                stats.processed += 1;
                if let Err(e) = mark_processed(&store, &job.source, &job.hash).await {
                    log::warn!("{}: failed to record processed hash: {e}", job.source);
                }
            }
            Err(e) => {
                stats.failed += 1;
                log::error!("{}: follow-up failed: {e}", job.source);
                let entry = RunLogEntry::new(
                    format!("followup:{}", job.source),
                    RunStatus::Error,
                    store.now(),
                    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    serde_json::json!({ "hash": job.hash, "error": e.to_string() }),
                );
                if let Err(e) = run_log::append(&store, entry).await {
                    log::warn!("{}: failed to record follow-up failure: {e}", job.source);
                }
            }
        }
    }
    stats
}

/// Value stored under `last-processed-hashes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProcessedHashes {
    #[serde(default)]
    hashes: BTreeMap<String, String>,
}

async fn mark_processed(store: &CacheStore, source: &str, hash: &str) -> Result<(), SyncError> {
    update_shared(
        store,
        keys::LAST_PROCESSED_HASHES,
        |doc: &mut ProcessedHashes| {
            doc.hashes.insert(source.to_string(), hash.to_string());
        },
    )
    .await
}

/// The last hash for `source` that downstream processing accepted.
pub async fn last_processed_hash(store: &CacheStore, source: &str) -> Option<String> {
    store
        .get_as::<ProcessedHashes>(keys::LAST_PROCESSED_HASHES)
        .await?
        .hashes
        .remove(source)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;

    struct RejectSource(&'static str);

    #[async_trait]
    impl FollowUpHandler for RejectSource {
        async fn handle(&self, job: &FollowUpJob) -> Result<(), FollowUpError> {
            if job.source == self.0 {
                Err(FollowUpError::Handler("enrichment service down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn job(source: &str, hash: &str) -> FollowUpJob {
        FollowUpJob {
            source: source.to_string(),
            hash: hash.to_string(),
            new_source_ids: vec![format!("{}-1", source.to_uppercase())],
        }
    }

    #[tokio::test]
    async fn processed_jobs_advance_the_hash() {
        let store = CacheStore::in_memory();
        let queue = FollowUpQueue::spawn(Arc::new(LogHandler), store.clone());
        queue.enqueue(job("ukmto", "h1")).unwrap();
        queue.enqueue(job("ukmto", "h2")).unwrap();
        queue.enqueue(job("imb", "h3")).unwrap();

        let stats = queue.shutdown().await;
        assert_eq!(stats, FollowUpStats { processed: 3, failed: 0 });
        assert_eq!(last_processed_hash(&store, "ukmto").await.as_deref(), Some("h2"));
        assert_eq!(last_processed_hash(&store, "imb").await.as_deref(), Some("h3"));
        assert_eq!(last_processed_hash(&store, "marad").await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_marks_keep_every_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(Arc::new(
            seawatch_cache::file::FileBackend::open(dir.path())
                .await
                .unwrap(),
        ));
        let sources: Vec<String> = (0..8).map(|i| format!("source{i}")).collect();

        let tasks: Vec<_> = sources
            .iter()
            .map(|source| {
                let store = store.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    mark_processed(&store, &source, &format!("hash-{source}")).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for source in &sources {
            assert_eq!(
                last_processed_hash(&store, source).await,
                Some(format!("hash-{source}"))
            );
        }
    }

    #[tokio::test]
    async fn failures_go_to_the_run_log() {
        let store = CacheStore::in_memory();
        let queue = FollowUpQueue::spawn(Arc::new(RejectSource("recaap")), store.clone());
        queue.enqueue(job("recaap", "h1")).unwrap();

        let stats = queue.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(last_processed_hash(&store, "recaap").await, None);

        let since = store.now() - Duration::minutes(1);
        let entries = run_log::entries(&store, since).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].function, "followup:recaap");
        assert_eq!(entries[0].status, RunStatus::Error);
    }
}
