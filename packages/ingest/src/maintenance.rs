//! Operator commands over stored state: summaries, clearing, rollback.

use seawatch_cache::{CacheStore, GuardOutcome, keys};
use seawatch_incident_models::Incident;
use seawatch_ingest_models::IncidentSet;
use serde::Serialize;

use crate::{INCIDENTS_FIELD, SyncError, diff::content_hash, write_incident_set};

/// What is stored for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    /// Source id.
    pub source: String,
    /// Stored incident count.
    pub count: usize,
    /// `sourceId` at the head of the set.
    pub newest: Option<String>,
    /// `sourceId` at the tail of the set.
    pub oldest: Option<String>,
    /// Current content hash.
    pub hash: Option<String>,
    /// When the set was last written.
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

fn element_id(value: Option<&serde_json::Value>) -> Option<String> {
    value?.get("sourceId")?.as_str().map(String::from)
}

/// Summarizes the stored set for `source` without decoding every incident.
pub async fn summarize_source(store: &CacheStore, source: &str) -> SourceSummary {
    let summary = store.summary(&keys::incidents(source), INCIDENTS_FIELD).await;
    let hash = store
        .get(&keys::hash(source))
        .await
        .and_then(|value| value.as_str().map(String::from));

    match summary {
        Some(summary) => SourceSummary {
            source: source.to_string(),
            count: summary.count,
            newest: element_id(summary.first.as_ref()),
            oldest: element_id(summary.last.as_ref()),
            hash,
            timestamp: Some(summary.timestamp),
        },
        None => SourceSummary {
            source: source.to_string(),
            count: 0,
            newest: None,
            oldest: None,
            hash,
            timestamp: None,
        },
    }
}

/// Deletes every key belonging to `source`.
///
/// # Errors
///
/// Returns [`SyncError::Cache`] if a delete fails.
pub async fn clear_source(store: &CacheStore, source: &str) -> Result<(), SyncError> {
    for key in keys::source_keys(source) {
        store.delete(&key).await?;
    }
    log::info!("Cleared stored state for {source}");
    Ok(())
}

/// Clears each source in `sources`.
///
/// # Errors
///
/// Stops at the first failed delete.
pub async fn clear_all(store: &CacheStore, sources: &[String]) -> Result<(), SyncError> {
    for source in sources {
        clear_source(store, source).await?;
    }
    Ok(())
}

/// Removes the newest `count` incidents for `source` and rewrites the hash
/// over what remains, so the next sync sees them as new. Returns the
/// removed incidents.
///
/// # Errors
///
/// Returns [`SyncError::NothingStored`] if the source has no stored set,
/// [`SyncError::Conflict`] if a sync wrote the set concurrently, or
/// [`SyncError::Cache`] if a write fails.
pub async fn rollback(
    store: &CacheStore,
    source: &str,
    count: usize,
) -> Result<Vec<Incident>, SyncError> {
    let Some(mut set) = store.get_as::<IncidentSet>(&keys::incidents(source)).await else {
        return Err(SyncError::NothingStored(source.to_string()));
    };
    let expected = set.hash.clone();

    let take = count.min(set.incidents.len());
    let removed: Vec<Incident> = set.incidents.drain(..take).collect();
    set.hash = content_hash(&set.incidents);
    set.timestamp = store.now();
    set.metadata.total_count = set.incidents.len();
    set.metadata.new_count = 0;

    match write_incident_set(store, source, &set, Some(&expected)).await? {
        GuardOutcome::Written => {
            log::info!(
                "Rolled back {} incident(s) for {source}; {} remain",
                removed.len(),
                set.incidents.len()
            );
            Ok(removed)
        }
        GuardOutcome::Conflict { .. } => Err(SyncError::Conflict {
            source_id: source.to_string(),
            attempts: 1,
        }),
    }
}
