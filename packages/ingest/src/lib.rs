#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Collection and change-detection pipeline for maritime incident sources.
//!
//! [`sync_source`] runs one source end to end: collect, standardize,
//! validate, hash, merge with the stored set, persist, and log. Every call
//! produces exactly one [`SyncReport`] and one terminal run log entry.

pub mod diff;
pub mod followup;
pub mod maintenance;
pub mod metrics;
pub mod run_log;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use seawatch_cache::{CacheError, CacheStore, GuardOutcome, WriteGuard, keys};
use seawatch_incident_models::Incident;
use seawatch_ingest_models::{
    IncidentSet, IncidentSetMetadata, RunLogEntry, RunStatus, SyncReport, SyncStatus,
};
use seawatch_source::{
    Fetcher, RetryOptions, SourceCollector, SourceError,
    collector::RawCollection,
    reference::ReferenceResolver,
    source_def::SourceDefinition,
    standardize::standardize,
    validate::{apply_policy, validate},
};
use seawatch_source_models::{Payload, SkippedRecord};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    diff::{content_hash, dedup_candidates, plan_merge},
    followup::{FollowUpJob, FollowUpQueue},
};

/// Guarded-write attempts before a sync gives up on a contended set.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Guarded-write attempts for documents every source updates
/// (`function-runs`, `last-processed-hashes`). Each lost attempt means
/// another writer committed, so this bounds the number of concurrent
/// invocations that always get through.
pub const SHARED_WRITE_ATTEMPTS: u32 = 16;

/// Field carrying the revision of a shared document.
const REVISION_FIELD: &str = "revision";

/// Field of the stored incident set that guarded writes compare.
const HASH_FIELD: &str = "hash";

/// Array field of the stored incident set.
pub const INCIDENTS_FIELD: &str = "incidents";

/// Errors that end a sync or maintenance operation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Collection failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A cache write failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// JSON encoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored set kept changing underneath the write.
    #[error("Incident set for {source_id} changed during {attempts} write attempts")]
    Conflict {
        /// Source id.
        source_id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A document every source updates kept changing underneath the write.
    #[error("{key} changed during {attempts} write attempts")]
    Contended {
        /// Cache key.
        key: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The stored incident set no longer decodes. It is left untouched.
    #[error("Stored incident set for {source_id} does not decode: {message}")]
    UndecodableSet {
        /// Source id.
        source_id: String,
        /// Decoder error.
        message: String,
    },

    /// No source with this id is registered.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// Nothing is stored for the source.
    #[error("No stored incidents for {0}")]
    NothingStored(String),
}

/// Shared services for a batch of syncs. Built once in `main`.
#[derive(Debug)]
pub struct SyncContext {
    /// Cache store holding all pipeline state.
    pub store: CacheStore,
    /// HTTP fetcher shared by all collectors.
    pub fetcher: Fetcher,
    /// Timeout and retry settings for source requests.
    pub retry: RetryOptions,
    /// Region and type lookups.
    pub resolver: ReferenceResolver,
    /// Post-collection handoff, if enabled.
    pub followups: Option<FollowUpQueue>,
    /// Time one invocation should fit in.
    pub invocation_budget: Duration,
}

impl SyncContext {
    /// A context without a follow-up queue, using the default budget.
    #[must_use]
    pub fn new(
        store: CacheStore,
        fetcher: Fetcher,
        retry: RetryOptions,
        resolver: ReferenceResolver,
    ) -> Self {
        Self {
            store,
            fetcher,
            retry,
            resolver,
            followups: None,
            invocation_budget: Duration::from_secs(
                seawatch_ingest_models::DEFAULT_INVOCATION_BUDGET_SECS,
            ),
        }
    }

    /// Attaches a follow-up queue.
    #[must_use]
    pub fn with_followups(mut self, queue: FollowUpQueue) -> Self {
        self.followups = Some(queue);
        self
    }

    /// Sets the invocation budget.
    #[must_use]
    pub const fn with_invocation_budget(mut self, budget: Duration) -> Self {
        self.invocation_budget = budget;
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Re-process the cached raw payload instead of fetching.
    pub cached: bool,
}

/// Value stored under `{source}-payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPayloads {
    payloads: Vec<Payload>,
}

/// Returns all configured sources from the TOML registry.
#[must_use]
pub fn all_sources() -> Vec<SourceDefinition> {
    seawatch_source::registry::all_sources()
}

/// Returns the sources to sync, filtered by `filter` (CLI `--sources` or
/// `SEAWATCH_SOURCES`). `None` returns every source.
#[must_use]
pub fn enabled_sources(filter: Option<&[String]>) -> Vec<SourceDefinition> {
    let all = all_sources();
    let Some(ids) = filter else {
        return all;
    };

    let filtered: Vec<SourceDefinition> = all
        .into_iter()
        .filter(|s| ids.iter().any(|id| *id == s.id))
        .collect();

    if filtered.is_empty() {
        log::warn!(
            "No matching sources found for filter {:?}. Available: {}",
            ids,
            all_sources()
                .iter()
                .map(|s| s.id.clone())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    filtered
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Candidates built from one collection.
#[derive(Debug, Default)]
struct Candidates {
    incidents: Vec<Incident>,
    skipped: Vec<SkippedRecord>,
    invalid: usize,
}

/// Maps, enriches, standardizes, validates, and applies the source's
/// validation policy to every raw record.
fn build_candidates(
    collector: &dyn SourceCollector,
    raw: RawCollection,
    resolver: &ReferenceResolver,
    now: DateTime<Utc>,
) -> Candidates {
    let info = collector.info();
    let mut skipped = raw.skipped;
    let mut validated = Vec::with_capacity(raw.records.len());
    // Row index of each entry in `validated`.
    let mut validated_rows = Vec::with_capacity(raw.records.len());

    for (i, record) in raw.records.iter().enumerate() {
        let row = raw.positions.get(i).copied().unwrap_or(i);
        match collector.map_record(record) {
            Ok(mut partial) => {
                collector.enrich(&mut partial, resolver);
                let incident = standardize(&partial, info, now);
                validated.push(validate(incident, &info.name, now));
                validated_rows.push(row);
            }
            Err(reason) => {
                log::debug!("[{}] skipping row {row}: {reason}", info.id);
                skipped.push(SkippedRecord::new(row, None, reason));
            }
        }
    }

    let outcome = apply_policy(validated, collector.validation_policy(), 0);
    for mut dropped in outcome.dropped {
        dropped.index = validated_rows
            .get(dropped.index)
            .copied()
            .unwrap_or(dropped.index);
        log::info!(
            "[{}] dropped invalid incident {} (row {}): {}",
            info.id,
            dropped.source_id.as_deref().unwrap_or("?"),
            dropped.index,
            dropped.reason
        );
        skipped.push(dropped);
    }
    skipped.sort_by_key(|record| record.index);

    Candidates {
        incidents: outcome.kept,
        skipped,
        invalid: outcome.invalid_kept,
    }
}

async fn collect_raw(
    ctx: &SyncContext,
    collector: &dyn SourceCollector,
    options: SyncOptions,
    now: DateTime<Utc>,
) -> Result<RawCollection, SyncError> {
    let id = &collector.info().id;
    let payload_key = keys::payload(id);

    if options.cached {
        if let Some(cached) = ctx.store.get_as::<CachedPayloads>(&payload_key).await {
            log::info!("[{id}] replaying {} cached page(s)", cached.payloads.len());
            return Ok(collector.replay(cached.payloads)?);
        }
        log::warn!("[{id}] no fresh cached payload, fetching live");
    }

    let raw = collector.collect(&ctx.fetcher, &ctx.retry, now).await?;
    let cached = CachedPayloads {
        payloads: raw.payloads.clone(),
    };
    if let Err(e) = ctx.store.store_as(&payload_key, &cached).await {
        log::warn!("[{id}] failed to cache raw payload: {e}");
    }
    Ok(raw)
}

async fn stored_count(store: &CacheStore, source: &str) -> usize {
    store
        .summary(&keys::incidents(source), INCIDENTS_FIELD)
        .await
        .map_or(0, |summary| summary.count)
}

/// Reads the stored set for a merge: the guard value plus the incidents.
///
/// # Errors
///
/// Returns [`SyncError::UndecodableSet`] if a set is stored but no longer
/// decodes; it must not be replaced by a merge that cannot see it.
async fn read_stored(
    store: &CacheStore,
    source: &str,
) -> Result<(Option<String>, Vec<Incident>), SyncError> {
    let Some(value) = store.get(&keys::incidents(source)).await else {
        return Ok((None, Vec::new()));
    };
    let expected = value
        .get(HASH_FIELD)
        .and_then(serde_json::Value::as_str)
        .map(String::from);
    let set: IncidentSet =
        serde_json::from_value(value).map_err(|e| SyncError::UndecodableSet {
            source_id: source.to_string(),
            message: e.to_string(),
        })?;
    Ok((expected, set.incidents))
}

/// The hash the stored set was written with. The set's own `hash` field is
/// authoritative; `{source}-hash` only mirrors it.
async fn stored_hash(store: &CacheStore, source: &str) -> Option<String> {
    store
        .get(&keys::incidents(source))
        .await?
        .get(HASH_FIELD)?
        .as_str()
        .map(String::from)
}

/// Rewrites `{source}-hash` when it disagrees with the stored set.
async fn repair_hash_mirror(store: &CacheStore, source: &str, hash: &str) {
    let key = keys::hash(source);
    let mirror = store.get(&key).await;
    if mirror.as_ref().and_then(serde_json::Value::as_str) == Some(hash) {
        return;
    }
    log::warn!("[{source}] {key} is out of step with the stored set, rewriting it");
    if let Err(e) = store
        .store(&key, serde_json::Value::String(hash.to_string()))
        .await
    {
        log::warn!("[{source}] failed to rewrite {key}: {e}");
    }
}

/// Writes `set` under `{source}-incidents` if its hash is still `expected`,
/// then mirrors the hash under `{source}-hash`.
///
/// The set carries its own hash, so a failed mirror write leaves the store
/// consistent: it is reported, and the next run reads the hash from the set
/// and repairs the mirror.
///
/// # Errors
///
/// Returns [`SyncError::Cache`] if either write fails.
pub async fn write_incident_set(
    store: &CacheStore,
    source: &str,
    set: &IncidentSet,
    expected: Option<&str>,
) -> Result<GuardOutcome, SyncError> {
    let guard = WriteGuard::new(HASH_FIELD, expected);
    let outcome = store
        .store_guarded(&keys::incidents(source), serde_json::to_value(set)?, &guard)
        .await?;
    if outcome == GuardOutcome::Written {
        store
            .store(&keys::hash(source), serde_json::Value::String(set.hash.clone()))
            .await?;
    }
    Ok(outcome)
}

/// Read-modify-write of a document every source updates, guarded on its
/// `revision` field so concurrent invocations never overwrite each other.
/// A document that no longer decodes is started over.
///
/// # Errors
///
/// Returns [`SyncError::Contended`] after [`SHARED_WRITE_ATTEMPTS`] lost
/// races, or [`SyncError::Cache`] if a write fails.
pub(crate) async fn update_shared<T, F>(
    store: &CacheStore,
    key: &str,
    mut apply: F,
) -> Result<(), SyncError>
where
    T: Default + Serialize + DeserializeOwned,
    F: FnMut(&mut T),
{
    for attempt in 1..=SHARED_WRITE_ATTEMPTS {
        let current = store.get(key).await;
        let expected = current
            .as_ref()
            .and_then(|value| value.get(REVISION_FIELD))
            .and_then(serde_json::Value::as_str)
            .map(String::from);
        let mut doc: T = match current {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                log::warn!("{key} does not decode, starting it over: {e}");
                T::default()
            }),
            None => T::default(),
        };
        apply(&mut doc);

        let mut value = serde_json::to_value(&doc)?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                REVISION_FIELD.to_string(),
                serde_json::Value::String(Uuid::new_v4().to_string()),
            );
        }
        let guard = WriteGuard::new(REVISION_FIELD, expected.as_deref());
        match store.store_guarded(key, value, &guard).await? {
            GuardOutcome::Written => return Ok(()),
            GuardOutcome::Conflict { .. } => {
                log::debug!("{key} changed concurrently (attempt {attempt}/{SHARED_WRITE_ATTEMPTS})");
            }
        }
    }
    Err(SyncError::Contended {
        key: key.to_string(),
        attempts: SHARED_WRITE_ATTEMPTS,
    })
}

async fn run_sync(
    ctx: &SyncContext,
    collector: &dyn SourceCollector,
    options: SyncOptions,
    start: Instant,
) -> Result<SyncReport, SyncError> {
    let info = collector.info();
    let id = info.id.as_str();
    let now = ctx.store.now();

    let budget = ctx.retry.worst_case_budget();
    if budget > ctx.invocation_budget {
        log::warn!(
            "[{id}] worst-case fetch time {budget:?} exceeds the invocation budget {:?}",
            ctx.invocation_budget
        );
    }

    let raw = collect_raw(ctx, collector, options, now).await?;
    let built = build_candidates(collector, raw, &ctx.resolver, now);
    let (candidates, duplicates) = dedup_candidates(built.incidents);
    if duplicates > 0 {
        log::info!("[{id}] ignored {duplicates} repeated sourceId(s) in the collection");
    }
    let skipped = built.skipped.len();

    if candidates.is_empty() {
        log::info!("[{id}] no incidents collected; stored set left untouched");
        return Ok(SyncReport {
            status: SyncStatus::NoData,
            message: "source returned no usable incidents".to_string(),
            source: id.to_string(),
            total: stored_count(&ctx.store, id).await,
            new: 0,
            skipped,
            invalid: 0,
            hash: None,
            anomaly: false,
            duration_ms: elapsed_ms(start),
        });
    }

    let new_hash = content_hash(&candidates);
    let cached_hash = stored_hash(&ctx.store, id).await;

    if cached_hash.as_deref() == Some(new_hash.as_str()) {
        log::info!("[{id}] content unchanged ({} incidents)", candidates.len());
        repair_hash_mirror(&ctx.store, id, &new_hash).await;
        let anomaly = metrics::record(&ctx.store, id, candidates.len(), 0, now).await;
        return Ok(SyncReport {
            status: SyncStatus::NoChange,
            message: "no new incidents".to_string(),
            source: id.to_string(),
            total: stored_count(&ctx.store, id).await,
            new: 0,
            skipped,
            invalid: built.invalid,
            hash: Some(new_hash),
            anomaly,
            duration_ms: elapsed_ms(start),
        });
    }

    let collected = candidates.len();
    let mut written = None;
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let (expected, existing) = read_stored(&ctx.store, id).await?;
        let plan = plan_merge(candidates.clone(), existing, |incident| {
            collector.ordering_key(incident)
        });
        let set = IncidentSet {
            metadata: IncidentSetMetadata {
                source: id.to_string(),
                total_count: plan.merged.len(),
                new_count: plan.new_count(),
                skipped_count: skipped,
                invalid_count: built.invalid,
            },
            incidents: plan.merged,
            hash: new_hash.clone(),
            timestamp: now,
        };

        match write_incident_set(&ctx.store, id, &set, expected.as_deref()).await? {
            GuardOutcome::Written => {
                written = Some((set.metadata.total_count, plan.new_ids));
                break;
            }
            GuardOutcome::Conflict { .. } => {
                log::warn!("[{id}] stored set changed during merge (attempt {attempt}/{MAX_WRITE_ATTEMPTS}), re-merging");
            }
        }
    }
    let Some((total, new_ids)) = written else {
        return Err(SyncError::Conflict {
            source_id: id.to_string(),
            attempts: MAX_WRITE_ATTEMPTS,
        });
    };

    let new_count = new_ids.len();
    let anomaly = metrics::record(&ctx.store, id, collected, new_count, now).await;

    if new_count > 0
        && let Some(queue) = &ctx.followups
        && let Err(e) = queue.enqueue(FollowUpJob {
            source: id.to_string(),
            hash: new_hash.clone(),
            new_source_ids: new_ids,
        })
    {
        log::warn!("[{id}] could not queue follow-up: {e}");
    }

    log::info!("[{id}] stored {total} incidents ({new_count} new, {skipped} skipped)");
    Ok(SyncReport {
        status: SyncStatus::Success,
        message: format!("{new_count} new incident(s)"),
        source: id.to_string(),
        total,
        new: new_count,
        skipped,
        invalid: built.invalid,
        hash: Some(new_hash),
        anomaly,
        duration_ms: elapsed_ms(start),
    })
}

/// Runs one source invocation and reports its outcome.
///
/// Never fails: errors become an `error` report. A `started` entry and
/// exactly one terminal entry are written to the run log.
pub async fn sync_source(
    ctx: &SyncContext,
    collector: &dyn SourceCollector,
    options: SyncOptions,
) -> SyncReport {
    let start = Instant::now();
    let id = collector.info().id.clone();
    let function = format!("sync:{id}");
    log::info!("Syncing source: {} ({id})", collector.info().display_name);

    let started = RunLogEntry::new(
        &function,
        RunStatus::Started,
        ctx.store.now(),
        0,
        serde_json::json!({ "cached": options.cached }),
    );
    if let Err(e) = run_log::append(&ctx.store, started).await {
        log::warn!("[{id}] could not record run start: {e}");
    }

    let report = match run_sync(ctx, collector, options, start).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("[{id}] sync failed: {e}");
            SyncReport::error(&id, e.to_string(), elapsed_ms(start))
        }
    };

    let details = serde_json::to_value(&report).unwrap_or_default();
    let terminal = RunLogEntry::new(
        &function,
        report.status.run_status(),
        ctx.store.now(),
        report.duration_ms,
        details,
    );
    if let Err(e) = run_log::append(&ctx.store, terminal).await {
        log::warn!("[{id}] could not record run outcome: {e}");
    }

    report
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use seawatch_cache::{CacheBackend, CacheRecord, ManualClock, memory::MemoryBackend};
    use seawatch_incident_models::ValidationStatus;
    use seawatch_source::{registry::find_source, source_def::CollectorConfig};
    use seawatch_source_models::ValidationPolicy;
    use serde_json::{Value, json};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_710_000_000, 0).unwrap()
    }

    fn quick_retry() -> RetryOptions {
        RetryOptions {
            timeout: Duration::from_secs(2),
            max_retries: 0,
            retry_delay: Duration::from_millis(10),
        }
    }

    fn context(backend: Arc<dyn CacheBackend>) -> (SyncContext, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = CacheStore::with_clock(backend, clock.clone());
        let ctx = SyncContext::new(
            store,
            Fetcher::new().unwrap(),
            quick_retry(),
            ReferenceResolver::builtin(),
        );
        (ctx, clock)
    }

    fn recaap_collector(server: &MockServer, policy: ValidationPolicy) -> Box<dyn SourceCollector> {
        let mut def = find_source("recaap").unwrap();
        def.collector = CollectorConfig::Recaap {
            api_url: format!("{}/api/incidents/search", server.uri()),
            page_size: 50,
        };
        def.validation_policy = policy;
        def.into_collector()
    }

    fn recaap_record(number: u32) -> Value {
        json!({
            "incidentNo": format!("IC-2024-{number:04}"),
            "incidentDate": format!("2024-01-{:02} 10:00", 10 + number),
            "incidentType": "Armed Robbery",
            "classification": "CAT 4",
            "narrative": "Perpetrators boarded the vessel and escaped with stores.",
            "latDeg": 1, "latMin": 15, "latSec": 0, "latDir": "N",
            "longDeg": 103, "longMin": 48, "longSec": 0, "longDir": "E",
            "vesselName": format!("VESSEL {number}"),
            "vesselType": "Bulk Carrier",
            "imoNo": ""
        })
    }

    async fn serve_records(server: &MockServer, records: Vec<Value>) {
        server.reset().await;
        Mock::given(method("POST"))
            .and(path("/api/incidents/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"incidents": records, "totalPages": 1}
            })))
            .mount(server)
            .await;
    }

    async fn stored_set(store: &CacheStore, source: &str) -> IncidentSet {
        store.get_as(&keys::incidents(source)).await.unwrap()
    }

    fn ids(set: &IncidentSet) -> Vec<&str> {
        set.incidents.iter().map(|i| i.source_id.as_str()).collect()
    }

    #[tokio::test]
    async fn new_records_are_merged_newest_first() {
        let server = MockServer::start().await;
        let (ctx, clock) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::default());

        serve_records(&server, vec![recaap_record(1), recaap_record(2)]).await;
        let first = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(first.status, SyncStatus::Success, "{}", first.message);
        assert_eq!((first.new, first.total), (2, 2));
        let h1 = first.hash.clone().unwrap();

        clock.advance(chrono::Duration::days(1));
        serve_records(&server, vec![recaap_record(1), recaap_record(2), recaap_record(3)]).await;
        let second = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(second.status, SyncStatus::Success);
        assert_eq!((second.new, second.total), (1, 3));
        let h2 = second.hash.clone().unwrap();
        assert_ne!(h1, h2);

        let set = stored_set(&ctx.store, "recaap").await;
        assert_eq!(
            ids(&set),
            vec!["RECAAP-IC-2024-0003", "RECAAP-IC-2024-0002", "RECAAP-IC-2024-0001"]
        );
        assert_eq!(set.hash, h2);
        assert_eq!(set.metadata.total_count, 3);
        assert_eq!(set.metadata.new_count, 1);
        assert_eq!(
            ctx.store.get(&keys::hash("recaap")).await,
            Some(Value::String(h2))
        );
    }

    #[tokio::test]
    async fn identical_rerun_is_a_no_op() {
        let server = MockServer::start().await;
        let (ctx, clock) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1), recaap_record(2)]).await;

        let first = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        let before = ctx.store.get_record(&keys::incidents("recaap")).await.unwrap();

        clock.advance(chrono::Duration::hours(6));
        let second = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(second.status, SyncStatus::NoChange);
        assert_eq!(second.hash, first.hash);
        assert_eq!((second.new, second.total), (0, 2));

        let after = ctx.store.get_record(&keys::incidents("recaap")).await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn empty_collection_leaves_the_set_alone() {
        let server = MockServer::start().await;
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::default());

        serve_records(&server, vec![recaap_record(1)]).await;
        sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        let before = ctx.store.get_record(&keys::incidents("recaap")).await;

        serve_records(&server, vec![]).await;
        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::NoData);
        assert_eq!(report.total, 1);
        assert_eq!(ctx.store.get_record(&keys::incidents("recaap")).await, before);
    }

    #[tokio::test]
    async fn invalid_incidents_are_retained_with_warnings() {
        let server = MockServer::start().await;
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::RetainWithWarnings);

        let mut broken = recaap_record(2);
        broken.as_object_mut().unwrap().remove("narrative");
        serve_records(&server, vec![recaap_record(1), broken]).await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!((report.total, report.invalid), (2, 1));

        let set = stored_set(&ctx.store, "recaap").await;
        let stored = set
            .incidents
            .iter()
            .find(|i| i.source_id == "RECAAP-IC-2024-0002")
            .unwrap();
        assert_eq!(stored.metadata.validation_status, ValidationStatus::Invalid);
        assert!(
            stored
                .metadata
                .validation_errors
                .iter()
                .any(|e| e.contains("description"))
        );
    }

    #[tokio::test]
    async fn drop_policy_moves_invalid_incidents_to_skipped() {
        let server = MockServer::start().await;
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::DropInvalid);

        let mut broken = recaap_record(2);
        broken["narrative"] = json!("");
        let mut unnumbered = recaap_record(3);
        unnumbered["incidentNo"] = Value::Null;
        serve_records(&server, vec![recaap_record(1), broken, unnumbered]).await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!((report.total, report.skipped, report.invalid), (1, 2, 0));
    }

    #[tokio::test]
    async fn failures_are_reported_and_logged() {
        let server = MockServer::start().await;
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::default());
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.message.contains("502"), "{}", report.message);
        assert!(ctx.store.get(&keys::incidents("recaap")).await.is_none());

        let entries = run_log::entries(&ctx.store, start() - chrono::Duration::hours(1)).await;
        let statuses: Vec<RunStatus> = entries.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![RunStatus::Error, RunStatus::Started]);
        assert!(entries.iter().all(|e| e.function == "sync:recaap"));
    }

    #[tokio::test]
    async fn cache_write_failure_is_fatal() {
        let server = MockServer::start().await;
        let backend = Arc::new(MemoryBackend::new());
        let (ctx, _) = context(backend.clone());
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1)]).await;

        backend.set_fail_writes(true);
        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Error);
    }

    #[tokio::test]
    async fn cached_run_replays_without_fetching() {
        let server = MockServer::start().await;
        let (ctx, clock) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1)]).await;
        sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;

        server.reset().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        clock.advance(chrono::Duration::minutes(10));
        let report = sync_source(&ctx, collector.as_ref(), SyncOptions { cached: true }).await;
        assert_eq!(report.status, SyncStatus::NoChange);
    }

    #[tokio::test]
    async fn followup_job_is_queued_for_new_incidents() {
        let server = MockServer::start().await;
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let store = ctx.store.clone();
        let queue = FollowUpQueue::spawn(Arc::new(followup::LogHandler), store.clone());
        let ctx = ctx.with_followups(queue);
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1)]).await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        let stats = ctx.followups.unwrap().shutdown().await;
        assert_eq!(stats.processed, 1);
        assert_eq!(
            followup::last_processed_hash(&store, "recaap").await,
            report.hash
        );
    }

    /// Lets a competing writer slip in before the first `remaining` guarded
    /// writes to an incident set.
    struct RacingBackend {
        inner: MemoryBackend,
        remaining: tokio::sync::Mutex<u32>,
        competitor: Value,
    }

    #[async_trait]
    impl CacheBackend for RacingBackend {
        async fn read(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
            self.inner.read(key).await
        }

        async fn write(&self, record: CacheRecord) -> Result<(), CacheError> {
            self.inner.write(record).await
        }

        async fn write_guarded(
            &self,
            record: CacheRecord,
            guard: &WriteGuard,
        ) -> Result<GuardOutcome, CacheError> {
            {
                let mut remaining = self.remaining.lock().await;
                if *remaining > 0 && record.key.ends_with("-incidents") {
                    *remaining -= 1;
                    let mut value = self.competitor.clone();
                    value[HASH_FIELD] = json!(format!("rival-{remaining}"));
                    self.inner
                        .write(CacheRecord {
                            key: record.key.clone(),
                            value,
                            timestamp: record.timestamp,
                        })
                        .await?;
                }
            }
            self.inner.write_guarded(record, guard).await
        }

        async fn remove(&self, key: &str) -> Result<(), CacheError> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            self.inner.keys().await
        }
    }

    async fn competing_set(server: &MockServer) -> Value {
        // A set another invocation stored, holding an incident this run
        // never collects.
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(server, ValidationPolicy::default());
        serve_records(server, vec![recaap_record(9)]).await;
        sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        ctx.store.get(&keys::incidents("recaap")).await.unwrap()
    }

    #[tokio::test]
    async fn concurrent_writer_is_merged_not_overwritten() {
        let server = MockServer::start().await;
        let competitor = competing_set(&server).await;
        let backend = Arc::new(RacingBackend {
            inner: MemoryBackend::new(),
            remaining: tokio::sync::Mutex::new(1),
            competitor,
        });
        let (ctx, _) = context(backend);
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1)]).await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Success, "{}", report.message);
        let set = stored_set(&ctx.store, "recaap").await;
        assert_eq!(ids(&set), vec!["RECAAP-IC-2024-0009", "RECAAP-IC-2024-0001"]);
    }

    #[tokio::test]
    async fn persistent_contention_gives_up() {
        let server = MockServer::start().await;
        let competitor = competing_set(&server).await;
        let backend = Arc::new(RacingBackend {
            inner: MemoryBackend::new(),
            remaining: tokio::sync::Mutex::new(u32::MAX),
            competitor,
        });
        let (ctx, _) = context(backend);
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1)]).await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.message.contains("3 write attempts"), "{}", report.message);
    }

    /// Fails plain writes to `{source}-hash` keys while `failing` is set.
    struct MirrorFailingBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    #[async_trait]
    impl CacheBackend for MirrorFailingBackend {
        async fn read(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
            self.inner.read(key).await
        }

        async fn write(&self, record: CacheRecord) -> Result<(), CacheError> {
            if self.failing.load(Ordering::SeqCst) && record.key.ends_with("-hash") {
                return Err(CacheError::Unavailable {
                    message: "hash mirror offline".to_string(),
                });
            }
            self.inner.write(record).await
        }

        async fn write_guarded(
            &self,
            record: CacheRecord,
            guard: &WriteGuard,
        ) -> Result<GuardOutcome, CacheError> {
            self.inner.write_guarded(record, guard).await
        }

        async fn remove(&self, key: &str) -> Result<(), CacheError> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn failed_hash_mirror_is_reported_and_repaired() {
        let server = MockServer::start().await;
        let backend = Arc::new(MirrorFailingBackend {
            inner: MemoryBackend::new(),
            failing: AtomicBool::new(true),
        });
        let (ctx, clock) = context(backend.clone());
        let collector = recaap_collector(&server, ValidationPolicy::default());
        serve_records(&server, vec![recaap_record(1), recaap_record(2)]).await;

        let first = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(first.status, SyncStatus::Error);
        let hash = stored_set(&ctx.store, "recaap").await.hash;
        assert_eq!(ctx.store.get(&keys::hash("recaap")).await, None);

        backend.failing.store(false, Ordering::SeqCst);
        clock.advance(chrono::Duration::hours(1));
        let second = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(second.status, SyncStatus::NoChange, "{}", second.message);
        assert_eq!(second.hash.as_deref(), Some(hash.as_str()));
        assert_eq!(
            ctx.store.get(&keys::hash("recaap")).await,
            Some(Value::String(hash))
        );
    }

    #[tokio::test]
    async fn undecodable_set_is_not_replaced() {
        let server = MockServer::start().await;
        let (ctx, _) = context(Arc::new(MemoryBackend::new()));
        let collector = recaap_collector(&server, ValidationPolicy::default());
        ctx.store
            .store(
                &keys::incidents("recaap"),
                json!({"hash": "legacy", "incidents": "not a list"}),
            )
            .await
            .unwrap();
        serve_records(&server, vec![recaap_record(1)]).await;

        let report = sync_source(&ctx, collector.as_ref(), SyncOptions::default()).await;
        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.message.contains("does not decode"), "{}", report.message);

        let stored = ctx.store.get(&keys::incidents("recaap")).await.unwrap();
        assert_eq!(stored["incidents"], json!("not a list"));
        assert_eq!(stored["hash"], json!("legacy"));
    }

    #[tokio::test]
    async fn skipped_rows_share_one_index() {
        let server = MockServer::start().await;
        let collector = recaap_collector(&server, ValidationPolicy::DropInvalid);
        let mut broken = recaap_record(2);
        broken["narrative"] = json!("");
        let mut unnumbered = recaap_record(3);
        unnumbered["incidentNo"] = Value::Null;
        // Row 0 fails extraction, row 1 fails validation, row 3 fails
        // mapping or validation.
        let page = Payload::Json(json!({
            "data": {
                "incidents": ["x", broken, recaap_record(1), unnumbered],
                "totalPages": 1
            }
        }));
        let raw = collector.replay(vec![page]).unwrap();

        let resolver = ReferenceResolver::builtin();
        let built = build_candidates(collector.as_ref(), raw, &resolver, start());
        let rows: Vec<usize> = built.skipped.iter().map(|s| s.index).collect();
        assert_eq!(rows, vec![0, 1, 3]);
        assert_eq!(built.incidents.len(), 1);
        assert_eq!(built.incidents[0].source_id, "RECAAP-IC-2024-0001");
    }

    #[test]
    fn source_filter() {
        let filter = vec!["imb".to_string(), "nope".to_string()];
        let picked = enabled_sources(Some(&filter));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "imb");
        assert_eq!(enabled_sources(None).len(), 4);
        assert!(enabled_sources(Some(&["nope".to_string()][..])).is_empty());
    }
}
