//! Content hashing and merge planning.
//!
//! The hash covers only the fields that describe the event itself, so
//! re-standardizing unchanged source data (new `standardizedAt` stamps,
//! reordered records) yields the same digest and the run is a no-op.

use std::{cmp::Reverse, collections::BTreeSet};

use seawatch_incident_models::Incident;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use seawatch_source::parsing::year_sequence_key;

/// The hashed projection of an incident.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashProjection<'a> {
    source_id: &'a str,
    title: &'a str,
    description: &'a str,
    date_occurred: &'a str,
    region: &'a str,
    category: &'a str,
}

impl<'a> From<&'a Incident> for HashProjection<'a> {
    fn from(incident: &'a Incident) -> Self {
        Self {
            source_id: &incident.source_id,
            title: &incident.title,
            description: &incident.description,
            date_occurred: &incident.date_occurred,
            region: &incident.location.region,
            category: &incident.category,
        }
    }
}

/// SHA-256 hex digest over the canonical JSON of the incidents'
/// projections, sorted by `sourceId`.
#[must_use]
pub fn content_hash(incidents: &[Incident]) -> String {
    let mut projection: Vec<HashProjection<'_>> = incidents.iter().map(HashProjection::from).collect();
    projection.sort_by(|a, b| a.source_id.cmp(b.source_id));
    // Serializing borrowed strings into a Vec cannot fail.
    let canonical = serde_json::to_vec(&projection).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Removes repeated `sourceId`s, keeping the first occurrence. Returns the
/// survivors and the number removed.
#[must_use]
pub fn dedup_candidates(candidates: Vec<Incident>) -> (Vec<Incident>, usize) {
    let before = candidates.len();
    let mut seen = BTreeSet::new();
    let unique: Vec<Incident> = candidates
        .into_iter()
        .filter(|incident| seen.insert(incident.source_id.clone()))
        .collect();
    let removed = before - unique.len();
    (unique, removed)
}

/// Result of merging a candidate set into the stored set.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// New and existing incidents, sorted newest first.
    pub merged: Vec<Incident>,
    /// `sourceId`s of candidates that were not stored before.
    pub new_ids: Vec<String>,
    /// Candidates discarded as duplicates (within the candidate set or of
    /// a stored incident).
    pub duplicate_count: usize,
}

impl MergePlan {
    /// Number of incidents added.
    #[must_use]
    pub fn new_count(&self) -> usize {
        self.new_ids.len()
    }
}

/// Sorts descending by `ordering_key`, ties broken by `sourceId`
/// descending. Stable.
pub fn sort_newest_first(incidents: &mut [Incident], ordering_key: impl Fn(&Incident) -> i64) {
    incidents.sort_by_cached_key(|incident| {
        (
            Reverse(ordering_key(incident)),
            Reverse(incident.source_id.clone()),
        )
    });
}

/// Merges `candidates` into `existing`. Stored incidents win over
/// candidates with the same `sourceId`.
#[must_use]
pub fn plan_merge(
    candidates: Vec<Incident>,
    existing: Vec<Incident>,
    ordering_key: impl Fn(&Incident) -> i64,
) -> MergePlan {
    let (unique, mut duplicate_count) = dedup_candidates(candidates);
    let (existing, stored_duplicates) = dedup_candidates(existing);
    if stored_duplicates > 0 {
        log::warn!("Stored set held {stored_duplicates} duplicate sourceId(s); keeping the first");
    }

    let stored: BTreeSet<&str> = existing.iter().map(|i| i.source_id.as_str()).collect();
    let (fresh, already_stored): (Vec<Incident>, Vec<Incident>) = unique
        .into_iter()
        .partition(|incident| !stored.contains(incident.source_id.as_str()));
    duplicate_count += already_stored.len();

    let new_ids = fresh.iter().map(|i| i.source_id.clone()).collect();
    let mut merged = fresh;
    merged.extend(existing);
    sort_newest_first(&mut merged, ordering_key);

    MergePlan {
        merged,
        new_ids,
        duplicate_count,
    }
}
