//! The per-source collector trait.
//!
//! A collector knows one source's request shape, pagination, and record
//! layout. Everything after "a list of raw records" is shared: the pipeline
//! maps, enriches, standardizes, and validates records the same way for
//! every source.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use seawatch_incident_models::Incident;
use seawatch_source_models::{
    Payload, SkippedRecord, SourceInfo, SourceRequest, ValidationPolicy,
};

use crate::{Fetcher, RetryOptions, SourceError, reference::ReferenceResolver};

/// Records pulled out of one response page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Raw records, in source order.
    pub records: Vec<serde_json::Value>,
    /// Rows that were present but unusable.
    pub skipped: Vec<SkippedRecord>,
    /// Whether another page should be requested.
    pub has_more: bool,
}

/// Everything collected in one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCollection {
    /// Response bodies, one per page, kept so they can be cached and
    /// replayed.
    pub payloads: Vec<Payload>,
    /// Raw records across all pages.
    pub records: Vec<serde_json::Value>,
    /// Global row index of each entry in `records`.
    pub positions: Vec<usize>,
    /// Unusable rows across all pages, indexed globally.
    pub skipped: Vec<SkippedRecord>,
}

impl RawCollection {
    fn absorb(&mut self, extraction: Extraction) {
        let offset = self.records.len() + self.skipped.len();
        // Within a page, records fill the row indices the skipped rows
        // leave free.
        let rows = extraction.records.len() + extraction.skipped.len();
        let taken: BTreeSet<usize> = extraction.skipped.iter().map(|s| s.index).collect();
        let mut free = (0..rows).filter(|row| !taken.contains(row));
        for _ in &extraction.records {
            let row = free.next().unwrap_or(rows);
            self.positions.push(offset + row);
        }
        self.skipped
            .extend(extraction.skipped.into_iter().map(|mut skipped| {
                skipped.index += offset;
                skipped
            }));
        self.records.extend(extraction.records);
    }
}

/// A `[from, to]` date range ending at the invocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Inclusive end.
    pub to: DateTime<Utc>,
}

impl DateWindow {
    /// The `days`-long window ending at `now`.
    #[must_use]
    pub fn ending_at(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            from: now - Duration::days(days),
            to: now,
        }
    }
}

/// Implemented once per external source.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    /// Source identity.
    fn info(&self) -> &SourceInfo;

    /// Request for 1-based `page` of a collection running at `now`.
    fn build_request(&self, page: u32, now: DateTime<Utc>) -> SourceRequest;

    /// Pulls raw records out of the response to `page`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::MalformedResponse`] when the expected
    /// container is missing. Individual bad rows go to `skipped` instead.
    fn extract_records(&self, payload: &Payload, page: u32) -> Result<Extraction, SourceError>;

    /// Maps one raw record into the partial canonical shape consumed by
    /// [`crate::standardize::standardize`].
    ///
    /// # Errors
    ///
    /// Returns a reason string when the record cannot be used; the pipeline
    /// records it as skipped.
    fn map_record(&self, record: &serde_json::Value) -> Result<serde_json::Value, String>;

    /// Fills reference-derived fields (region, normalized vessel type).
    fn enrich(&self, _partial: &mut serde_json::Value, _resolver: &ReferenceResolver) {}

    /// Sort key for the stored set; larger sorts first.
    fn ordering_key(&self, incident: &Incident) -> i64 {
        incident.occurred_at().map_or(0, |dt| dt.timestamp())
    }

    /// What to do with incidents that fail validation.
    fn validation_policy(&self) -> ValidationPolicy;

    /// Pagination safety cap.
    fn max_pages(&self) -> u32;

    /// Fetches pages until the source reports no more (or the cap is hit).
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if any page fails to fetch or is malformed.
    async fn collect(
        &self,
        fetcher: &Fetcher,
        options: &RetryOptions,
        now: DateTime<Utc>,
    ) -> Result<RawCollection, SourceError> {
        let mut collection = RawCollection::default();
        let max_pages = self.max_pages().max(1);

        for page in 1..=max_pages {
            let request = self.build_request(page, now);
            log::debug!("[{}] fetching page {page} from {}", self.info().id, request.url);
            let payload = fetcher.fetch(&request, options).await?;
            let extraction = self.extract_records(&payload, page)?;
            let has_more = extraction.has_more;
            log::info!(
                "[{}] page {page}: {} records, {} skipped",
                self.info().id,
                extraction.records.len(),
                extraction.skipped.len()
            );
            collection.absorb(extraction);
            collection.payloads.push(payload);

            if !has_more {
                break;
            }
            if page == max_pages {
                log::warn!(
                    "[{}] stopping at page cap {max_pages} with more pages available",
                    self.info().id
                );
            }
        }

        Ok(collection)
    }

    /// Re-extracts records from previously fetched pages.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if a page is malformed.
    fn replay(&self, payloads: Vec<Payload>) -> Result<RawCollection, SourceError> {
        let mut collection = RawCollection::default();
        for (page, payload) in (1..).zip(payloads) {
            collection.absorb(self.extract_records(&payload, page)?);
            collection.payloads.push(payload);
        }
        Ok(collection)
    }
}
