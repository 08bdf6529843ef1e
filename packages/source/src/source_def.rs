//! Config-driven source definitions.
//!
//! [`SourceDefinition`] captures the identity, window, pagination cap,
//! validation policy, and collector-specific settings of one source. The
//! collector-specific part is a tagged [`CollectorConfig`] so each TOML
//! file selects its collector with `type = "..."`.

use std::collections::BTreeMap;

use seawatch_source_models::{SourceInfo, ValidationPolicy};
use serde::Deserialize;

use crate::{
    SourceError,
    collector::SourceCollector,
    sources::{
        CollectorSettings, imb::ImbCollector, marad::MaradCollector, recaap::RecaapCollector,
        ukmto::UkmtoCollector,
    },
};

/// Minimum spacing between scheduled runs of one source.
pub const MIN_RUN_GAP_DAYS: i64 = 1;

/// Extra overlap so late-published incidents are not missed between runs.
pub const SAFETY_MARGIN_DAYS: i64 = 2;

/// Default rolling window for sources that accept one.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 32;

/// Default pagination cap.
pub const DEFAULT_MAX_PAGES: u32 = 20;

const fn default_lookback_days() -> i64 {
    DEFAULT_LOOKBACK_DAYS
}

const fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

// ── Top-level source definition ──────────────────────────────────────────

/// A complete source definition, loaded from embedded TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDefinition {
    /// Lowercase identifier (`recaap`).
    pub id: String,
    /// `sourceId` prefix (`RECAAP`).
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Landing page recorded as provenance.
    pub url: String,
    /// Rolling window length in days.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    /// Pagination safety cap.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// What to do with incidents that fail validation.
    #[serde(default)]
    pub validation_policy: ValidationPolicy,
    /// Extra HTTP headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Collector-specific settings.
    pub collector: CollectorConfig,
}

// ── Collector config ─────────────────────────────────────────────────────

/// Which collector to use and how to configure it.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectorConfig {
    /// Portal search API (`POST` with a date window, paginated).
    Recaap {
        /// Search endpoint.
        api_url: String,
        /// Records per page.
        page_size: u32,
    },
    /// JSON incident feed.
    Ukmto {
        /// Feed URL.
        api_url: String,
    },
    /// HTML advisory table.
    Marad {
        /// Page containing the advisory table.
        url: String,
        /// CSS selector for data rows.
        row_selector: Option<String>,
        /// CSS selector for cells within a row.
        cell_selector: Option<String>,
    },
    /// `GeoJSON` feed.
    Imb {
        /// Feed URL.
        api_url: String,
    },
}

impl CollectorConfig {
    /// Whether the collector sends a date window to its source.
    #[must_use]
    pub const fn uses_window(&self) -> bool {
        matches!(self, Self::Recaap { .. })
    }
}

impl SourceDefinition {
    /// Source identity.
    #[must_use]
    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            url: self.url.clone(),
        }
    }

    /// Checks invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] for an empty id/name or a window
    /// shorter than the run gap plus safety margin.
    pub fn check(&self) -> Result<(), SourceError> {
        if self.id.is_empty() || self.name.is_empty() {
            return Err(SourceError::Config {
                message: "source id and name must be non-empty".to_string(),
            });
        }
        let minimum = MIN_RUN_GAP_DAYS + SAFETY_MARGIN_DAYS;
        if self.collector.uses_window() && self.lookback_days < minimum {
            return Err(SourceError::Config {
                message: format!(
                    "{}: lookback_days {} is below the minimum of {minimum}",
                    self.id, self.lookback_days
                ),
            });
        }
        Ok(())
    }

    /// Builds the collector described by this definition.
    #[must_use]
    pub fn into_collector(self) -> Box<dyn SourceCollector> {
        let settings = CollectorSettings {
            info: self.info(),
            lookback_days: self.lookback_days,
            max_pages: self.max_pages,
            validation_policy: self.validation_policy,
            headers: self.headers,
        };
        match self.collector {
            CollectorConfig::Recaap { api_url, page_size } => {
                Box::new(RecaapCollector::new(settings, api_url, page_size))
            }
            CollectorConfig::Ukmto { api_url } => Box::new(UkmtoCollector::new(settings, api_url)),
            CollectorConfig::Marad {
                url,
                row_selector,
                cell_selector,
            } => Box::new(MaradCollector::new(
                settings,
                url,
                row_selector,
                cell_selector,
            )),
            CollectorConfig::Imb { api_url } => Box::new(ImbCollector::new(settings, api_url)),
        }
    }
}

/// Parses and checks a source definition.
///
/// # Errors
///
/// Returns [`SourceError`] if the TOML is malformed or the definition
/// violates an invariant.
pub fn parse_source_toml(toml_str: &str) -> Result<SourceDefinition, SourceError> {
    let definition: SourceDefinition = toml::from_str(toml_str)?;
    definition.check()?;
    Ok(definition)
}
