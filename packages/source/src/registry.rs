//! Source registry: loads every source definition from embedded TOML.
//!
//! Each `.toml` file in `packages/source/sources/` is baked into the binary
//! at compile time via [`include_str!`]. Adding a source means adding a TOML
//! file, a [`CollectorConfig`](crate::source_def::CollectorConfig) variant,
//! and an entry in the list below.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    collector::SourceCollector,
    source_def::{SourceDefinition, parse_source_toml},
};

/// TOML configs embedded at compile time.
const SOURCE_TOMLS: &[(&str, &str)] = &[
    ("recaap", include_str!("../sources/recaap.toml")),
    ("ukmto", include_str!("../sources/ukmto.toml")),
    ("marad", include_str!("../sources/marad.toml")),
    ("imb", include_str!("../sources/imb.toml")),
];

/// Total number of configured sources (used in tests).
#[cfg(test)]
const EXPECTED_SOURCE_COUNT: usize = 4;

/// Returns all configured source definitions, parsed from embedded TOML.
///
/// # Panics
///
/// Panics if any TOML config is malformed (the configs are embedded, so
/// this is caught by the registry tests).
#[must_use]
pub fn all_sources() -> Vec<SourceDefinition> {
    SOURCE_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_source_toml(toml).unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Looks up one source definition by id.
#[must_use]
pub fn find_source(id: &str) -> Option<SourceDefinition> {
    all_sources().into_iter().find(|source| source.id == id)
}

/// Builds the collector for source `id`.
#[must_use]
pub fn collector_for(id: &str) -> Option<Arc<dyn SourceCollector>> {
    find_source(id).map(|source| Arc::from(source.into_collector()))
}

/// Every collector, keyed by source id.
#[must_use]
pub fn collectors() -> BTreeMap<String, Arc<dyn SourceCollector>> {
    all_sources()
        .into_iter()
        .map(|source| (source.id.clone(), Arc::from(source.into_collector())))
        .collect()
}
