//! Concrete maritime source collectors.
//!
//! Each module implements [`SourceCollector`](crate::SourceCollector) for
//! one provider. Shared per-source settings come from the TOML definition
//! through [`CollectorSettings`].

use std::collections::BTreeMap;

use seawatch_source_models::{SourceInfo, SourceRequest, ValidationPolicy};
use serde_json::Value;

use crate::{parsing::value_as_f64, reference::ReferenceResolver, standardize::partial_coordinates};

pub mod imb;
pub mod marad;
pub mod recaap;
pub mod ukmto;

/// Settings every collector carries, taken from its source definition.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Source identity.
    pub info: SourceInfo,
    /// Rolling window length in days.
    pub lookback_days: i64,
    /// Pagination cap.
    pub max_pages: u32,
    /// What to do with invalid incidents.
    pub validation_policy: ValidationPolicy,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
}

impl CollectorSettings {
    /// Applies the configured headers to `request`.
    #[must_use]
    pub fn decorate(&self, request: SourceRequest) -> SourceRequest {
        request.with_headers(&self.headers)
    }
}

/// Reads an optional JSON scalar as a number.
fn number(value: Option<&Value>) -> Option<f64> {
    value.and_then(value_as_f64)
}

/// Trims an optional string, mapping blank to empty.
fn text(value: Option<&String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Sets `location.region` from the partial's coordinates when it is blank.
fn fill_region(partial: &mut Value, resolver: &ReferenceResolver) {
    let has_region = partial
        .pointer("/location/region")
        .and_then(Value::as_str)
        .is_some_and(|region| !region.trim().is_empty());
    if has_region {
        return;
    }
    if let (Some(lat), Some(lon)) = partial_coordinates(partial)
        && let Some(location) = partial.get_mut("location").and_then(Value::as_object_mut)
    {
        location.insert(
            "region".to_string(),
            Value::String(resolver.region_for(lat, lon)),
        );
    }
}

/// Replaces `vessel.type` with its canonical form when present.
fn normalize_vessel_type(partial: &mut Value, resolver: &ReferenceResolver) {
    if let Some(vessel_type) = partial.pointer_mut("/vessel/type")
        && let Some(raw) = vessel_type.as_str()
        && !raw.trim().is_empty()
    {
        *vessel_type = Value::String(resolver.vessel_type(raw));
    }
}
