//! Maps partial source records onto the canonical [`Incident`] schema.
//!
//! Collectors emit a loosely-typed "partial" object using canonical field
//! names; [`standardize`] fills every gap, derives decimal coordinates from
//! degree/minute/second parts, normalizes dates, and stamps provenance. It
//! is pure apart from the `standardizedAt` stamp, and running it on its own
//! output changes nothing else.

use chrono::{DateTime, Utc};
use seawatch_incident_models::{
    DEFAULT_STATUS, Incident, IncidentMetadata, Location, ValidationStatus, Vessel,
};
use seawatch_source_models::SourceInfo;
use serde_json::Value;

use crate::parsing::{dms_to_decimal, get_f64, get_string, normalize_date, round_coordinate};

/// Key of the provenance block on standardized records.
const METADATA_FIELD: &str = "_metadata";

/// Decimal coordinates of a partial record's `location`, derived from
/// either decimal fields or DMS parts. Each axis resolves independently.
#[must_use]
pub fn partial_coordinates(partial: &Value) -> (Option<f64>, Option<f64>) {
    let Some(location) = partial.get("location") else {
        return (None, None);
    };
    (
        axis(location, "latitude"),
        axis(location, "longitude"),
    )
}

fn axis(location: &Value, name: &str) -> Option<f64> {
    if let Some(decimal) = get_f64(location, name) {
        return Some(round_coordinate(decimal));
    }
    let degrees = get_f64(location, &format!("{name}Degrees"))?;
    let minutes = get_f64(location, &format!("{name}Minutes")).unwrap_or(0.0);
    let seconds = get_f64(location, &format!("{name}Seconds")).unwrap_or(0.0);
    let hemisphere = get_string(location, &format!("{name}Hemisphere")).unwrap_or_default();
    dms_to_decimal(degrees, minutes, seconds, &hemisphere)
}

fn text(value: &Value, field: &str) -> String {
    get_string(value, field).unwrap_or_default()
}

fn vessel(partial: &Value) -> Option<Vessel> {
    let raw = partial.get("vessel").filter(|v| v.is_object())?;
    let vessel = Vessel {
        name: text(raw, "name"),
        vessel_type: text(raw, "type"),
        flag: text(raw, "flag"),
        imo: text(raw, "imo"),
        status: text(raw, "status"),
    };
    (!vessel.is_empty()).then_some(vessel)
}

/// Returns `raw_id` carrying the `{SOURCE}-` prefix exactly once.
#[must_use]
pub fn prefixed_source_id(source_name: &str, raw_id: &str) -> String {
    let raw_id = raw_id.trim();
    if raw_id.is_empty() {
        return String::new();
    }
    let prefix = format!("{source_name}-");
    if raw_id.starts_with(&prefix) {
        raw_id.to_string()
    } else {
        format!("{prefix}{raw_id}")
    }
}

/// Builds a canonical incident from a partial record.
#[must_use]
pub fn standardize(partial: &Value, source: &SourceInfo, now: DateTime<Utc>) -> Incident {
    let already_standardized = partial.get(METADATA_FIELD).is_some();
    let raw = if already_standardized {
        partial.get("raw").cloned().unwrap_or(Value::Null)
    } else {
        partial
            .get("raw")
            .filter(|raw| !raw.is_null())
            .cloned()
            .unwrap_or_else(|| partial.clone())
    };

    let (latitude, longitude) = partial_coordinates(partial);
    let location = partial.get("location").unwrap_or(&Value::Null);
    let status = get_string(partial, "status")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_STATUS.to_string());

    Incident {
        source_id: prefixed_source_id(&source.name, &text(partial, "sourceId")),
        source: source.name.clone(),
        date_occurred: normalize_date(&text(partial, "dateOccurred")),
        title: text(partial, "title"),
        description: text(partial, "description"),
        location: Location {
            latitude,
            longitude,
            place: text(location, "place"),
            region: text(location, "region"),
        },
        vessel: vessel(partial),
        category: text(partial, "category"),
        severity: text(partial, "severity"),
        status,
        raw,
        metadata: IncidentMetadata {
            standardized_at: now,
            source_name: source.name.clone(),
            source_url: source.url.clone(),
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
        },
    }
}
