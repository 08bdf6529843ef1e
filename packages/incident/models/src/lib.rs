#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Canonical maritime incident schema.
//!
//! Every collector produces [`Incident`] records after standardization. The
//! JSON shape of this type (camelCase, `_metadata` provenance block) is the
//! wire contract between the collection pipeline and every downstream
//! consumer, so fields must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle status assigned to freshly standardized incidents.
pub const DEFAULT_STATUS: &str = "active";

/// Outcome of validating an incident.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValidationStatus {
    /// Standardized but not yet validated.
    #[default]
    Pending,
    /// Passed every validation rule.
    Valid,
    /// Retained with one or more validation warnings.
    Invalid,
}

/// Where an incident happened.
///
/// Coordinates are WGS84 decimal degrees. `None` when the source carries no
/// position (e.g. advisory-style sources).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Latitude in decimal degrees.
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees.
    pub longitude: Option<f64>,
    /// Free-text place description (port, strait, anchorage, ...).
    pub place: String,
    /// Coarse maritime region classification.
    pub region: String,
}

impl Location {
    /// Returns the `(latitude, longitude)` pair when both are present.
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }
}

/// The vessel involved in an incident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vessel {
    /// Vessel name as reported.
    pub name: String,
    /// Vessel type (normalized where a reference table is available).
    #[serde(rename = "type")]
    pub vessel_type: String,
    /// Flag state.
    pub flag: String,
    /// Seven-digit IMO number, without the `IMO` prefix.
    pub imo: String,
    /// Vessel status at the time of the incident (berthed, underway, ...).
    pub status: String,
}

impl Vessel {
    /// Returns `true` when every field is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.vessel_type.is_empty()
            && self.flag.is_empty()
            && self.imo.is_empty()
            && self.status.is_empty()
    }
}

/// Provenance block attached to every standardized incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentMetadata {
    /// When the record was standardized. Volatile; never part of the
    /// content hash.
    pub standardized_at: DateTime<Utc>,
    /// Name of the source system.
    pub source_name: String,
    /// URL the record was collected from.
    pub source_url: String,
    /// Result of validation.
    pub validation_status: ValidationStatus,
    /// Non-fatal validation warnings.
    pub validation_errors: Vec<String>,
}

/// A maritime-security incident in the canonical schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    /// Natural key, `{SOURCE}-{sourceNativeId}`. Unique within a source.
    pub source_id: String,
    /// Origin system (e.g. `RECAAP`).
    pub source: String,
    /// When the event happened, RFC 3339 UTC when parseable.
    pub date_occurred: String,
    /// Short human-readable title.
    pub title: String,
    /// Narrative description.
    pub description: String,
    /// Position and region.
    pub location: Location,
    /// Involved vessel, if any.
    pub vessel: Option<Vessel>,
    /// Source-specific incident classification.
    pub category: String,
    /// Source-specific severity.
    pub severity: String,
    /// Lifecycle flag.
    pub status: String,
    /// Untouched copy of the source record.
    pub raw: serde_json::Value,
    /// Provenance.
    #[serde(rename = "_metadata")]
    pub metadata: IncidentMetadata,
}

impl Incident {
    /// Returns the parsed occurrence time, if `date_occurred` is RFC 3339.
    #[must_use]
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.date_occurred)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Returns the part of `source_id` after the `{SOURCE}-` prefix.
    #[must_use]
    pub fn native_id(&self) -> &str {
        self.source_id
            .strip_prefix(&self.source)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&self.source_id)
    }
}

/// A value together with the non-fatal warnings produced while checking it.
///
/// Validation never drops data on its own: callers decide, based on the
/// source's policy, whether a value with warnings is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    /// The (possibly normalized) value.
    pub value: T,
    /// Warnings, each naming the offending field.
    pub warnings: Vec<String>,
}

impl<T> Validated<T> {
    /// Wraps a value with no warnings.
    #[must_use]
    pub const fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    /// Returns `true` when no warnings were recorded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Splits into the value and its warnings.
    #[must_use]
    pub fn into_parts(self) -> (T, Vec<String>) {
        (self.value, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Incident {
        Incident {
            source_id: "RECAAP-IC-2024-0001".to_string(),
            source: "RECAAP".to_string(),
            date_occurred: "2024-01-15T14:30:00Z".to_string(),
            title: "Armed robbery".to_string(),
            description: "Perpetrators boarded the tanker".to_string(),
            location: Location {
                latitude: Some(1.25),
                longitude: Some(103.8),
                place: "Singapore Strait".to_string(),
                region: "Singapore Strait".to_string(),
            },
            vessel: None,
            category: "CAT 3".to_string(),
            severity: String::new(),
            status: DEFAULT_STATUS.to_string(),
            raw: serde_json::json!({"incidentNo": "IC-2024-0001"}),
            metadata: IncidentMetadata {
                standardized_at: DateTime::from_timestamp(1_705_329_000, 0).unwrap(),
                source_name: "RECAAP".to_string(),
                source_url: "https://portal.recaap.org".to_string(),
                validation_status: ValidationStatus::Valid,
                validation_errors: vec![],
            },
        }
    }

    #[test]
    fn serializes_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["sourceId"], "RECAAP-IC-2024-0001");
        assert_eq!(json["dateOccurred"], "2024-01-15T14:30:00Z");
        assert_eq!(json["location"]["latitude"], 1.25);
        assert_eq!(json["vessel"], serde_json::Value::Null);
        assert_eq!(json["_metadata"]["validationStatus"], "valid");
        assert!(json["_metadata"]["validationErrors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn vessel_type_serializes_as_type() {
        let vessel = Vessel {
            vessel_type: "Tanker".to_string(),
            ..Vessel::default()
        };
        let json = serde_json::to_value(&vessel).unwrap();
        assert_eq!(json["type"], "Tanker");
        assert!(!vessel.is_empty());
        assert!(Vessel::default().is_empty());
    }

    #[test]
    fn native_id_strips_source_prefix() {
        assert_eq!(sample().native_id(), "IC-2024-0001");
    }

    #[test]
    fn occurred_at_parses_rfc3339() {
        let incident = sample();
        assert_eq!(
            incident.occurred_at().unwrap().to_rfc3339(),
            "2024-01-15T14:30:00+00:00"
        );

        let mut broken = sample();
        broken.date_occurred = "sometime last week".to_string();
        assert!(broken.occurred_at().is_none());
    }

    #[test]
    fn coordinates_require_both_axes() {
        let mut location = sample().location;
        assert_eq!(location.coordinates(), Some((1.25, 103.8)));
        location.longitude = None;
        assert_eq!(location.coordinates(), None);
    }

    #[test]
    fn validated_reports_warnings() {
        let clean = Validated::clean(1);
        assert!(clean.is_valid());

        let warned = Validated {
            value: 1,
            warnings: vec!["missing required field: description".to_string()],
        };
        assert!(!warned.is_valid());
        let (value, warnings) = warned.into_parts();
        assert_eq!(value, 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn status_parses_from_str() {
        assert_eq!(
            "invalid".parse::<ValidationStatus>().unwrap(),
            ValidationStatus::Invalid
        );
        assert_eq!(ValidationStatus::Pending.as_ref(), "pending");
    }
}
