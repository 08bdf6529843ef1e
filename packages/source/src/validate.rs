//! Incident validation.
//!
//! Validation normalizes what it can (whitespace, IMO prefixes, date
//! layout) and reports what it cannot as warnings. It never drops an
//! incident itself; [`apply_policy`] does that according to the source's
//! [`ValidationPolicy`].

use chrono::{DateTime, Duration, Utc};
use seawatch_incident_models::{Incident, Validated, ValidationStatus};
use seawatch_source_models::{SkippedRecord, ValidationPolicy};

use crate::parsing::{format_timestamp, parse_date};

/// How far past "now" an occurrence date may lie before it is flagged.
const FUTURE_TOLERANCE_DAYS: i64 = 1;

/// Returns `true` for a 7-digit IMO number with a valid check digit.
///
/// The first six digits are weighted 7..2; the sum's last digit must equal
/// the seventh digit.
#[must_use]
pub fn is_valid_imo(imo: &str) -> bool {
    let digits: Vec<u32> = imo.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 7 || imo.chars().count() != 7 {
        return false;
    }
    let sum: u32 = digits[..6]
        .iter()
        .zip((2..=7).rev())
        .map(|(digit, weight)| digit * weight)
        .sum();
    sum % 10 == digits[6]
}

/// Strips an optional `IMO` prefix and surrounding punctuation.
#[must_use]
pub fn normalize_imo(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_prefix = match (trimmed.get(..3), trimmed.get(3..)) {
        (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case("imo") => rest,
        _ => trimmed,
    };
    without_prefix
        .trim_start_matches([':', '.', '#', ' ', '-'])
        .trim()
        .to_string()
}

fn trim_in_place(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

/// Validates and normalizes an incident from `source_name`.
///
/// The outcome is also written into the incident's `_metadata`.
#[must_use]
pub fn validate(mut incident: Incident, source_name: &str, now: DateTime<Utc>) -> Validated<Incident> {
    let mut warnings = Vec::new();

    for field in [
        &mut incident.source_id,
        &mut incident.title,
        &mut incident.description,
        &mut incident.category,
        &mut incident.severity,
        &mut incident.status,
        &mut incident.location.place,
        &mut incident.location.region,
    ] {
        trim_in_place(field);
    }

    if incident.source_id.is_empty() {
        warnings.push("missing required field: sourceId".to_string());
    } else if !incident.source_id.starts_with(&format!("{source_name}-")) {
        warnings.push(format!("sourceId must start with {source_name}-"));
    }
    if incident.title.is_empty() {
        warnings.push("missing required field: title".to_string());
    }
    if incident.description.is_empty() {
        warnings.push("missing required field: description".to_string());
    }

    if incident.date_occurred.trim().is_empty() {
        warnings.push("missing required field: dateOccurred".to_string());
    } else {
        match parse_date(&incident.date_occurred) {
            Some(occurred) => {
                incident.date_occurred = format_timestamp(&occurred);
                if occurred > now + Duration::days(FUTURE_TOLERANCE_DAYS) {
                    warnings.push(format!(
                        "dateOccurred is in the future: {}",
                        incident.date_occurred
                    ));
                }
            }
            None => warnings.push(format!(
                "dateOccurred is not a valid date: {}",
                incident.date_occurred
            )),
        }
    }

    match (incident.location.latitude, incident.location.longitude) {
        (Some(lat), Some(lon)) => {
            if !(-90.0..=90.0).contains(&lat) {
                warnings.push(format!("location.latitude out of range: {lat}"));
            }
            if !(-180.0..=180.0).contains(&lon) {
                warnings.push(format!("location.longitude out of range: {lon}"));
            }
        }
        (Some(_), None) | (None, Some(_)) => {
            warnings.push("location must have both latitude and longitude".to_string());
        }
        (None, None) => {}
    }

    if let Some(vessel) = incident.vessel.as_mut() {
        for field in [
            &mut vessel.name,
            &mut vessel.vessel_type,
            &mut vessel.flag,
            &mut vessel.status,
        ] {
            trim_in_place(field);
        }
        vessel.imo = normalize_imo(&vessel.imo);
        if !vessel.imo.is_empty() && !is_valid_imo(&vessel.imo) {
            warnings.push(format!("vessel.imo is not a valid IMO number: {}", vessel.imo));
        }
    }

    incident.metadata.validation_status = if warnings.is_empty() {
        ValidationStatus::Valid
    } else {
        ValidationStatus::Invalid
    };
    incident.metadata.validation_errors.clone_from(&warnings);

    if !warnings.is_empty() {
        log::debug!(
            "{} has {} validation warning(s): {}",
            incident.source_id,
            warnings.len(),
            warnings.join("; ")
        );
    }

    Validated {
        value: incident,
        warnings,
    }
}

/// Incidents split by a validation policy.
#[derive(Debug, Default)]
pub struct PolicyOutcome {
    /// Incidents that continue through the pipeline.
    pub kept: Vec<Incident>,
    /// Invalid incidents removed under [`ValidationPolicy::DropInvalid`].
    pub dropped: Vec<SkippedRecord>,
    /// Kept incidents that carry warnings.
    pub invalid_kept: usize,
}

/// Applies `policy` to validated incidents. `index_offset` positions the
/// dropped entries after any records skipped earlier.
#[must_use]
pub fn apply_policy(
    validated: Vec<Validated<Incident>>,
    policy: ValidationPolicy,
    index_offset: usize,
) -> PolicyOutcome {
    let mut outcome = PolicyOutcome::default();
    for (index, item) in validated.into_iter().enumerate() {
        if item.is_valid() {
            outcome.kept.push(item.value);
            continue;
        }
        match policy {
            ValidationPolicy::RetainWithWarnings => {
                outcome.invalid_kept += 1;
                outcome.kept.push(item.value);
            }
            ValidationPolicy::DropInvalid => {
                let (incident, warnings) = item.into_parts();
                outcome.dropped.push(SkippedRecord::new(
                    index_offset + index,
                    Some(incident.source_id),
                    warnings.join("; "),
                ));
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seawatch_incident_models::{IncidentMetadata, Location, Vessel};

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_710_000_000, 0).unwrap()
    }

    fn incident() -> Incident {
        Incident {
            source_id: "UKMTO-012-2024".to_string(),
            source: "UKMTO".to_string(),
            date_occurred: "2024-03-02T08:15:00Z".to_string(),
            title: "Vessel attacked".to_string(),
            description: "Merchant vessel reported an explosion nearby".to_string(),
            location: Location {
                latitude: Some(12.5),
                longitude: Some(43.3),
                place: "Bab-el-Mandeb".to_string(),
                region: "Red Sea".to_string(),
            },
            vessel: None,
            category: "Attack".to_string(),
            severity: String::new(),
            status: "active".to_string(),
            raw: serde_json::json!({}),
            metadata: IncidentMetadata {
                standardized_at: now(),
                source_name: "UKMTO".to_string(),
                source_url: "https://www.ukmto.org".to_string(),
                validation_status: ValidationStatus::Pending,
                validation_errors: vec![],
            },
        }
    }

    #[test]
    fn imo_check_digit() {
        assert!(is_valid_imo("9074729"));
        assert!(!is_valid_imo("9074728"));
        assert!(!is_valid_imo("907472"));
        assert!(!is_valid_imo("90747A9"));
    }

    #[test]
    fn imo_prefix_is_stripped() {
        assert_eq!(normalize_imo("IMO 9074729"), "9074729");
        assert_eq!(normalize_imo("imo:9074729"), "9074729");
        assert_eq!(normalize_imo(" 9074729 "), "9074729");
    }

    #[test]
    fn clean_incident_is_valid() {
        let result = validate(incident(), "UKMTO", now());
        assert!(result.is_valid(), "{:?}", result.warnings);
        assert_eq!(result.value.metadata.validation_status, ValidationStatus::Valid);
        assert!(result.value.metadata.validation_errors.is_empty());
    }

    #[test]
    fn missing_description_is_a_warning_not_a_drop() {
        let mut broken = incident();
        broken.description = "   ".to_string();
        let result = validate(broken, "UKMTO", now());
        assert_eq!(result.warnings, vec!["missing required field: description"]);
        assert_eq!(result.value.metadata.validation_status, ValidationStatus::Invalid);
        assert_eq!(
            result.value.metadata.validation_errors,
            vec!["missing required field: description"]
        );
    }

    #[test]
    fn wrong_prefix_is_flagged() {
        let mut broken = incident();
        broken.source_id = "RECAAP-IC-2024-0001".to_string();
        let result = validate(broken, "UKMTO", now());
        assert_eq!(result.warnings, vec!["sourceId must start with UKMTO-"]);
    }

    #[test]
    fn normalizes_dates_and_flags_future_ones() {
        let mut item = incident();
        item.date_occurred = "2024-03-02 08:15".to_string();
        let result = validate(item, "UKMTO", now());
        assert_eq!(result.value.date_occurred, "2024-03-02T08:15:00Z");
        assert!(result.is_valid());

        let mut future = incident();
        future.date_occurred = "2030-01-01T00:00:00Z".to_string();
        let result = validate(future, "UKMTO", now());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("dateOccurred is in the future"));

        let mut garbage = incident();
        garbage.date_occurred = "last tuesday".to_string();
        let result = validate(garbage, "UKMTO", now());
        assert_eq!(result.warnings, vec!["dateOccurred is not a valid date: last tuesday"]);
        assert_eq!(result.value.date_occurred, "last tuesday");
    }

    #[test]
    fn coordinate_checks() {
        let mut item = incident();
        item.location.latitude = Some(91.0);
        item.location.longitude = Some(-181.0);
        let result = validate(item, "UKMTO", now());
        assert_eq!(
            result.warnings,
            vec![
                "location.latitude out of range: 91",
                "location.longitude out of range: -181"
            ]
        );

        let mut half = incident();
        half.location.longitude = None;
        let result = validate(half, "UKMTO", now());
        assert_eq!(
            result.warnings,
            vec!["location must have both latitude and longitude"]
        );
    }

    #[test]
    fn vessel_imo_is_normalized_and_checked() {
        let mut item = incident();
        item.vessel = Some(Vessel {
            name: " OCEAN STAR ".to_string(),
            imo: "IMO 9074729".to_string(),
            ..Vessel::default()
        });
        let result = validate(item, "UKMTO", now());
        assert!(result.is_valid());
        let vessel = result.value.vessel.unwrap();
        assert_eq!(vessel.imo, "9074729");
        assert_eq!(vessel.name, "OCEAN STAR");

        let mut bad = incident();
        bad.vessel = Some(Vessel {
            imo: "1234567".to_string(),
            ..Vessel::default()
        });
        let result = validate(bad, "UKMTO", now());
        assert_eq!(
            result.warnings,
            vec!["vessel.imo is not a valid IMO number: 1234567"]
        );
    }

    #[test]
    fn policy_retains_or_drops_invalid() {
        let mut broken = incident();
        broken.title = String::new();
        let items = || {
            vec![
                validate(incident(), "UKMTO", now()),
                validate(broken.clone(), "UKMTO", now()),
            ]
        };

        let retained = apply_policy(items(), ValidationPolicy::RetainWithWarnings, 0);
        assert_eq!(retained.kept.len(), 2);
        assert_eq!(retained.invalid_kept, 1);
        assert!(retained.dropped.is_empty());

        let dropped = apply_policy(items(), ValidationPolicy::DropInvalid, 5);
        assert_eq!(dropped.kept.len(), 1);
        assert_eq!(dropped.invalid_kept, 0);
        assert_eq!(dropped.dropped.len(), 1);
        assert_eq!(dropped.dropped[0].index, 6);
        assert_eq!(dropped.dropped[0].reason, "missing required field: title");
    }
}
