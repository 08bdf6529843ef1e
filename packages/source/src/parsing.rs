//! Shared parsing utilities for maritime sources.
//!
//! Date, coordinate, and JSON field helpers used across collectors, the
//! standardizer, and the validator.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Date-time layouts accepted in addition to RFC 3339, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Date-only layouts, interpreted as midnight UTC.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d %B %Y", "%d %b %Y", "%B %d, %Y"];

/// Parses a source date string into UTC. Offset-less values are taken as
/// UTC.
#[must_use]
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Formats a timestamp the way incidents carry it: RFC 3339, whole
/// seconds, `Z` suffix.
#[must_use]
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Re-emits a parseable date as RFC 3339; returns the trimmed input
/// otherwise.
#[must_use]
pub fn normalize_date(s: &str) -> String {
    parse_date(s).map_or_else(|| s.trim().to_string(), |dt| format_timestamp(&dt))
}

/// Rounds a decimal-degree coordinate to 6 places (~0.1 m).
#[must_use]
pub fn round_coordinate(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Converts degree/minute/second parts to signed decimal degrees.
///
/// The hemisphere (`N`/`S`/`E`/`W`, case-insensitive, may be spelled out)
/// sets the sign; a negative degree value is also honoured. Returns `None`
/// for an unknown hemisphere or negative minutes/seconds.
#[must_use]
pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, hemisphere: &str) -> Option<f64> {
    if minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    let negative = match hemisphere.trim().chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('S' | 'W') => true,
        Some('N' | 'E') | None => degrees.is_sign_negative(),
        Some(_) => return None,
    };
    let magnitude = degrees.abs() + minutes / 60.0 + seconds / 3600.0;
    Some(round_coordinate(if negative { -magnitude } else { magnitude }))
}

/// Reads a number from a JSON value that may be a number or a numeric
/// string.
#[must_use]
pub fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads a JSON scalar as trimmed text. Numbers are rendered; null, arrays
/// and objects yield `None`.
#[must_use]
pub fn value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Gets a string field, trimmed. Missing or non-scalar fields are `None`.
#[must_use]
pub fn get_string(record: &serde_json::Value, field: &str) -> Option<String> {
    record.get(field).and_then(value_as_string)
}

/// Gets the first non-empty string among `fields`.
#[must_use]
pub fn first_string(record: &serde_json::Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|field| get_string(record, field))
        .find(|s| !s.is_empty())
}

/// Gets a numeric field (number or numeric string).
#[must_use]
pub fn get_f64(record: &serde_json::Value, field: &str) -> Option<f64> {
    record.get(field).and_then(value_as_f64)
}

/// Follows a dot-separated path (`result.incidents.items`).
#[must_use]
pub fn get_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

/// Ordering key for year/sequence identifiers: `year * 1000 + sequence`.
///
/// The year is the first four-digit `19xx`/`20xx` number in the id; the
/// sequence is the last other number. Ids without both yield `0` so that
/// malformed ids sort last instead of failing the merge.
///
/// `RECAAP-IC-2024-0001` → `2024001`, `UKMTO-012-2024` → `2024012`.
#[must_use]
pub fn year_sequence_key(source_id: &str) -> i64 {
    let tokens: Vec<&str> = source_id
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .collect();

    let Some(year_index) = tokens
        .iter()
        .position(|token| token.len() == 4 && (token.starts_with("19") || token.starts_with("20")))
    else {
        return 0;
    };
    let Some(sequence) = tokens
        .iter()
        .enumerate()
        .rev()
        .find(|(index, _)| *index != year_index)
        .map(|(_, token)| *token)
    else {
        return 0;
    };

    let (Ok(year), Ok(sequence)) = (tokens[year_index].parse::<i64>(), sequence.parse::<i64>())
    else {
        return 0;
    };
    year.checked_mul(1000)
        .and_then(|base| base.checked_add(sequence))
        .unwrap_or(0)
}
