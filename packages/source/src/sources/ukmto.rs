//! UKMTO (United Kingdom Maritime Trade Operations) incident feed.
//!
//! A single JSON document with records under `result.incidents.items`.
//! References come as `UKMTO 012/2024` or `012/2024` and are turned into
//! `012-2024` so the natural key stays URL- and filename-safe.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use seawatch_incident_models::Incident;
use seawatch_source_models::{Payload, SkippedRecord, SourceInfo, SourceRequest, ValidationPolicy};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{CollectorSettings, fill_region, number, text};
use crate::{
    SourceError,
    collector::{Extraction, SourceCollector},
    parsing::{get_path, year_sequence_key},
    reference::ReferenceResolver,
};

const ITEMS_PATH: &str = "result.incidents.items";

static REFERENCE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:UKMTO\s*)?(\d+)\s*/\s*(\d{2,4})$").ok());

/// Turns a UKMTO reference into its native id (`012/2024` → `012-2024`).
///
/// Anything that does not look like `number/year` is kept trimmed, with
/// slashes and whitespace replaced by dashes.
#[must_use]
pub fn native_reference(reference: &str) -> String {
    let reference = reference.trim();
    if let Some(re) = REFERENCE_RE.as_ref()
        && let Some(caps) = re.captures(reference)
    {
        return format!("{}-{}", &caps[1], &caps[2]);
    }
    reference
        .split(|c: char| c == '/' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// UKMTO feed collector.
#[derive(Debug, Clone)]
pub struct UkmtoCollector {
    settings: CollectorSettings,
    api_url: String,
}

impl UkmtoCollector {
    /// Creates a collector for the feed at `api_url`.
    #[must_use]
    pub const fn new(settings: CollectorSettings, api_url: String) -> Self {
        Self { settings, api_url }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UkmtoRecord {
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    date_time: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    latitude: Option<Value>,
    #[serde(default)]
    longitude: Option<Value>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    incident_type: Option<String>,
    #[serde(default)]
    vessel_type: Option<String>,
}

impl SourceCollector for UkmtoCollector {
    fn info(&self) -> &SourceInfo {
        &self.settings.info
    }

    fn build_request(&self, _page: u32, _now: DateTime<Utc>) -> SourceRequest {
        self.settings.decorate(SourceRequest::get(&self.api_url))
    }

    fn extract_records(&self, payload: &Payload, _page: u32) -> Result<Extraction, SourceError> {
        let id = &self.settings.info.id;
        let body = payload
            .as_json()
            .ok_or_else(|| SourceError::malformed(id, "expected a JSON body"))?;
        let items = get_path(body, ITEMS_PATH)
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::malformed(id, format!("missing {ITEMS_PATH} array")))?;

        let mut extraction = Extraction::default();
        for (index, item) in items.iter().enumerate() {
            if item.is_object() {
                extraction.records.push(item.clone());
            } else {
                extraction
                    .skipped
                    .push(SkippedRecord::new(index, None, "item is not an object"));
            }
        }
        Ok(extraction)
    }

    fn map_record(&self, record: &Value) -> Result<Value, String> {
        let raw: UkmtoRecord =
            serde_json::from_value(record.clone()).map_err(|e| format!("unreadable record: {e}"))?;
        let native_id = native_reference(&text(raw.reference.as_ref()));
        if native_id.is_empty() {
            return Err("missing reference".to_string());
        }

        let vessel_type = text(raw.vessel_type.as_ref());
        let vessel = if vessel_type.is_empty() {
            Value::Null
        } else {
            json!({ "type": vessel_type })
        };

        Ok(json!({
            "sourceId": native_id,
            "dateOccurred": text(raw.date_time.as_ref()),
            "title": text(raw.title.as_ref()),
            "description": text(raw.description.as_ref()),
            "location": {
                "latitude": number(raw.latitude.as_ref()),
                "longitude": number(raw.longitude.as_ref()),
                "place": text(raw.location.as_ref()),
                "region": text(raw.area.as_ref()),
            },
            "vessel": vessel,
            "category": text(raw.incident_type.as_ref()),
            "raw": record,
        }))
    }

    fn enrich(&self, partial: &mut Value, resolver: &ReferenceResolver) {
        fill_region(partial, resolver);
        let category_blank = partial
            .get("category")
            .and_then(Value::as_str)
            .is_none_or(|category| category.is_empty());
        if category_blank {
            let title = partial
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let category = resolver.incident_type(title);
            partial["category"] = Value::String(category);
        }
    }

    fn ordering_key(&self, incident: &Incident) -> i64 {
        year_sequence_key(&incident.source_id)
    }

    fn validation_policy(&self) -> ValidationPolicy {
        self.settings.validation_policy
    }

    fn max_pages(&self) -> u32 {
        self.settings.max_pages
    }
}
