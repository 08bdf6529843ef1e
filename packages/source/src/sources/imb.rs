//! IMB Piracy Reporting Centre live map feed.
//!
//! A `GeoJSON` `FeatureCollection`: attributes live in `properties` and the
//! position in `geometry.coordinates` as `[longitude, latitude]`. Attack
//! numbers (`045-24`) carry a two-digit year, so incidents are ordered by
//! date rather than by id.

use chrono::{DateTime, Utc};
use seawatch_source_models::{Payload, SkippedRecord, SourceInfo, SourceRequest, ValidationPolicy};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{CollectorSettings, fill_region, normalize_vessel_type, text};
use crate::{
    SourceError,
    collector::{Extraction, SourceCollector},
    parsing::value_as_f64,
    reference::ReferenceResolver,
};

/// IMB feed collector.
#[derive(Debug, Clone)]
pub struct ImbCollector {
    settings: CollectorSettings,
    api_url: String,
}

impl ImbCollector {
    /// Creates a collector for the feed at `api_url`.
    #[must_use]
    pub const fn new(settings: CollectorSettings, api_url: String) -> Self {
        Self { settings, api_url }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImbProperties {
    #[serde(default)]
    attack_number: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    incident_type: Option<String>,
    #[serde(default)]
    vessel_type: Option<String>,
    #[serde(default)]
    vessel_status: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    narrative: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImbGeometry {
    #[serde(default)]
    coordinates: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ImbFeature {
    #[serde(default)]
    properties: ImbProperties,
    #[serde(default)]
    geometry: Option<ImbGeometry>,
}

/// Joins the feed's separate date and time (`0130` or `01:30`).
fn occurred(date: &str, time: &str) -> String {
    let digits: String = time.chars().filter(char::is_ascii_digit).collect();
    if date.is_empty() || digits.len() != 4 {
        return date.to_string();
    }
    format!("{date} {}:{}", &digits[..2], &digits[2..])
}

impl SourceCollector for ImbCollector {
    fn info(&self) -> &SourceInfo {
        &self.settings.info
    }

    fn build_request(&self, _page: u32, _now: DateTime<Utc>) -> SourceRequest {
        self.settings.decorate(SourceRequest::get(&self.api_url))
    }

    fn extract_records(&self, payload: &Payload, _page: u32) -> Result<Extraction, SourceError> {
        let id = &self.settings.info.id;
        let features = payload
            .as_json()
            .and_then(|body| body.get("features"))
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::malformed(id, "missing features array"))?;

        let mut extraction = Extraction::default();
        for (index, feature) in features.iter().enumerate() {
            if feature.get("properties").is_some_and(Value::is_object) {
                extraction.records.push(feature.clone());
            } else {
                extraction
                    .skipped
                    .push(SkippedRecord::new(index, None, "feature has no properties"));
            }
        }
        Ok(extraction)
    }

    fn map_record(&self, record: &Value) -> Result<Value, String> {
        let feature: ImbFeature =
            serde_json::from_value(record.clone()).map_err(|e| format!("unreadable feature: {e}"))?;
        let props = feature.properties;
        let attack_number = text(props.attack_number.as_ref());
        if attack_number.is_empty() {
            return Err("missing attackNumber".to_string());
        }

        let coordinates = feature.geometry.map(|g| g.coordinates).unwrap_or_default();
        let (longitude, latitude) = match coordinates.as_slice() {
            [lon, lat, ..] => (value_as_f64(lon), value_as_f64(lat)),
            _ => (None, None),
        };
        let incident_type = text(props.incident_type.as_ref());
        let place = text(props.location.as_ref());
        let title = if place.is_empty() {
            incident_type.clone()
        } else {
            format!("{incident_type} - {place}")
        };

        Ok(json!({
            "sourceId": attack_number,
            "dateOccurred": occurred(&text(props.date.as_ref()), &text(props.time.as_ref())),
            "title": title,
            "description": text(props.narrative.as_ref()),
            "location": {
                "latitude": latitude,
                "longitude": longitude,
                "place": place,
            },
            "vessel": {
                "type": text(props.vessel_type.as_ref()),
                "status": text(props.vessel_status.as_ref()),
            },
            "category": incident_type,
            "raw": record,
        }))
    }

    fn enrich(&self, partial: &mut Value, resolver: &ReferenceResolver) {
        fill_region(partial, resolver);
        normalize_vessel_type(partial, resolver);
    }

    fn validation_policy(&self) -> ValidationPolicy {
        self.settings.validation_policy
    }

    fn max_pages(&self) -> u32 {
        self.settings.max_pages
    }
}
