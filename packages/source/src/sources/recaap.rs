//! `ReCAAP` ISC incident portal.
//!
//! The portal search API takes a `POST` JSON body with a date window and a
//! page number. Key constraints:
//! - Records are nested inside `data.incidents`; `data.totalPages` drives
//!   pagination
//! - Positions arrive as degree/minute/second parts plus hemisphere
//! - Incident numbers look like `IC-2024-0001` (year, then sequence)

use chrono::{DateTime, Utc};
use seawatch_incident_models::Incident;
use seawatch_source_models::{Payload, SkippedRecord, SourceInfo, SourceRequest, ValidationPolicy};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{CollectorSettings, fill_region, normalize_vessel_type, number, text};
use crate::{
    SourceError,
    collector::{DateWindow, Extraction, SourceCollector},
    parsing::{get_path, year_sequence_key},
    reference::ReferenceResolver,
};

/// `ReCAAP` portal collector.
#[derive(Debug, Clone)]
pub struct RecaapCollector {
    settings: CollectorSettings,
    api_url: String,
    page_size: u32,
}

impl RecaapCollector {
    /// Creates a collector for the search endpoint at `api_url`.
    #[must_use]
    pub const fn new(settings: CollectorSettings, api_url: String, page_size: u32) -> Self {
        Self {
            settings,
            api_url,
            page_size,
        }
    }
}

/// Raw record shape from the portal search API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecaapRecord {
    #[serde(default)]
    incident_no: Option<String>,
    #[serde(default)]
    incident_date: Option<String>,
    #[serde(default)]
    incident_type: Option<String>,
    #[serde(default)]
    classification: Option<String>,
    #[serde(default)]
    narrative: Option<String>,
    #[serde(default)]
    location_description: Option<String>,
    #[serde(default)]
    lat_deg: Option<Value>,
    #[serde(default)]
    lat_min: Option<Value>,
    #[serde(default)]
    lat_sec: Option<Value>,
    #[serde(default)]
    lat_dir: Option<String>,
    #[serde(default)]
    long_deg: Option<Value>,
    #[serde(default)]
    long_min: Option<Value>,
    #[serde(default)]
    long_sec: Option<Value>,
    #[serde(default)]
    long_dir: Option<String>,
    #[serde(default)]
    vessel_name: Option<String>,
    #[serde(default)]
    vessel_type: Option<String>,
    #[serde(default)]
    flag: Option<String>,
    #[serde(default)]
    imo_no: Option<String>,
    #[serde(default)]
    vessel_status: Option<String>,
}

/// Builds the search body for one page of the window.
fn build_request_body(window: &DateWindow, page: u32, page_size: u32) -> Value {
    json!({
        "incidentDateFrom": window.from.format("%Y-%m-%d").to_string(),
        "incidentDateTo": window.to.format("%Y-%m-%d").to_string(),
        "pageNumber": page,
        "pageSize": page_size,
        "sortBy": "incidentDate",
        "sortOrder": "desc",
    })
}

impl SourceCollector for RecaapCollector {
    fn info(&self) -> &SourceInfo {
        &self.settings.info
    }

    fn build_request(&self, page: u32, now: DateTime<Utc>) -> SourceRequest {
        let window = DateWindow::ending_at(now, self.settings.lookback_days);
        self.settings.decorate(SourceRequest::post(
            &self.api_url,
            build_request_body(&window, page, self.page_size),
        ))
    }

    fn extract_records(&self, payload: &Payload, page: u32) -> Result<Extraction, SourceError> {
        let id = &self.settings.info.id;
        let body = payload
            .as_json()
            .ok_or_else(|| SourceError::malformed(id, "expected a JSON body"))?;
        let incidents = get_path(body, "data.incidents")
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::malformed(id, "missing data.incidents array"))?;
        let total_pages = get_path(body, "data.totalPages")
            .and_then(Value::as_u64)
            .unwrap_or(1);

        let mut extraction = Extraction {
            has_more: u64::from(page) < total_pages,
            ..Extraction::default()
        };
        for (index, record) in incidents.iter().enumerate() {
            if record.is_object() {
                extraction.records.push(record.clone());
            } else {
                extraction
                    .skipped
                    .push(SkippedRecord::new(index, None, "incident is not an object"));
            }
        }
        Ok(extraction)
    }

    fn map_record(&self, record: &Value) -> Result<Value, String> {
        let raw: RecaapRecord =
            serde_json::from_value(record.clone()).map_err(|e| format!("unreadable record: {e}"))?;
        let incident_no = text(raw.incident_no.as_ref());
        if incident_no.is_empty() {
            return Err("missing incidentNo".to_string());
        }

        let incident_type = text(raw.incident_type.as_ref());
        let vessel_name = text(raw.vessel_name.as_ref());
        let title = if vessel_name.is_empty() {
            incident_type.clone()
        } else {
            format!("{incident_type} - {vessel_name}")
        };

        Ok(json!({
            "sourceId": incident_no,
            "dateOccurred": text(raw.incident_date.as_ref()),
            "title": title,
            "description": text(raw.narrative.as_ref()),
            "location": {
                "latitudeDegrees": number(raw.lat_deg.as_ref()),
                "latitudeMinutes": number(raw.lat_min.as_ref()),
                "latitudeSeconds": number(raw.lat_sec.as_ref()),
                "latitudeHemisphere": text(raw.lat_dir.as_ref()),
                "longitudeDegrees": number(raw.long_deg.as_ref()),
                "longitudeMinutes": number(raw.long_min.as_ref()),
                "longitudeSeconds": number(raw.long_sec.as_ref()),
                "longitudeHemisphere": text(raw.long_dir.as_ref()),
                "place": text(raw.location_description.as_ref()),
                "region": "",
            },
            "vessel": {
                "name": vessel_name,
                "type": text(raw.vessel_type.as_ref()),
                "flag": text(raw.flag.as_ref()),
                "imo": text(raw.imo_no.as_ref()),
                "status": text(raw.vessel_status.as_ref()),
            },
            "category": incident_type,
            "severity": text(raw.classification.as_ref()),
            "raw": record,
        }))
    }

    fn enrich(&self, partial: &mut Value, resolver: &ReferenceResolver) {
        fill_region(partial, resolver);
        normalize_vessel_type(partial, resolver);
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
