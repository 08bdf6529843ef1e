//! MARAD (U.S. Maritime Administration) advisory table.
//!
//! The advisories page is scraped with `scraper`. Each body row is
//! `advisory number | title | region | effective date | status`; advisories
//! carry no coordinates. Rows with no cells (spacers, header rows inside the
//! body) are ignored, and rows with fewer than five cells are skipped.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use seawatch_incident_models::Incident;
use seawatch_source_models::{
    Payload, ResponseFormat, SkippedRecord, SourceInfo, SourceRequest, ValidationPolicy,
};
use serde_json::{Map, Value, json};

use super::CollectorSettings;
use crate::{
    SourceError,
    collector::{Extraction, SourceCollector},
    parsing::{get_string, year_sequence_key},
    reference::ReferenceResolver,
};

const TABLE_SELECTOR: &str = "table";
const DEFAULT_ROW_SELECTOR: &str = "tbody tr";
const DEFAULT_CELL_SELECTOR: &str = "td";

/// Column names, in table order.
const COLUMNS: [&str; 5] = ["advisoryNumber", "title", "region", "effectiveDate", "status"];

/// MARAD advisory-table collector.
#[derive(Debug, Clone)]
pub struct MaradCollector {
    settings: CollectorSettings,
    url: String,
    row_selector: String,
    cell_selector: String,
}

impl MaradCollector {
    /// Creates a collector for the advisory page at `url`.
    #[must_use]
    pub fn new(
        settings: CollectorSettings,
        url: String,
        row_selector: Option<String>,
        cell_selector: Option<String>,
    ) -> Self {
        Self {
            settings,
            url,
            row_selector: row_selector.unwrap_or_else(|| DEFAULT_ROW_SELECTOR.to_string()),
            cell_selector: cell_selector.unwrap_or_else(|| DEFAULT_CELL_SELECTOR.to_string()),
        }
    }

    fn selector(&self, selector: &str) -> Result<Selector, SourceError> {
        Selector::parse(selector).map_err(|e| SourceError::Config {
            message: format!(
                "{}: invalid CSS selector '{selector}': {e}",
                self.settings.info.id
            ),
        })
    }
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl SourceCollector for MaradCollector {
    fn info(&self) -> &SourceInfo {
        &self.settings.info
    }

    fn build_request(&self, _page: u32, _now: DateTime<Utc>) -> SourceRequest {
        self.settings
            .decorate(SourceRequest::get(&self.url).expecting(ResponseFormat::Text))
    }

    fn extract_records(&self, payload: &Payload, _page: u32) -> Result<Extraction, SourceError> {
        let id = &self.settings.info.id;
        let body = payload
            .as_text()
            .ok_or_else(|| SourceError::malformed(id, "expected an HTML body"))?;
        let document = Html::parse_document(body);

        let table_sel = self.selector(TABLE_SELECTOR)?;
        let row_sel = self.selector(&self.row_selector)?;
        let cell_sel = self.selector(&self.cell_selector)?;

        let table = document
            .select(&table_sel)
            .next()
            .ok_or_else(|| SourceError::malformed(id, "no advisory table found"))?;

        let mut extraction = Extraction::default();
        let mut index = 0;
        for row in table.select(&row_sel) {
            let cells: Vec<String> = row.select(&cell_sel).map(cell_text).collect();
            if cells.is_empty() {
                continue;
            }
            if cells.len() < COLUMNS.len() {
                let advisory = cells.first().filter(|c| !c.is_empty()).cloned();
                extraction.skipped.push(SkippedRecord::new(
                    index,
                    advisory,
                    format!("row has {} cells, expected {}", cells.len(), COLUMNS.len()),
                ));
            } else {
                let record: Map<String, Value> = COLUMNS
                    .iter()
                    .zip(cells)
                    .map(|(column, cell)| ((*column).to_string(), Value::String(cell)))
                    .collect();
                extraction.records.push(Value::Object(record));
            }
            index += 1;
        }
        Ok(extraction)
    }

    fn map_record(&self, record: &Value) -> Result<Value, String> {
        let field = |name: &str| get_string(record, name).unwrap_or_default();
        let advisory = field("advisoryNumber");
        if advisory.is_empty() {
            return Err("missing advisory number".to_string());
        }
        let title = field("title");
        let region = field("region");
        let description = if region.is_empty() {
            title.clone()
        } else {
            format!("{title} ({region})")
        };

        Ok(json!({
            "sourceId": advisory,
            "dateOccurred": field("effectiveDate"),
            "title": title,
            "description": description,
            "location": {"region": region},
            "status": field("status").to_lowercase(),
            "raw": record,
        }))
    }

    fn enrich(&self, partial: &mut Value, resolver: &ReferenceResolver) {
        let title = partial
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let category = resolver.incident_type(title);
        partial["category"] = Value::String(category);
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
