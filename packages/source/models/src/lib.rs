#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Types shared between source collectors and the HTTP fetcher.
//!
//! A collector describes each outbound call as a [`SourceRequest`]; the
//! fetcher answers with a [`Payload`]. Records that cannot be mapped are
//! reported as [`SkippedRecord`]s rather than aborting the collection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// HTTP method of a source request.
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
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    #[default]
    Get,
    /// `POST` with a JSON body.
    Post,
}

/// How the response body should be decoded.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseFormat {
    /// Parse as JSON.
    #[default]
    Json,
    /// Keep as text (HTML pages).
    Text,
}

/// A single outbound request to a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters, in order.
    #[serde(default)]
    pub query: Vec<(String, String)>,
    /// JSON body for `POST` requests.
    pub body: Option<serde_json::Value>,
    /// Expected response format.
    pub format: ResponseFormat,
}

impl SourceRequest {
    /// A `GET` request expecting JSON.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// A `POST` request with a JSON body, expecting JSON.
    #[must_use]
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body),
            ..Self::default()
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Adds headers from a map.
    #[must_use]
    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets the expected response format.
    #[must_use]
    pub const fn expecting(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "body", rename_all = "snake_case")]
pub enum Payload {
    /// JSON document.
    Json(serde_json::Value),
    /// Raw text (HTML).
    Text(String),
}

impl Payload {
    /// Returns the JSON document, if this is a JSON payload.
    #[must_use]
    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    /// Returns the text, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(_) => None,
        }
    }
}

/// Identity of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Lowercase identifier used in cache keys and CLI (`recaap`).
    pub id: String,
    /// Uppercase name used as the `sourceId` prefix (`RECAAP`).
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Landing URL recorded as provenance.
    pub url: String,
}

/// What to do with incidents that fail validation.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationPolicy {
    /// Keep the incident, marked `invalid`, with its warnings.
    #[default]
    RetainWithWarnings,
    /// Move the incident to the skipped list.
    DropInvalid,
}

/// A raw record that could not be turned into an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRecord {
    /// Position within the collected records.
    pub index: usize,
    /// Native id, when one could be read.
    pub source_id: Option<String>,
    /// Why the record was skipped.
    pub reason: String,
}

impl SkippedRecord {
    /// Creates a skipped record entry.
    #[must_use]
    pub fn new(index: usize, source_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            index,
            source_id,
            reason: reason.into(),
        }
    }
}
