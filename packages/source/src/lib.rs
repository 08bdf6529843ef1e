#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Maritime incident sources.
//!
//! Each external source implements [`collector::SourceCollector`], which
//! describes how to build requests, pull raw records out of a response, and
//! map them into the partial canonical shape. Source definitions live in
//! embedded TOML files (see [`registry`]). Shared stages follow: the
//! [`standardize`] step produces canonical incidents, [`validate`] checks
//! them, and [`reference`] supplies region and type lookups.

pub mod collector;
pub mod parsing;
pub mod reference;
pub mod registry;
pub mod retry;
pub mod source_def;
pub mod sources;
pub mod standardize;
pub mod type_mapping;
pub mod validate;

pub use collector::{Extraction, SourceCollector};
pub use retry::{FetchError, Fetcher, RetryOptions};

/// Errors that can occur while collecting from a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The HTTP fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The response did not have the expected shape.
    #[error("Malformed response from {source_id}: {message}")]
    MalformedResponse {
        /// Source that produced the response.
        source_id: String,
        /// Description of what was missing.
        message: String,
    },

    /// A source definition is invalid.
    #[error("Invalid source configuration: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },

    /// TOML parsing failed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SourceError {
    /// Shorthand for [`SourceError::MalformedResponse`].
    #[must_use]
    pub fn malformed(source_id: &str, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}
