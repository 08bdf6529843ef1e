//! Reference data resolver: maritime regions, vessel types, incident types.
//!
//! Tables come from (in order) the cache, an optional remote endpoint, or
//! the copies embedded from `packages/source/reference/`. Whatever is
//! loaded is written back to the cache under `reference-{table}`, where it
//! stays fresh for a day. Lookups never fail: an unknown position is
//! [`UNCLASSIFIED_REGION`] and unknown type text is [`OTHER_TYPE`].

use seawatch_cache::{CacheStore, keys};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strum_macros::{AsRefStr, Display, EnumIter};

use crate::{
    Fetcher, RetryOptions,
    type_mapping::{KeywordRule, classify},
};
use seawatch_source_models::SourceRequest;

/// Region reported for positions outside every known box.
pub const UNCLASSIFIED_REGION: &str = "Unclassified";

/// Type reported for text that matches no rule.
pub const OTHER_TYPE: &str = "Other";

const REGIONS_TOML: &str = include_str!("../reference/regions.toml");
const VESSEL_TYPES_TOML: &str = include_str!("../reference/vessel_types.toml");
const INCIDENT_TYPES_TOML: &str = include_str!("../reference/incident_types.toml");

/// The reference tables the resolver knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum ReferenceTable {
    /// Named maritime bounding boxes.
    Regions,
    /// Vessel type keywords.
    VesselTypes,
    /// Incident type keywords.
    IncidentTypes,
}

/// A named lat/lon bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Region name.
    pub name: String,
    /// Southern edge.
    pub min_lat: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Western edge.
    pub min_lon: f64,
    /// Eastern edge. Smaller than `min_lon` for boxes spanning the
    /// antimeridian.
    pub max_lon: f64,
}

impl Region {
    /// Returns `true` if the position lies inside the box (edges inclusive).
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if lat < self.min_lat || lat > self.max_lat {
            return false;
        }
        if self.min_lon <= self.max_lon {
            lon >= self.min_lon && lon <= self.max_lon
        } else {
            lon >= self.min_lon || lon <= self.max_lon
        }
    }
}

/// Ordered region boxes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionTable {
    /// Boxes, first match wins.
    pub regions: Vec<Region>,
}

/// Ordered keyword rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeTable {
    /// Rules, first match wins.
    pub types: Vec<KeywordRule>,
}

/// Where to fetch fresh tables from: `{base_url}/{table}.json`.
#[derive(Debug, Clone)]
pub struct RemoteReference {
    /// Shared fetcher.
    pub fetcher: Fetcher,
    /// Base URL of the reference endpoint.
    pub base_url: String,
    /// Retry settings for table fetches.
    pub options: RetryOptions,
}

/// Resolves coordinates and free text against the reference tables.
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    regions: RegionTable,
    vessel_types: TypeTable,
    incident_types: TypeTable,
}

fn parse_builtin<T: DeserializeOwned + Default>(table: ReferenceTable, text: &str) -> T {
    toml::from_str(text).unwrap_or_else(|e| {
        log::error!("Built-in reference table {table} is malformed: {e}");
        T::default()
    })
}

impl ReferenceResolver {
    /// A resolver over the embedded tables only.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            regions: parse_builtin(ReferenceTable::Regions, REGIONS_TOML),
            vessel_types: parse_builtin(ReferenceTable::VesselTypes, VESSEL_TYPES_TOML),
            incident_types: parse_builtin(ReferenceTable::IncidentTypes, INCIDENT_TYPES_TOML),
        }
    }

    /// A resolver over explicit tables.
    #[must_use]
    pub const fn from_tables(
        regions: RegionTable,
        vessel_types: TypeTable,
        incident_types: TypeTable,
    ) -> Self {
        Self {
            regions,
            vessel_types,
            incident_types,
        }
    }

    /// Loads every table through the cache, falling back to `remote` and
    /// then to the embedded copies. Never fails.
    pub async fn load(store: &CacheStore, remote: Option<&RemoteReference>) -> Self {
        let builtin = Self::builtin();
        Self {
            regions: load_table(store, remote, ReferenceTable::Regions, builtin.regions).await,
            vessel_types: load_table(
                store,
                remote,
                ReferenceTable::VesselTypes,
                builtin.vessel_types,
            )
            .await,
            incident_types: load_table(
                store,
                remote,
                ReferenceTable::IncidentTypes,
                builtin.incident_types,
            )
            .await,
        }
    }

    /// Region containing the position, or [`UNCLASSIFIED_REGION`].
    #[must_use]
    pub fn region_for(&self, lat: f64, lon: f64) -> String {
        if !lat.is_finite() || !lon.is_finite() {
            return UNCLASSIFIED_REGION.to_string();
        }
        self.regions
            .regions
            .iter()
            .find(|region| region.contains(lat, lon))
            .map_or_else(|| UNCLASSIFIED_REGION.to_string(), |region| region.name.clone())
    }

    /// Canonical vessel type for `raw`, or [`OTHER_TYPE`].
    #[must_use]
    pub fn vessel_type(&self, raw: &str) -> String {
        classify(raw, &self.vessel_types.types)
            .unwrap_or(OTHER_TYPE)
            .to_string()
    }

    /// Canonical incident type for `raw`, or [`OTHER_TYPE`].
    #[must_use]
    pub fn incident_type(&self, raw: &str) -> String {
        classify(raw, &self.incident_types.types)
            .unwrap_or(OTHER_TYPE)
            .to_string()
    }

    /// Number of region boxes loaded.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.regions.len()
    }
}

trait Table: Serialize + DeserializeOwned + Send + Sync {
    fn is_empty(&self) -> bool;
}

impl Table for RegionTable {
    fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Table for TypeTable {
    fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

async fn load_table<T: Table>(
    store: &CacheStore,
    remote: Option<&RemoteReference>,
    table: ReferenceTable,
    builtin: T,
) -> T {
    let key = keys::reference(table.as_ref());
    if let Some(cached) = store.get_as::<T>(&key).await
        && !cached.is_empty()
    {
        log::debug!("Reference table {table} served from cache");
        return cached;
    }

    let loaded = match remote {
        Some(remote) => match fetch_remote::<T>(remote, table).await {
            Ok(fetched) if !fetched.is_empty() => {
                log::info!("Loaded reference table {table} from {}", remote.base_url);
                fetched
            }
            Ok(_) => {
                log::warn!("Remote reference table {table} is empty, using built-in");
                builtin
            }
            Err(e) => {
                log::warn!("Failed to load reference table {table}, using built-in: {e}");
                builtin
            }
        },
        None => builtin,
    };

    if let Err(e) = store.store_as(&key, &loaded).await {
        log::warn!("Failed to cache reference table {table}: {e}");
    }
    loaded
}

async fn fetch_remote<T: DeserializeOwned>(
    remote: &RemoteReference,
    table: ReferenceTable,
) -> Result<T, crate::SourceError> {
    let url = format!("{}/{table}.json", remote.base_url.trim_end_matches('/'));
    let payload = remote
        .fetcher
        .fetch(&SourceRequest::get(url), &remote.options)
        .await?;
    let json = payload
        .as_json()
        .cloned()
        .ok_or_else(|| crate::SourceError::malformed("reference", "expected JSON table"))?;
    Ok(serde_json::from_value(json)?)
}
