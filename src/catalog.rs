//! The remote imagery catalog, seen from the acquisition engine.
//!
//! A catalog answers three questions: which tiles intersect a polygon, what
//! are the bytes of a tile, and can the provider materialise a tile somewhere
//! else on its own. Everything provider specific (endpoints, auth, wire
//! formats) stays behind the [`Catalog`] trait.
use crate::aoi::Polygon;
use crate::error::{Error, Result};
use crate::export::JobState;
use crate::tile::{BandMapping, CloudCover, DateRange, TileId};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub mod earth_engine;
pub mod earth_search;
mod s3;
#[cfg(test)]
pub(crate) mod testing;

pub use earth_engine::EarthEngineCatalog;
pub use earth_search::StacCatalog;

/// Payload of one tile, delivered in chunks as they arrive.
pub type TileStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait Catalog: Send + Sync {
    fn name(&self) -> &str;

    async fn query_tiles(
        &self,
        polygon: &Polygon,
        dates: &DateRange,
        cloud_cover: CloudCover,
    ) -> Result<BTreeSet<TileId>>;

    async fn fetch_tile_bytes(&self, tile_id: &TileId, bands: &BandMapping) -> Result<TileStream>;

    async fn submit_export_job(
        &self,
        tile_id: &TileId,
        bands: &BandMapping,
        destination: &ExportDestination,
    ) -> Result<JobHandle>;

    async fn job_status(&self, job: &JobHandle) -> Result<RemoteJobStatus>;
}

/// Provider reference to a submitted export, e.g. an operation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJobStatus {
    pub state: JobState,
    pub error_message: Option<String>,
}

/// Where an export job writes its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExportDestination {
    Drive { folder: String },
    CloudStorage { bucket: String, prefix: Option<String> },
}

impl ExportDestination {
    /// File name prefix for the export of `tile_id` at this destination.
    pub fn file_prefix(&self, tile_id: &TileId) -> String {
        let name = format!("S2_{tile_id}");
        match self {
            Self::CloudStorage {
                prefix: Some(prefix),
                ..
            } => format!("{}/{name}", prefix.trim_end_matches('/')),
            _ => name,
        }
    }
}

impl FromStr for ExportDestination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(folder) = s.strip_prefix("drive:") {
            if folder.is_empty() {
                return Err(Error::Config("Drive destination needs a folder name".to_string()));
            }
            return Ok(Self::Drive {
                folder: folder.to_string(),
            });
        }
        let re = Regex::new(r"^gs://(?<bucket>[a-z0-9][a-z0-9._-]{1,220}[a-z0-9])(?:/(?<prefix>.*))?$")
            .expect("Regex pattern should always compile");
        let captures = re.captures(s).ok_or_else(|| {
            Error::Config(format!(
                "Export destination must be 'drive:<folder>' or 'gs://<bucket>[/<prefix>]', got {s:?}"
            ))
        })?;
        let bucket = captures["bucket"].to_string();
        let prefix = captures
            .name("prefix")
            .map(|m| m.as_str().trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Ok(Self::CloudStorage { bucket, prefix })
    }
}

impl fmt::Display for ExportDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drive { folder } => write!(f, "drive:{folder}"),
            Self::CloudStorage {
                bucket,
                prefix: None,
            } => write!(f, "gs://{bucket}"),
            Self::CloudStorage {
                bucket,
                prefix: Some(prefix),
            } => write!(f, "gs://{bucket}/{prefix}"),
        }
    }
}

impl TryFrom<String> for ExportDestination {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExportDestination> for String {
    fn from(destination: ExportDestination) -> Self {
        destination.to_string()
    }
}
