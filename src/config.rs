//! Acquisition settings, read from a TOML file and validated once before a run.
use crate::catalog::ExportDestination;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::tile::{BandMapping, CloudCover, DateRange};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Download tiles into the cache directory.
    #[default]
    Fetch,
    /// Let the provider write tiles to a remote destination.
    Export,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    #[default]
    EarthEngine,
    EarthSearch,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionConfig {
    pub aoi: PathBuf,
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_max_cloud_cover")]
    pub max_cloud_cover: f64,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tiles: Option<usize>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default = "default_bands")]
    pub bands: Vec<Band>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Cloud project for Earth Engine; falls back to the credentials file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default = "default_true")]
    pub high_volume: bool,
    #[serde(default = "default_credentials")]
    pub credentials: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            project: None,
            collection: None,
            high_volume: true,
            credentials: default_credentials(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    /// Give up waiting after this long; unset waits for as long as jobs run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_spacing_secs: Option<f64>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            wait_for_completion: true,
            poll_interval_secs: default_poll_interval_secs(),
            deadline_secs: None,
            submit_spacing_secs: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Band {
    pub remote: String,
    pub channel: String,
}

fn default_max_cloud_cover() -> f64 {
    20.0
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("sentinel2_cache")
}

fn default_max_workers() -> usize {
    crate::coordinator::DEFAULT_MAX_WORKERS
}

fn default_true() -> bool {
    true
}

fn default_credentials() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    5.0
}

fn default_request_timeout_secs() -> f64 {
    30.0
}

fn default_destination() -> String {
    "drive:Sentinel2_Exports".to_string()
}

fn default_poll_interval_secs() -> f64 {
    60.0
}

fn default_bands() -> Vec<Band> {
    BandMapping::default()
        .pairs()
        .map(|(remote, channel)| Band {
            remote: remote.to_string(),
            channel: channel.to_string(),
        })
        .collect()
}

pub fn template() -> toml::Table {
    toml::toml! {
        // GeoJSON file with the AOI polygons; any CRS named in the file is reprojected to WGS84
        aoi = "inputs/aoi.geojson"

        start_date = "2024-07"

        end_date = "2024-09"

        max_cloud_cover = 20.0

        cache_dir = "sentinel2_cache"

        max_workers = 4

        mode = "fetch"

        [catalog]
        backend = "earth-engine"
        high_volume = true
        credentials = "credentials.json"

        [network]
        max_retries = 3
        base_delay_secs = 5.0
        request_timeout_secs = 30.0

        [export]
        destination = "drive:Sentinel2_Exports"
        wait_for_completion = true
        poll_interval_secs = 60.0

        [[bands]]
        remote = "B2"
        channel = "blue"

        [[bands]]
        remote = "B3"
        channel = "green"

        [[bands]]
        remote = "B4"
        channel = "red"

        [[bands]]
        remote = "B8"
        channel = "nir"
    }
}

impl AcquisitionConfig {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Unable to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {e}", path.display())))
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Unable to serialise config: {e}")))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        toml::from_str(&table.to_string())
            .map_err(|e| Error::Config(format!("Invalid config template: {e}")))
    }

    /// Check every value and convert it into the types the engine runs on.
    pub fn validate(&self) -> Result<Settings> {
        let dates = DateRange::parse(&self.start_date, &self.end_date)?;
        let cloud_cover = CloudCover::new(self.max_cloud_cover)?;
        let bands = BandMapping::new(
            self.bands
                .iter()
                .map(|b| (b.remote.as_str(), b.channel.as_str())),
        )?;
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        if self.max_tiles == Some(0) {
            return Err(Error::Config("max_tiles must be at least 1".to_string()));
        }
        let destination = match self.mode {
            Mode::Export => Some(self.export.destination.parse::<ExportDestination>()?),
            Mode::Fetch => None,
        };

        Ok(Settings {
            aoi: self.aoi.clone(),
            dates,
            cloud_cover,
            bands,
            cache_dir: self.cache_dir.clone(),
            max_workers: self.max_workers,
            max_tiles: self.max_tiles,
            mode: self.mode,
            retry: RetryPolicy {
                max_retries: self.network.max_retries,
                base_delay: seconds("network.base_delay_secs", self.network.base_delay_secs)?,
            },
            request_timeout: positive_seconds(
                "network.request_timeout_secs",
                self.network.request_timeout_secs,
            )?,
            destination,
            wait_for_completion: self.export.wait_for_completion,
            poll_interval: positive_seconds("export.poll_interval_secs", self.export.poll_interval_secs)?,
            export_deadline: self
                .export
                .deadline_secs
                .map(|s| positive_seconds("export.deadline_secs", s))
                .transpose()?,
            submit_spacing: self
                .export
                .submit_spacing_secs
                .map(|s| seconds("export.submit_spacing_secs", s))
                .transpose()?,
        })
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("{name} must be a non-negative number of seconds")))
}

fn positive_seconds(name: &str, value: f64) -> Result<Duration> {
    let duration = seconds(name, value)?;
    if duration.is_zero() {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(duration)
}

/// Validated, immutable settings for one acquisition run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub aoi: PathBuf,
    pub dates: DateRange,
    pub cloud_cover: CloudCover,
    pub bands: BandMapping,
    pub cache_dir: PathBuf,
    pub max_workers: usize,
    pub max_tiles: Option<usize>,
    pub mode: Mode,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub destination: Option<ExportDestination>,
    pub wait_for_completion: bool,
    pub poll_interval: Duration,
    pub export_deadline: Option<Duration>,
    pub submit_spacing: Option<Duration>,
}
