//! Earth Engine REST catalog for the harmonized Sentinel-2 surface
//! reflectance collection.
use crate::aoi::Polygon;
use crate::catalog::{Catalog, ExportDestination, JobHandle, RemoteJobStatus, TileStream};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::export::JobState;
use crate::tile::{BandMapping, CloudCover, DateRange, TileId};
use async_trait::async_trait;
use chrono::SecondsFormat;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://earthengine.googleapis.com/v1";
const HIGH_VOLUME_ENDPOINT: &str = "https://earthengine-highvolume.googleapis.com/v1";
const PUBLIC_PROJECT: &str = "earthengine-public";
pub const S2_SR_HARMONIZED: &str = "COPERNICUS/S2_SR_HARMONIZED";
const CLOUD_COVER_PROPERTY: &str = "CLOUDY_PIXEL_PERCENTAGE";
const PAGE_SIZE: u32 = 1000;
const MAX_PIXELS: &str = "10000000000000";
const MEGABYTE: u64 = 1024 * 1024;
/// Largest payload `getPixels` serves in one request.
const GET_PIXELS_MAX_BYTES: u64 = 48 * MEGABYTE;

#[derive(Debug, Clone)]
pub struct EarthEngineOptions {
    /// Cloud project billed for the requests.
    pub project: String,
    pub collection: String,
    pub high_volume: bool,
    pub request_timeout: Duration,
}

impl EarthEngineOptions {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            collection: S2_SR_HARMONIZED.to_string(),
            high_volume: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct EarthEngineCatalog {
    client: reqwest::Client,
    endpoint: String,
    options: EarthEngineOptions,
    credentials: Credentials,
}

impl EarthEngineCatalog {
    pub fn new(credentials: Credentials, options: EarthEngineOptions) -> Result<Self> {
        let endpoint = if options.high_volume {
            HIGH_VOLUME_ENDPOINT
        } else {
            DEFAULT_ENDPOINT
        };
        Self::with_endpoint(credentials, options, endpoint)
    }

    pub fn with_endpoint(
        credentials: Credentials,
        options: EarthEngineOptions,
        endpoint: &str,
    ) -> Result<Self> {
        if options.project.is_empty() {
            return Err(Error::Config(
                "Earth Engine needs a cloud project to bill requests to".to_string(),
            ));
        }
        // Downloads are bounded per chunk by the fetcher, so only connecting is capped here
        let client = reqwest::Client::builder()
            .connect_timeout(options.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Unable to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            options,
            credentials,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(
                reqwest::header::AUTHORIZATION,
                self.credentials.authorization_header(),
            )
            .header("x-goog-user-project", &self.options.project)
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/projects/{PUBLIC_PROJECT}/assets/{}",
            self.endpoint, self.options.collection
        )
    }

    fn asset_id(&self, tile_id: &TileId) -> String {
        format!("{}/{tile_id}", self.options.collection)
    }

    async fn list_page(
        &self,
        polygon: &Polygon,
        dates: &DateRange,
        cloud_cover: CloudCover,
        page_token: Option<&str>,
    ) -> Result<ListImagesResponse> {
        let params = list_params(polygon, dates, cloud_cover, page_token);
        let request = self
            .client
            .get(format!("{}:listImages", self.collection_url()))
            .query(&params)
            .timeout(self.options.request_timeout);
        let response = check(self.authorized(request).send().await?).await?;
        parse_json(response).await
    }

    async fn image_info(&self, tile_id: &TileId) -> Result<ImageMetadata> {
        let request = self
            .client
            .get(format!(
                "{}/projects/{PUBLIC_PROJECT}/assets/{}",
                self.endpoint,
                self.asset_id(tile_id)
            ))
            .timeout(self.options.request_timeout);
        let response = check(self.authorized(request).send().await?).await?;
        parse_json(response).await
    }

    /// One cheap authorized request, so a rejected token surfaces as
    /// [`Error::Credentials`] before any tile work starts.
    pub async fn verify_credentials(&self) -> Result<()> {
        let request = self
            .client
            .get(self.collection_url())
            .timeout(self.options.request_timeout);
        check(self.authorized(request).send().await?).await?;
        debug!(project = %self.options.project, "Earth Engine accepted the credentials");
        Ok(())
    }
}

fn list_params(
    polygon: &Polygon,
    dates: &DateRange,
    cloud_cover: CloudCover,
    page_token: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        (
            "startTime",
            dates.start().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        (
            "endTime",
            dates.end().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("region", polygon.to_geojson().to_string()),
        (
            "filter",
            format!("properties.{CLOUD_COVER_PROPERTY} < {}", cloud_cover.percent()),
        ),
        ("pageSize", PAGE_SIZE.to_string()),
    ];
    if let Some(token) = page_token {
        params.push(("pageToken", token.to_string()));
    }
    params
}

#[async_trait]
impl Catalog for EarthEngineCatalog {
    fn name(&self) -> &str {
        "earth-engine"
    }

    async fn query_tiles(
        &self,
        polygon: &Polygon,
        dates: &DateRange,
        cloud_cover: CloudCover,
    ) -> Result<BTreeSet<TileId>> {
        let mut ids = BTreeSet::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_page(polygon, dates, cloud_cover, page_token.as_deref())
                .await?;
            for image in &page.images {
                ids.insert(image.system_index(&self.options.collection)?);
            }
            debug!(images = page.images.len(), total = ids.len(), "Listed catalog page");
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(ids)
    }

    async fn fetch_tile_bytes(&self, tile_id: &TileId, bands: &BandMapping) -> Result<TileStream> {
        let size = self.image_info(tile_id).await?.payload_bytes(bands)?;
        if size > GET_PIXELS_MAX_BYTES {
            return Err(Error::Unsupported(format!(
                "{tile_id} is about {} MB for {} bands, over the {} MB getPixels limit; \
                 run with mode = \"export\" instead",
                size / MEGABYTE,
                bands.len(),
                GET_PIXELS_MAX_BYTES / MEGABYTE
            )));
        }
        debug!(tile_id = %tile_id, bytes = size, "Requesting pixels");

        let url = format!(
            "{}/projects/{PUBLIC_PROJECT}/assets/{}:getPixels",
            self.endpoint,
            self.asset_id(tile_id)
        );
        // No grid: the tile keeps its native projection and resolution
        let body = json!({
            "fileFormat": "GEO_TIFF",
            "bandIds": bands.remote_bands(),
        });
        let response = check(self.authorized(self.client.post(url).json(&body)).send().await?).await?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        if is_json {
            let text = response.text().await?;
            return Err(Error::NonRetryableFetch(format!(
                "Expected GeoTIFF pixels for {tile_id}, got: {text}"
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }

    async fn submit_export_job(
        &self,
        tile_id: &TileId,
        bands: &BandMapping,
        destination: &ExportDestination,
    ) -> Result<JobHandle> {
        let url = format!(
            "{}/projects/{}/image:export",
            self.endpoint, self.options.project
        );
        let body = export_request(&self.asset_id(tile_id), tile_id, bands, destination);
        let request = self
            .client
            .post(url)
            .json(&body)
            .timeout(self.options.request_timeout);
        let response = check(self.authorized(request).send().await?).await?;
        let operation: Operation = parse_json(response).await?;
        Ok(JobHandle::new(operation.name))
    }

    async fn job_status(&self, job: &JobHandle) -> Result<RemoteJobStatus> {
        let request = self
            .client
            .get(format!("{}/{}", self.endpoint, job.as_str()))
            .timeout(self.options.request_timeout);
        let response = check(self.authorized(request).send().await?).await?;
        let operation: Operation = parse_json(response).await?;
        Ok(operation.status())
    }
}

/// Turn non-success responses into classified errors, keeping the body text.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(classify_status(status, &text))
}

fn classify_status(status: StatusCode, text: &str) -> Error {
    let message = format!("Earth Engine responded {status}: {text}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Credentials(message),
        StatusCode::TOO_MANY_REQUESTS => Error::TransientTransport(message),
        s if s.is_server_error() => Error::TransientTransport(message),
        _ => Error::NonRetryableFetch(message),
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::NonRetryableFetch(format!("Malformed catalog response: {e}")))
}

/// Serialized `Image.select(Image.load(asset), bands, channels)` graph.
fn select_expression(asset_id: &str, bands: &BandMapping) -> Value {
    json!({
        "result": "0",
        "values": {
            "0": {
                "functionInvocationValue": {
                    "functionName": "Image.select",
                    "arguments": {
                        "input": {
                            "functionInvocationValue": {
                                "functionName": "Image.load",
                                "arguments": { "id": { "constantValue": asset_id } }
                            }
                        },
                        "bandSelectors": { "constantValue": bands.remote_bands() },
                        "newNames": { "constantValue": bands.channels() }
                    }
                }
            }
        }
    })
}

fn export_request(
    asset_id: &str,
    tile_id: &TileId,
    bands: &BandMapping,
    destination: &ExportDestination,
) -> Value {
    let prefix = destination.file_prefix(tile_id);
    let mut options = json!({ "fileFormat": "GEO_TIFF" });
    match destination {
        ExportDestination::Drive { folder } => {
            options["driveDestination"] = json!({ "folder": folder, "filenamePrefix": prefix });
        }
        ExportDestination::CloudStorage { bucket, .. } => {
            options["cloudStorageDestination"] =
                json!({ "bucket": bucket, "filenamePrefix": prefix });
        }
    }
    json!({
        "expression": select_expression(asset_id, bands),
        "description": format!("S2_{tile_id}"),
        "fileExportOptions": options,
        "maxPixels": MAX_PIXELS,
    })
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListImagesResponse {
    images: Vec<ImageInfo>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(default)]
    id: Option<String>,
    name: String,
}

impl ImageInfo {
    /// The "system:index" of the image: its id relative to the collection.
    fn system_index(&self, collection: &str) -> Result<TileId> {
        let from_id = self
            .id
            .as_deref()
            .and_then(|id| id.strip_prefix(collection))
            .and_then(|rest| rest.strip_prefix('/'));
        let index = match from_id {
            Some(index) => index,
            None => self.name.rsplit('/').next().unwrap_or_default(),
        };
        TileId::new(index).map_err(|e| {
            Error::NonRetryableFetch(format!("Catalog returned an unusable image name: {e}"))
        })
    }
}

/// The parts of an image asset needed to size a pixel download.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ImageMetadata {
    bands: Vec<BandInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BandInfo {
    id: String,
    #[serde(default)]
    data_type: Option<PixelType>,
    #[serde(default)]
    grid: Option<BandGrid>,
}

#[derive(Debug, Deserialize)]
struct PixelType {
    #[serde(default)]
    precision: Option<String>,
    #[serde(default)]
    range: Option<PixelRange>,
}

#[derive(Debug, Deserialize)]
struct PixelRange {
    #[serde(default)]
    min: f64,
    #[serde(default)]
    max: f64,
}

#[derive(Debug, Deserialize)]
struct BandGrid {
    dimensions: GridDimensions,
}

#[derive(Debug, Deserialize)]
struct GridDimensions {
    width: u64,
    height: u64,
}

impl PixelType {
    fn bytes_per_pixel(&self) -> u64 {
        match self.precision.as_deref() {
            Some("FLOAT") => 4,
            Some("DOUBLE") => 8,
            _ => {
                let span = self.range.as_ref().map_or(f64::MAX, |r| r.max - r.min);
                if span <= u8::MAX as f64 {
                    1
                } else if span <= u16::MAX as f64 {
                    2
                } else if span <= u32::MAX as f64 {
                    4
                } else {
                    8
                }
            }
        }
    }
}

impl ImageMetadata {
    /// Uncompressed size of the selected bands in their native grids.
    fn payload_bytes(&self, bands: &BandMapping) -> Result<u64> {
        let mut total = 0_u64;
        for name in bands.remote_bands() {
            let band = self.bands.iter().find(|b| b.id == name).ok_or_else(|| {
                Error::NonRetryableFetch(format!("Image has no band named {name}"))
            })?;
            let pixels = band
                .grid
                .as_ref()
                .map_or(0, |g| g.dimensions.width * g.dimensions.height);
            let depth = band.data_type.as_ref().map_or(8, PixelType::bytes_per_pixel);
            total = total.saturating_add(pixels.saturating_mul(depth));
        }
        Ok(total)
    }
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    message: Option<String>,
}

impl Operation {
    fn status(&self) -> RemoteJobStatus {
        let state = self
            .metadata
            .as_ref()
            .and_then(|m| m.state.as_deref())
            .unwrap_or("PENDING");
        let mut state = match state {
            "PENDING" => JobState::Ready,
            "RUNNING" | "CANCELLING" => JobState::Running,
            "SUCCEEDED" => JobState::Completed,
            "CANCELLED" => JobState::Canceled,
            "FAILED" => JobState::Failed,
            _ => JobState::Running,
        };
        let error_message = self.error.as_ref().map(|e| {
            e.message
                .clone()
                .unwrap_or_else(|| "No error message".to_string())
        });
        if self.done && !state.is_terminal() {
            state = if error_message.is_some() {
                JobState::Failed
            } else {
                JobState::Completed
            };
        }
        RemoteJobStatus {
            state,
            error_message,
        }
    }
}
