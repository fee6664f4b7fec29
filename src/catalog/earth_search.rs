//! STAC API catalog backed by Element84 Earth Search, with tile payloads read
//! from the public S3 buckets the STAC assets point to.
//!
//! Earth Search stores every band as a separate cloud optimised GeoTIFF, so a
//! fetch has to name exactly one asset key (e.g. `visual` or `nir`). Export
//! jobs do not exist on this provider.
use crate::aoi::Polygon;
use crate::catalog::s3::{self, S3Object};
use crate::catalog::{Catalog, ExportDestination, JobHandle, RemoteJobStatus, TileStream};
use crate::error::{Error, Result};
use crate::tile::{BandMapping, CloudCover, DateRange, TileId};
use ::stac::{Item, ItemCollection};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;
use url::Url;

const SEARCH_API: &str = "https://earth-search.aws.element84.com/v1";
pub const SENTINEL_2_C1_L2A: &str = "sentinel-2-c1-l2a";
const PAGE_LIMIT: u32 = 100;

pub struct StacCatalog {
    client: reqwest::Client,
    api: Url,
    collection: String,
    request_timeout: Duration,
}

impl StacCatalog {
    pub fn new(collection: &str, request_timeout: Duration) -> Result<Self> {
        Self::with_api(SEARCH_API, collection, request_timeout)
    }

    pub fn with_api(api: &str, collection: &str, request_timeout: Duration) -> Result<Self> {
        let api = Url::parse(&format!("{}/", api.trim_end_matches('/')))
            .map_err(|e| Error::Config(format!("Invalid STAC API url {api}: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Unable to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api,
            collection: collection.to_string(),
            request_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid STAC endpoint {path}: {e}")))
    }

    async fn fetch_single_item(&self, id: &TileId) -> Result<Item> {
        let url = self.endpoint(&format!("collections/{}/items/{id}", self.collection))?;
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        response
            .json::<Item>()
            .await
            .map_err(|e| Error::NonRetryableFetch(format!("Malformed STAC item {id}: {e}")))
    }

    async fn search_page(&self, url: Url, body: &Value) -> Result<ItemCollection> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        response
            .json::<ItemCollection>()
            .await
            .map_err(|e| Error::NonRetryableFetch(format!("Malformed STAC search response: {e}")))
    }
}

#[async_trait]
impl Catalog for StacCatalog {
    fn name(&self) -> &str {
        "earth-search"
    }

    async fn query_tiles(
        &self,
        polygon: &Polygon,
        dates: &DateRange,
        cloud_cover: CloudCover,
    ) -> Result<BTreeSet<TileId>> {
        let mut url = self.endpoint("search")?;
        let mut body = search_body(&self.collection, polygon, dates, cloud_cover);
        let mut ids = BTreeSet::new();

        loop {
            let page = self.search_page(url.clone(), &body).await?;
            for item in &page.items {
                ids.insert(TileId::new(item.id.as_str())?);
            }
            debug!(items = page.items.len(), total = ids.len(), "Searched STAC page");

            let next = page
                .links
                .iter()
                .filter_map(|link| serde_json::to_value(link).ok())
                .find(|link| link.get("rel").and_then(Value::as_str) == Some("next"));
            match next.and_then(|link| next_request(&link, &body)) {
                Some((next_url, next_body)) if !page.items.is_empty() => {
                    url = next_url;
                    body = next_body;
                }
                _ => break,
            }
        }
        Ok(ids)
    }

    async fn fetch_tile_bytes(&self, tile_id: &TileId, bands: &BandMapping) -> Result<TileStream> {
        let asset_key = match bands.remote_bands().as_slice() {
            [single] => single.to_string(),
            _ => {
                return Err(Error::Unsupported(format!(
                    "{} stores bands as separate assets; select exactly one band, got {}",
                    self.name(),
                    bands.len()
                )))
            }
        };

        let item = self.fetch_single_item(tile_id).await?;
        let asset = item.assets.get(&asset_key).ok_or_else(|| {
            Error::NonRetryableFetch(format!("Item {tile_id} has no asset named {asset_key}"))
        })?;
        let object = S3Object::from_url(&asset.href)?;
        debug!(tile_id = %tile_id, bucket = %object.bucket, key = %object.key, "Streaming asset");

        let client = s3::anon_client(&object.region).await;
        s3::stream_object(&client, &object).await
    }

    async fn submit_export_job(
        &self,
        _tile_id: &TileId,
        _bands: &BandMapping,
        _destination: &ExportDestination,
    ) -> Result<JobHandle> {
        Err(Error::Unsupported(format!(
            "{} does not run server-side export jobs",
            self.name()
        )))
    }

    async fn job_status(&self, job: &JobHandle) -> Result<RemoteJobStatus> {
        Err(Error::Unsupported(format!(
            "{} has no export job {job}",
            self.name()
        )))
    }
}

fn search_body(
    collection: &str,
    polygon: &Polygon,
    dates: &DateRange,
    cloud_cover: CloudCover,
) -> Value {
    // STAC datetime intervals are closed; stop one millisecond short of the end instant
    let end = dates.end() - chrono::Duration::milliseconds(1);
    json!({
        "collections": [collection],
        "intersects": polygon.to_geojson(),
        "datetime": format!(
            "{}/{}",
            dates.start().to_rfc3339_opts(SecondsFormat::Millis, true),
            end.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
        "query": { "eo:cloud_cover": { "lt": cloud_cover.percent() } },
        "limit": PAGE_LIMIT,
    })
}

/// Follow a `next` link: POST links carry a replacement (or mergeable) body.
fn next_request(link: &Value, body: &Value) -> Option<(Url, Value)> {
    let href = Url::parse(link.get("href")?.as_str()?).ok()?;
    let method = link.get("method").and_then(Value::as_str).unwrap_or("GET");
    if !method.eq_ignore_ascii_case("POST") {
        // GET links encode the whole query in the url, which this client does not replay
        return None;
    }
    let link_body = link.get("body").and_then(Value::as_object)?;
    let merge = link.get("merge").and_then(Value::as_bool).unwrap_or(false);
    let next_body = if merge {
        let mut merged = body.as_object()?.clone();
        merged.extend(link_body.clone());
        Value::Object(merged)
    } else {
        Value::Object(link_body.clone())
    };
    Some((href, next_body))
}
