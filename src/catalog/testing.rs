//! Scripted in-memory catalog for tests.
use crate::aoi::Polygon;
use crate::catalog::{Catalog, ExportDestination, JobHandle, RemoteJobStatus, TileStream};
use crate::error::{Error, Result};
use crate::export::JobState;
use crate::tile::{BandMapping, CloudCover, DateRange, TileId};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What a single `fetch_tile_bytes` call does.
#[derive(Debug, Clone)]
pub enum FetchScript {
    Chunks(Vec<Vec<u8>>),
    /// Fails to connect with a transient error.
    Transient,
    /// Delivers the chunks, then breaks with a transient error.
    BreakAfter(Vec<Vec<u8>>),
    NonRetryable,
    /// Sleeps before answering, to outlast a request timeout.
    Stall(Duration),
    Panic,
}

#[derive(Default)]
pub struct MockCatalog {
    /// Tile ids per polygon label.
    tiles: HashMap<String, Vec<String>>,
    query_failures: AtomicU32,
    fetch_scripts: Mutex<HashMap<String, VecDeque<FetchScript>>>,
    fetch_calls: Mutex<HashMap<String, u32>>,
    job_scripts: Mutex<HashMap<String, VecDeque<RemoteJobStatus>>>,
    rejected_exports: Mutex<BTreeSet<String>>,
    status_calls: AtomicU32,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tiles(mut self, label: &str, ids: &[&str]) -> Self {
        self.tiles
            .insert(label.to_string(), ids.iter().map(|s| s.to_string()).collect());
        self
    }

    /// The next `n` queries fail with a transient error.
    pub fn with_query_failures(self, n: u32) -> Self {
        self.query_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn script_fetch(&self, id: &str, scripts: Vec<FetchScript>) {
        self.fetch_scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), scripts.into());
    }

    /// Statuses reported for the export of `id`; the last one repeats.
    pub fn script_job(&self, id: &str, states: Vec<RemoteJobStatus>) {
        self.job_scripts
            .lock()
            .unwrap()
            .insert(job_name(id), states.into());
    }

    pub fn reject_export(&self, id: &str) {
        self.rejected_exports.lock().unwrap().insert(id.to_string());
    }

    pub fn fetch_calls(&self, id: &str) -> u32 {
        self.fetch_calls
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

pub fn status(state: JobState, error_message: Option<&str>) -> RemoteJobStatus {
    RemoteJobStatus {
        state,
        error_message: error_message.map(str::to_string),
    }
}

pub fn payload(id: &str) -> Vec<u8> {
    format!("II*\0{id}").into_bytes()
}

fn job_name(id: &str) -> String {
    format!("projects/test/operations/{id}")
}

#[async_trait]
impl Catalog for MockCatalog {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query_tiles(
        &self,
        polygon: &Polygon,
        _dates: &DateRange,
        _cloud_cover: CloudCover,
    ) -> Result<BTreeSet<TileId>> {
        let remaining = self.query_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.query_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientTransport("connection reset".to_string()));
        }
        let label = polygon.label().unwrap_or_default();
        self.tiles
            .get(label)
            .into_iter()
            .flatten()
            .map(|id| TileId::new(id.as_str()))
            .collect()
    }

    async fn fetch_tile_bytes(&self, tile_id: &TileId, _bands: &BandMapping) -> Result<TileStream> {
        *self
            .fetch_calls
            .lock()
            .unwrap()
            .entry(tile_id.to_string())
            .or_default() += 1;
        let script = self
            .fetch_scripts
            .lock()
            .unwrap()
            .get_mut(tile_id.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| FetchScript::Chunks(vec![payload(tile_id.as_str())]));

        let ok_chunks = |chunks: Vec<Vec<u8>>| {
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from(c)))
                .collect::<Vec<Result<Bytes>>>()
        };
        match script {
            FetchScript::Chunks(chunks) => Ok(stream::iter(ok_chunks(chunks)).boxed()),
            FetchScript::BreakAfter(chunks) => {
                let mut items = ok_chunks(chunks);
                items.push(Err(Error::TransientTransport("stream reset".to_string())));
                Ok(stream::iter(items).boxed())
            }
            FetchScript::Transient => Err(Error::TransientTransport("connect timeout".to_string())),
            FetchScript::NonRetryable => Err(Error::NonRetryableFetch(format!(
                "malformed catalog response for {tile_id}"
            ))),
            FetchScript::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(stream::iter(ok_chunks(vec![payload(tile_id.as_str())])).boxed())
            }
            FetchScript::Panic => panic!("worker blew up on {tile_id}"),
        }
    }

    async fn submit_export_job(
        &self,
        tile_id: &TileId,
        _bands: &BandMapping,
        _destination: &ExportDestination,
    ) -> Result<JobHandle> {
        if self.rejected_exports.lock().unwrap().contains(tile_id.as_str()) {
            return Err(Error::NonRetryableFetch(format!(
                "export of {tile_id} rejected"
            )));
        }
        Ok(JobHandle::new(job_name(tile_id.as_str())))
    }

    async fn job_status(&self, job: &JobHandle) -> Result<RemoteJobStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.job_scripts.lock().unwrap();
        let queue = scripts
            .get_mut(job.as_str())
            .ok_or_else(|| Error::NonRetryableFetch(format!("unknown job {job}")))?;
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.ok_or_else(|| Error::NonRetryableFetch(format!("no status for {job}")))
    }
}
