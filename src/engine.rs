//! One acquisition run: resolve the AOI into tiles, then fetch or export them.
use crate::aoi::AreaOfInterest;
use crate::cache::TileCache;
use crate::catalog::Catalog;
use crate::config::{Mode, Settings};
use crate::coordinator::ConcurrencyCoordinator;
use crate::error::{Error, Result};
use crate::export::{ExportJob, ExportJobTracker, ExportOutcome, PollSummary};
use crate::fetcher::{FetchResult, TileFetcher};
use crate::resolver::{first_n, TileIndexResolver};
use crate::tile::TileId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const REPORT_FILE_NAME: &str = "acquisition_report.json";

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub cached: usize,
    pub fetched: usize,
    pub failed: usize,
    pub tiles: BTreeMap<TileId, FetchResult>,
}

impl FetchReport {
    fn new(tiles: BTreeMap<TileId, FetchResult>) -> Self {
        let mut report = Self {
            cached: 0,
            fetched: 0,
            failed: 0,
            tiles: BTreeMap::new(),
        };
        for result in tiles.values() {
            match result {
                FetchResult::Cached(_) => report.cached += 1,
                FetchResult::Fetched(_) => report.fetched += 1,
                FetchResult::Failed(_) => report.failed += 1,
            }
        }
        report.tiles = tiles;
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub submitted: usize,
    pub failed_to_submit: usize,
    /// Absent when the run did not wait for the jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSummary>,
    pub tiles: BTreeMap<TileId, ExportOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AcquisitionReport {
    Fetch(FetchReport),
    Export(ExportReport),
}

impl AcquisitionReport {
    pub fn tile_count(&self) -> usize {
        match self {
            AcquisitionReport::Fetch(report) => report.tiles.len(),
            AcquisitionReport::Export(report) => report.tiles.len(),
        }
    }

    /// Tiles that ended without an artifact or a completed export.
    pub fn failures(&self) -> usize {
        match self {
            AcquisitionReport::Fetch(report) => report.failed,
            AcquisitionReport::Export(report) => match &report.poll {
                Some(poll) => {
                    report.failed_to_submit + poll.counts.failed + poll.counts.canceled
                }
                None => report.failed_to_submit,
            },
        }
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Unable to serialise report: {e}")))?;
        fs::write(path, content)?;
        Ok(())
    }

    fn log_summary(&self) {
        match self {
            AcquisitionReport::Fetch(report) => info!(
                tiles = report.tiles.len(),
                cached = report.cached,
                fetched = report.fetched,
                failed = report.failed,
                "Fetch finished"
            ),
            AcquisitionReport::Export(report) => match &report.poll {
                Some(poll) => info!(
                    tiles = report.tiles.len(),
                    submitted = report.submitted,
                    failed_to_submit = report.failed_to_submit,
                    completed = poll.counts.completed,
                    failed = poll.counts.failed,
                    canceled = poll.counts.canceled,
                    pending = poll.counts.pending(),
                    timed_out = poll.timed_out,
                    "Export finished"
                ),
                None => info!(
                    tiles = report.tiles.len(),
                    submitted = report.submitted,
                    failed_to_submit = report.failed_to_submit,
                    "Export jobs submitted"
                ),
            },
        }
    }
}

pub struct Engine {
    settings: Settings,
    catalog: Arc<dyn Catalog>,
}

impl Engine {
    pub fn new(settings: Settings, catalog: Arc<dyn Catalog>) -> Self {
        Self { settings, catalog }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Tile ids intersecting the AOI, limited to `max_tiles` if set.
    pub async fn resolve(&self) -> Result<BTreeSet<TileId>> {
        let aoi = AreaOfInterest::load(&self.settings.aoi)?;
        let tile_ids = TileIndexResolver::new(self.catalog.as_ref(), self.settings.retry)
            .resolve(&aoi, &self.settings.dates, self.settings.cloud_cover)
            .await?;

        let total = tile_ids.len();
        let tile_ids = first_n(tile_ids, self.settings.max_tiles);
        if tile_ids.len() < total {
            info!(selected = tile_ids.len(), total, "Limited run to the first tiles");
        }
        Ok(tile_ids)
    }

    pub async fn run(&self) -> Result<AcquisitionReport> {
        let tile_ids = self.resolve().await?;
        info!(
            tiles = tile_ids.len(),
            mode = ?self.settings.mode,
            workers = self.settings.max_workers,
            "Starting acquisition"
        );

        let report = match self.settings.mode {
            Mode::Fetch => AcquisitionReport::Fetch(self.fetch(&tile_ids).await?),
            Mode::Export => AcquisitionReport::Export(self.export(&tile_ids).await?),
        };
        report.log_summary();

        fs::create_dir_all(&self.settings.cache_dir)?;
        let path = self.settings.cache_dir.join(REPORT_FILE_NAME);
        report.write(&path)?;
        info!(path = %path.display(), "Wrote acquisition report");
        Ok(report)
    }

    async fn fetch(&self, tile_ids: &BTreeSet<TileId>) -> Result<FetchReport> {
        let cache = TileCache::open(&self.settings.cache_dir)?;
        let leftovers = cache.leftover_partials()?;
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "Ignoring partial downloads from an earlier run");
        }

        let fetcher = Arc::new(TileFetcher::new(
            Arc::clone(&self.catalog),
            cache,
            self.settings.retry,
            self.settings.request_timeout,
        ));
        let bands = self.settings.bands.clone();
        let results = ConcurrencyCoordinator::new(self.settings.max_workers)
            .run(tile_ids, move |tile_id| {
                let fetcher = Arc::clone(&fetcher);
                let bands = bands.clone();
                async move { fetcher.fetch(&tile_id, &bands).await }
            })
            .await;
        Ok(FetchReport::new(results))
    }

    async fn export(&self, tile_ids: &BTreeSet<TileId>) -> Result<ExportReport> {
        let destination = self
            .settings
            .destination
            .clone()
            .ok_or_else(|| Error::Config("Export mode needs an export destination".to_string()))?;

        let tracker = Arc::new(
            ExportJobTracker::new(Arc::clone(&self.catalog), self.settings.retry)
                .with_submit_spacing(self.settings.submit_spacing),
        );
        let submitter = Arc::clone(&tracker);
        let bands = self.settings.bands.clone();
        let mut tiles = ConcurrencyCoordinator::new(self.settings.max_workers)
            .run(tile_ids, move |tile_id| {
                let tracker = Arc::clone(&submitter);
                let bands = bands.clone();
                let destination = destination.clone();
                async move { tracker.submit_outcome(&tile_id, &bands, &destination).await }
            })
            .await;

        let mut jobs: Vec<ExportJob> = tiles
            .values()
            .filter_map(|outcome| match outcome {
                ExportOutcome::Submitted(job) => Some(job.clone()),
                ExportOutcome::Failed(_) => None,
            })
            .collect();
        let submitted = jobs.len();
        let failed_to_submit = tiles.len() - submitted;

        let poll = if self.settings.wait_for_completion {
            let summary = tracker
                .poll_all(
                    &mut jobs,
                    self.settings.poll_interval,
                    self.settings.export_deadline,
                )
                .await;
            for job in jobs {
                tiles.insert(job.tile_id().clone(), ExportOutcome::Submitted(job));
            }
            Some(summary)
        } else {
            None
        };

        Ok(ExportReport {
            submitted,
            failed_to_submit,
            poll,
            tiles,
        })
    }
}
