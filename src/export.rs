//! Server-side export jobs and the loop that waits for them.
use crate::catalog::{Catalog, ExportDestination, JobHandle, RemoteJobStatus};
use crate::coordinator::Outcome;
use crate::error::Result;
use crate::retry::{retry, RetryPolicy};
use crate::tile::{BandMapping, TileId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Ready,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportJob {
    tile_id: TileId,
    handle: JobHandle,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl ExportJob {
    fn new(tile_id: TileId, handle: JobHandle) -> Self {
        Self {
            tile_id,
            handle,
            state: JobState::Ready,
            error_message: None,
        }
    }

    pub fn tile_id(&self) -> &TileId {
        &self.tile_id
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Record a polled status. A terminal job never changes again.
    fn apply(&mut self, status: RemoteJobStatus) {
        if self.state.is_terminal() {
            return;
        }
        self.state = status.state;
        if status.error_message.is_some() {
            self.error_message = status.error_message;
        }
    }
}

/// Result of submitting one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ExportOutcome {
    Submitted(ExportJob),
    Failed(String),
}

impl Outcome for ExportOutcome {
    fn from_failure(reason: String) -> Self {
        ExportOutcome::Failed(reason)
    }

    fn failure(&self) -> Option<&str> {
        match self {
            ExportOutcome::Failed(reason) => Some(reason),
            ExportOutcome::Submitted(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl StateCounts {
    pub fn of<'a>(jobs: impl IntoIterator<Item = &'a ExportJob>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.state {
                JobState::Ready => counts.ready += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Canceled => counts.canceled += 1,
            }
        }
        counts
    }

    pub fn pending(&self) -> usize {
        self.ready + self.running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub counts: StateCounts,
    /// The deadline passed with jobs still pending.
    pub timed_out: bool,
}

pub struct ExportJobTracker {
    catalog: Arc<dyn Catalog>,
    retry: RetryPolicy,
    submit_spacing: Option<Duration>,
}

impl ExportJobTracker {
    pub fn new(catalog: Arc<dyn Catalog>, retry: RetryPolicy) -> Self {
        Self {
            catalog,
            retry,
            submit_spacing: None,
        }
    }

    /// Pause after each submission, to stay under provider task-start limits.
    pub fn with_submit_spacing(mut self, spacing: Option<Duration>) -> Self {
        self.submit_spacing = spacing;
        self
    }

    pub async fn submit(
        &self,
        tile_id: &TileId,
        bands: &BandMapping,
        destination: &ExportDestination,
    ) -> Result<ExportJob> {
        let handle = retry(&self.retry, tile_id.as_str(), |_| {
            self.catalog.submit_export_job(tile_id, bands, destination)
        })
        .await
        .map_err(|exhausted| exhausted.error)?;

        info!(tile_id = %tile_id, job = %handle, destination = %destination, "Started export job");
        if let Some(spacing) = self.submit_spacing {
            tokio::time::sleep(spacing).await;
        }
        Ok(ExportJob::new(tile_id.clone(), handle))
    }

    /// [`submit`](Self::submit) folded into an [`ExportOutcome`].
    pub async fn submit_outcome(
        &self,
        tile_id: &TileId,
        bands: &BandMapping,
        destination: &ExportDestination,
    ) -> ExportOutcome {
        match self.submit(tile_id, bands, destination).await {
            Ok(job) => ExportOutcome::Submitted(job),
            Err(e) => {
                error!(tile_id = %tile_id, reason = %e, "Failed to start export job");
                ExportOutcome::Failed(e.to_string())
            }
        }
    }

    /// Poll every non-terminal job each `interval` until all are terminal.
    ///
    /// Without a `deadline` this waits as long as the provider keeps a job
    /// running.
    pub async fn poll_all(
        &self,
        jobs: &mut [ExportJob],
        interval: Duration,
        deadline: Option<Duration>,
    ) -> PollSummary {
        let started = Instant::now();
        if jobs.is_empty() {
            info!("No export jobs to wait for");
        } else {
            info!(jobs = jobs.len(), "Waiting for export jobs to complete");
        }

        let timed_out = loop {
            for job in jobs.iter_mut().filter(|j| !j.state.is_terminal()) {
                self.poll_one(job).await;
            }

            let counts = StateCounts::of(jobs.iter());
            info!(
                ready = counts.ready,
                running = counts.running,
                completed = counts.completed,
                failed = counts.failed,
                canceled = counts.canceled,
                "Export job states"
            );
            if counts.pending() == 0 {
                break false;
            }

            let mut pause = interval;
            if let Some(deadline) = deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    warn!(
                        pending = counts.pending(),
                        deadline_secs = deadline.as_secs(),
                        "Export deadline passed with jobs still pending"
                    );
                    break true;
                }
                pause = pause.min(deadline - elapsed);
            }
            tokio::time::sleep(pause).await;
        };

        for job in jobs.iter() {
            match job.state {
                JobState::Completed => info!(tile_id = %job.tile_id, job = %job.handle, "Export completed"),
                state => error!(
                    tile_id = %job.tile_id,
                    job = %job.handle,
                    state = ?state,
                    reason = job.error_message().unwrap_or("No error message"),
                    "Export did not complete"
                ),
            }
        }

        PollSummary {
            counts: StateCounts::of(jobs.iter()),
            timed_out,
        }
    }

    async fn poll_one(&self, job: &mut ExportJob) {
        match self.catalog.job_status(&job.handle).await {
            Ok(status) => {
                let before = job.state;
                job.apply(status);
                if job.state != before {
                    info!(tile_id = %job.tile_id, from = ?before, to = ?job.state, "Export job changed state");
                }
            }
            // Polling again next round is the retry
            Err(e) if e.is_transient() => {
                warn!(tile_id = %job.tile_id, error = %e, "Unable to poll export job")
            }
            Err(e) => {
                error!(tile_id = %job.tile_id, error = %e, "Export job status unavailable");
                job.state = JobState::Failed;
                job.error_message = Some(e.to_string());
            }
        }
    }
}
