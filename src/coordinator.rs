//! Bounded worker pool running one job per tile id.
use crate::tile::TileId;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Per-tile result of a worker. A worker that panics is recorded through
/// [`Outcome::from_failure`] instead of taking the batch down.
pub trait Outcome: Send + 'static {
    fn from_failure(reason: String) -> Self;

    fn failure(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

pub struct ConcurrencyCoordinator {
    max_workers: usize,
    on_progress: Option<ProgressFn>,
}

impl ConcurrencyCoordinator {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            on_progress: None,
        }
    }

    /// Called once per completed tile, in completion order.
    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `worker_fn` for every id with at most `max_workers` in flight.
    /// Every id gets an entry in the returned map.
    pub async fn run<T, F, Fut>(
        &self,
        tile_ids: &BTreeSet<TileId>,
        worker_fn: F,
    ) -> BTreeMap<TileId, T>
    where
        T: Outcome,
        F: Fn(TileId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = tile_ids.len();
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let worker_fn = Arc::new(worker_fn);
        let mut workers = JoinSet::new();

        for tile_id in tile_ids {
            let permits = Arc::clone(&permits);
            let worker_fn = Arc::clone(&worker_fn);
            let tile_id = tile_id.clone();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                // The worker runs in its own task so a panic stays contained
                let outcome = match tokio::spawn(worker_fn(tile_id.clone())).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        let reason = format!("worker panicked: {}", panic_message(e.into_panic()));
                        error!(tile_id = %tile_id, reason = %reason, "Worker failed");
                        T::from_failure(reason)
                    }
                    Err(e) => T::from_failure(format!("worker cancelled: {e}")),
                };
                (tile_id, outcome)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((tile_id, outcome)) => {
                    let completed = results.len() + 1;
                    match outcome.failure() {
                        Some(reason) => {
                            info!(completed, total, tile_id = %tile_id, reason, "Tile failed")
                        }
                        None => info!(completed, total, tile_id = %tile_id, "Tile done"),
                    }
                    results.insert(tile_id, outcome);
                    if let Some(on_progress) = &self.on_progress {
                        on_progress(Progress { completed, total });
                    }
                }
                Err(e) => error!(error = %e, "Worker wrapper task failed"),
            }
        }

        // Only reachable if a wrapper task itself died; no id goes unreported
        for tile_id in tile_ids {
            if !results.contains_key(tile_id) {
                results.insert(
                    tile_id.clone(),
                    T::from_failure("worker task was lost".to_string()),
                );
            }
        }
        results
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
