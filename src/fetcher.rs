//! Download of one tile into the cache.
//!
//! A download streams into a private `.partial` file next to its final
//! location and is renamed into place only once the whole payload is on disk,
//! so the canonical artifact name never refers to a half written raster.
use crate::cache::TileCache;
use crate::catalog::Catalog;
use crate::coordinator::Outcome;
use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};
use crate::tile::{BandMapping, TileId};
use futures_util::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FetchResult {
    Cached(PathBuf),
    Fetched(PathBuf),
    Failed(String),
}

impl Outcome for FetchResult {
    fn from_failure(reason: String) -> Self {
        FetchResult::Failed(reason)
    }

    fn failure(&self) -> Option<&str> {
        match self {
            FetchResult::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

enum Attempt {
    Downloaded { bytes: u64 },
    AlreadyCached,
}

pub struct TileFetcher {
    catalog: Arc<dyn Catalog>,
    cache: TileCache,
    retry: RetryPolicy,
    request_timeout: Duration,
    writers: AtomicU64,
}

impl TileFetcher {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cache: TileCache,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            cache,
            retry,
            request_timeout,
            writers: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub async fn fetch(&self, tile_id: &TileId, bands: &BandMapping) -> FetchResult {
        let path = self.cache.artifact_path(tile_id);
        if self.cache.exists(tile_id) {
            debug!(tile_id = %tile_id, "Already cached");
            return FetchResult::Cached(path);
        }

        let result = retry(&self.retry, tile_id.as_str(), |_| {
            self.try_download(tile_id, bands, &path)
        })
        .await;

        match result {
            Ok(Attempt::Downloaded { bytes }) => {
                info!(tile_id = %tile_id, bytes, path = %path.display(), "Fetched tile");
                FetchResult::Fetched(path)
            }
            Ok(Attempt::AlreadyCached) => {
                debug!(tile_id = %tile_id, "Cached by a concurrent fetch");
                FetchResult::Cached(path)
            }
            Err(exhausted) => {
                let reason = exhausted.error.to_string();
                error!(
                    tile_id = %tile_id,
                    attempts = exhausted.attempts,
                    reason = %reason,
                    "Failed to fetch tile"
                );
                FetchResult::Failed(reason)
            }
        }
    }

    async fn try_download(&self, tile_id: &TileId, bands: &BandMapping, dst: &Path) -> Result<Attempt> {
        if self.cache.exists(tile_id) {
            return Ok(Attempt::AlreadyCached);
        }

        let writer = self.writers.fetch_add(1, Ordering::Relaxed);
        let partial = self.cache.temp_path(tile_id, writer);
        let result = match self.stream_to(tile_id, bands, &partial).await {
            Ok(bytes) => fs::rename(&partial, dst)
                .await
                .map(|()| Attempt::Downloaded { bytes })
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = fs::remove_file(&partial).await;
        }
        result
    }

    /// Write the tile payload to `partial`, returning the byte count.
    async fn stream_to(&self, tile_id: &TileId, bands: &BandMapping, partial: &Path) -> Result<u64> {
        let mut chunks = timeout(
            self.request_timeout,
            self.catalog.fetch_tile_bytes(tile_id, bands),
        )
        .await??;

        let mut file = File::create(partial).await?;
        let mut byte_count = 0_u64;
        while let Some(chunk) = timeout(self.request_timeout, chunks.next()).await? {
            let chunk = chunk?;
            // Keep-alive chunks carry no data
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk).await?;
            byte_count += chunk.len() as u64;
        }

        if byte_count == 0 {
            return Err(Error::NonRetryableFetch(format!(
                "Catalog returned an empty payload for {tile_id}"
            )));
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(byte_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{payload, FetchScript, MockCatalog};
    use std::time::Instant;

    fn fetcher(catalog: Arc<MockCatalog>, dir: &Path, base_delay_ms: u64) -> TileFetcher {
        TileFetcher::new(
            catalog,
            TileCache::open(dir).unwrap(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(base_delay_ms),
            },
            Duration::from_millis(200),
        )
    }

    fn tile(id: &str) -> TileId {
        TileId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_then_cached() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);
        let id = tile("T08VPH");
        let bands = BandMapping::default();

        let first = fetcher.fetch(&id, &bands).await;
        let path = dir.path().join("T08VPH.tif");
        assert_eq!(first, FetchResult::Fetched(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), payload("T08VPH"));

        let second = fetcher.fetch(&id, &bands).await;
        assert_eq!(second, FetchResult::Cached(path));
        assert_eq!(catalog.fetch_calls("T08VPH"), 1);
    }

    #[tokio::test]
    async fn test_empty_chunks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        catalog.script_fetch(
            "T1",
            vec![FetchScript::Chunks(vec![
                b"II*\0".to_vec(),
                vec![],
                b"data".to_vec(),
                vec![],
            ])],
        );
        let fetcher = fetcher(catalog, dir.path(), 1);

        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Fetched(_)));
        assert_eq!(
            std::fs::read(dir.path().join("T1.tif")).unwrap(),
            b"II*\0data".to_vec()
        );
    }

    #[tokio::test]
    async fn test_zero_byte_payload_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        catalog.script_fetch("T1", vec![FetchScript::Chunks(vec![vec![], vec![]])]);
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);

        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Failed(_)));
        assert!(!dir.path().join("T1.tif").exists());
        assert_eq!(catalog.fetch_calls("T1"), 1);
    }

    #[tokio::test]
    async fn test_broken_stream_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        catalog.script_fetch(
            "T1",
            vec![FetchScript::BreakAfter(vec![b"II*\0partial".to_vec()]); 4],
        );
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);

        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Failed(_)));
        assert_eq!(catalog.fetch_calls("T1"), 4);
        assert!(!dir.path().join("T1.tif").exists());
        assert!(!fetcher.cache().exists(&tile("T1")));
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        catalog.script_fetch(
            "T1",
            vec![
                FetchScript::Transient,
                FetchScript::BreakAfter(vec![b"II*\0".to_vec()]),
            ],
        );
        let fetcher = fetcher(catalog.clone(), dir.path(), 20);

        let started = Instant::now();
        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Fetched(_)));
        assert_eq!(catalog.fetch_calls("T1"), 3);
        // base_delay * 1 + base_delay * 2
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        catalog.script_fetch("T1", vec![FetchScript::NonRetryable]);
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);

        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        match result {
            FetchResult::Failed(reason) => assert!(reason.contains("malformed")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(catalog.fetch_calls("T1"), 1);
    }

    #[tokio::test]
    async fn test_request_timeout_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        catalog.script_fetch("T1", vec![FetchScript::Stall(Duration::from_secs(5))]);
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);

        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Fetched(_)));
        assert_eq!(catalog.fetch_calls("T1"), 2);
    }

    #[tokio::test]
    async fn test_failed_rename_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);
        // A non-empty directory squatting on the artifact name blocks the rename
        let blocker = dir.path().join("T1.tif");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let result = fetcher.fetch(&tile("T1"), &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Failed(_)));
        assert_eq!(catalog.fetch_calls("T1"), 1);
        assert!(fetcher.cache().leftover_partials().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leftover_partial_is_not_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MockCatalog::new());
        let fetcher = fetcher(catalog.clone(), dir.path(), 1);
        let id = tile("T1");
        std::fs::write(fetcher.cache().temp_path(&id, 99), b"stale").unwrap();

        let result = fetcher.fetch(&id, &BandMapping::default()).await;
        assert!(matches!(result, FetchResult::Fetched(_)));
        assert_eq!(catalog.fetch_calls("T1"), 1);
    }
}
