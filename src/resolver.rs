use crate::aoi::AreaOfInterest;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};
use crate::tile::{CloudCover, DateRange, TileId};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Resolves an AOI into the set of catalog tiles intersecting it.
pub struct TileIndexResolver<'a> {
    catalog: &'a dyn Catalog,
    retry: RetryPolicy,
}

impl<'a> TileIndexResolver<'a> {
    pub fn new(catalog: &'a dyn Catalog, retry: RetryPolicy) -> Self {
        Self { catalog, retry }
    }

    /// One catalog query per polygon, merged as a set union. Any polygon whose
    /// query cannot be completed fails the whole resolution.
    pub async fn resolve(
        &self,
        aoi: &AreaOfInterest,
        dates: &DateRange,
        cloud_cover: CloudCover,
    ) -> Result<BTreeSet<TileId>> {
        let mut tile_ids = BTreeSet::new();

        for (index, polygon) in aoi.polygons().iter().enumerate() {
            let label = polygon
                .label()
                .map(str::to_string)
                .unwrap_or_else(|| format!("polygon {index}"));
            let found = retry(&self.retry, &label, |_| {
                self.catalog.query_tiles(polygon, dates, cloud_cover)
            })
            .await
            .map_err(|exhausted| Error::CatalogQuery {
                attempts: exhausted.attempts,
                reason: format!("{label}: {}", exhausted.error),
            })?;

            debug!(polygon = %label, tiles = found.len(), "Queried catalog");
            tile_ids.extend(found);
        }

        info!(
            catalog = self.catalog.name(),
            tiles = tile_ids.len(),
            "Resolved tiles for AOI"
        );
        Ok(tile_ids)
    }
}

/// The first `limit` ids in lexicographic order.
pub fn first_n(tile_ids: BTreeSet<TileId>, limit: Option<usize>) -> BTreeSet<TileId> {
    match limit {
        Some(n) => tile_ids.into_iter().take(n).collect(),
        None => tile_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::Polygon;
    use crate::catalog::testing::MockCatalog;
    use std::time::Duration;

    fn square(label: &str, x: f64) -> Polygon {
        Polygon::new(
            Some(label.to_string()),
            vec![(x, 60.0), (x + 1.0, 60.0), (x + 1.0, 61.0), (x, 61.0), (x, 60.0)],
        )
        .unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        }
    }

    fn window() -> (DateRange, CloudCover) {
        (
            DateRange::parse("2024-07", "2024-09").unwrap(),
            CloudCover::new(20.0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_shared_border_tile_appears_once() {
        let catalog = MockCatalog::new()
            .with_tiles("west", &["T08VNH_a", "T08VPH_border"])
            .with_tiles("east", &["T08VPH_border", "T08VQH_c"]);
        let aoi = AreaOfInterest::new(vec![square("west", -134.0), square("east", -133.0)]).unwrap();
        let (dates, cloud) = window();

        let ids = TileIndexResolver::new(&catalog, fast_retry())
            .resolve(&aoi, &dates, cloud)
            .await
            .unwrap();
        let ids: Vec<&str> = ids.iter().map(TileId::as_str).collect();
        assert_eq!(ids, vec!["T08VNH_a", "T08VPH_border", "T08VQH_c"]);
    }

    #[tokio::test]
    async fn test_transient_query_failures_are_retried() {
        let catalog = MockCatalog::new()
            .with_tiles("west", &["T1"])
            .with_query_failures(2);
        let aoi = AreaOfInterest::new(vec![square("west", -134.0)]).unwrap();
        let (dates, cloud) = window();

        let ids = TileIndexResolver::new(&catalog, fast_retry())
            .resolve(&aoi, &dates, cloud)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_query_fails_resolution() {
        let catalog = MockCatalog::new()
            .with_tiles("west", &["T1"])
            .with_query_failures(10);
        let aoi = AreaOfInterest::new(vec![square("west", -134.0)]).unwrap();
        let (dates, cloud) = window();

        let result = TileIndexResolver::new(&catalog, fast_retry())
            .resolve(&aoi, &dates, cloud)
            .await;
        match result {
            Err(Error::CatalogQuery { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.starts_with("west"));
            }
            other => panic!("expected CatalogQuery error, got {other:?}"),
        }
    }

    #[test]
    fn test_first_n_is_lexicographic() {
        let ids: BTreeSet<TileId> = ["c", "a", "b"]
            .into_iter()
            .map(|s| TileId::new(s).unwrap())
            .collect();
        let first: Vec<String> = first_n(ids.clone(), Some(2))
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first_n(ids, None).len(), 3);
    }
}
