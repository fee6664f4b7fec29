use crate::error::Result;
use crate::tile::TileId;
use std::fs;
use std::path::{Path, PathBuf};

const ARTIFACT_EXTENSION: &str = "tif";
const PARTIAL_SUFFIX: &str = "partial";

/// Maps tile ids to raster files in the cache directory. The filesystem is the
/// only index: a tile is cached exactly when its canonical file exists.
#[derive(Debug, Clone)]
pub struct TileCache {
    dir: PathBuf,
}

impl TileCache {
    /// Open the cache, creating its directory if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, tile_id: &TileId) -> PathBuf {
        self.dir.join(format!("{tile_id}.{ARTIFACT_EXTENSION}"))
    }

    pub fn exists(&self, tile_id: &TileId) -> bool {
        self.artifact_path(tile_id).is_file()
    }

    /// Scratch file for one download attempt. Never a canonical name: it ends
    /// in `.partial` and is unique per writer, so concurrent fetches of the
    /// same tile never share one.
    pub fn temp_path(&self, tile_id: &TileId, writer: u64) -> PathBuf {
        self.dir.join(format!(
            "{tile_id}.{ARTIFACT_EXTENSION}.{}.{writer}.{PARTIAL_SUFFIX}",
            std::process::id()
        ))
    }

    /// Scratch files left behind by interrupted runs.
    pub fn leftover_partials(&self) -> Result<Vec<PathBuf>> {
        let mut partials = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_partial = path
                .extension()
                .is_some_and(|ext| ext == PARTIAL_SUFFIX);
            if is_partial {
                partials.push(path);
            }
        }
        partials.sort();
        Ok(partials)
    }
}
