use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use gold_core::Tile;

use crate::StoreError;

/// Supplies point-in-time tiles. A returned tile is never mutated.
pub trait TileProvider: Send + Sync {
    fn tile(&self) -> Result<Arc<Tile>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct StaticTileProvider {
    tile: Arc<Tile>,
}

impl StaticTileProvider {
    pub fn new(tile: Tile) -> Self {
        Self {
            tile: Arc::new(tile),
        }
    }
}

impl TileProvider for StaticTileProvider {
    fn tile(&self) -> Result<Arc<Tile>, StoreError> {
        Ok(Arc::clone(&self.tile))
    }
}

/// Tile read from a JSON file; `reload` swaps in a fresh snapshot while
/// readers keep whatever `Arc` they already hold.
#[derive(Debug)]
pub struct JsonTileProvider {
    path: PathBuf,
    current: RwLock<Arc<Tile>>,
}

impl JsonTileProvider {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tile = read_tile(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(tile)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload(&self) -> Result<Arc<Tile>, StoreError> {
        let tile = Arc::new(read_tile(&self.path)?);
        let mut current = self.current.write().map_err(|_| StoreError::Poisoned)?;
        *current = Arc::clone(&tile);
        Ok(tile)
    }
}

impl TileProvider for JsonTileProvider {
    fn tile(&self) -> Result<Arc<Tile>, StoreError> {
        let current = self.current.read().map_err(|_| StoreError::Poisoned)?;
        Ok(Arc::clone(&*current))
    }
}

fn read_tile(path: &Path) -> Result<Tile, StoreError> {
    let raw = fs::read_to_string(path)?;
    let tile: Tile = serde_json::from_str(&raw)?;
    tracing::info!(
        path = %path.display(),
        commits = tile.len(),
        traces = tile.trace_count(),
        "loaded tile"
    );
    Ok(tile)
}
