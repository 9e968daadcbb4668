use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use gold_analysis::{TileIndex, TriageEngine, compute_by_blame};
use gold_config::{GoldConfig, resolve_path};
use gold_core::{Scope, Tile, TriageLogEntry};
use gold_store::{
    ExpectationsStore, IgnoreStore, JsonTileProvider, MemExpectationsStore, NoIgnores,
    SqliteExpectationsStore, StaticIgnoreStore, StaticTileProvider, TileProvider,
};
use gold_web::{AppState, ByBlameCache, TriageLogResponse};

pub mod cli;

use cli::{LogArgs, UndoArgs};

/// Storage handles shared by the server and the one-shot commands.
#[derive(Clone)]
pub struct Backends {
    pub tiles: Arc<dyn TileProvider>,
    pub store: Arc<dyn ExpectationsStore>,
    pub ignores: Arc<dyn IgnoreStore>,
}

impl Backends {
    pub fn open(workspace: &Path, config: &GoldConfig) -> Result<Self> {
        let store: Arc<dyn ExpectationsStore> = if config.storage.sqlite_path.trim().is_empty() {
            tracing::warn!("no sqlite_path configured, expectations are kept in memory only");
            Arc::new(MemExpectationsStore::new())
        } else {
            let path = resolve_path(workspace, config.storage.sqlite_path.trim());
            Arc::new(SqliteExpectationsStore::open(&path).with_context(|| {
                format!("failed to open expectations store at {}", path.display())
            })?)
        };

        let tiles: Arc<dyn TileProvider> = match config.storage.tile_path.as_deref() {
            Some(configured) if !configured.trim().is_empty() => {
                let path = resolve_path(workspace, configured.trim());
                Arc::new(
                    JsonTileProvider::open(&path)
                        .with_context(|| format!("failed to load tile from {}", path.display()))?,
                )
            }
            _ => {
                tracing::warn!("no tile_path configured, serving an empty tile");
                Arc::new(StaticTileProvider::new(Tile::default()))
            }
        };

        let ignores: Arc<dyn IgnoreStore> = if config.ignores.trace_ids.is_empty() {
            Arc::new(NoIgnores)
        } else {
            tracing::info!(
                count = config.ignores.trace_ids.len(),
                "ignoring configured traces"
            );
            Arc::new(StaticIgnoreStore::new(config.ignores.trace_ids.iter().cloned()))
        };

        Ok(Self {
            tiles,
            store,
            ignores,
        })
    }

    pub fn app_state(&self, config: &GoldConfig) -> AppState {
        AppState::new(
            Arc::clone(&self.tiles),
            Arc::clone(&self.store),
            Arc::clone(&self.ignores),
            ByBlameCache::from_config(&config.cache),
        )
    }

    fn engine(&self) -> TriageEngine {
        TriageEngine::new(Arc::clone(&self.store))
    }
}

pub fn run_by_blame(backends: &Backends, corpus: &str, out: &mut dyn Write) -> Result<()> {
    let index = TileIndex::build(
        backends.tiles.as_ref(),
        backends.store.as_ref(),
        backends.ignores.as_ref(),
    )?;
    let entries = compute_by_blame(&index, corpus)?;
    serde_json::to_writer_pretty(&mut *out, &entries)?;
    writeln!(out)?;
    Ok(())
}

pub fn run_log(backends: &Backends, args: &LogArgs, out: &mut dyn Write) -> Result<()> {
    let scope = Scope::from_request(args.scope.issue.as_deref(), args.scope.crs.as_deref());
    let size = args.size.clamp(1, gold_web::MAX_LOG_PAGE_SIZE);
    let page = backends
        .engine()
        .log(&scope, args.offset, size, args.details)?;

    let response = TriageLogResponse {
        entries: page.records.iter().map(TriageLogEntry::from).collect(),
        offset: args.offset,
        size,
        total: page.total,
    };
    serde_json::to_writer_pretty(&mut *out, &response)?;
    writeln!(out)?;
    Ok(())
}

pub fn run_undo(backends: &Backends, args: &UndoArgs, out: &mut dyn Write) -> Result<()> {
    let record = backends
        .engine()
        .undo(&args.id, &args.user)
        .with_context(|| format!("failed to undo triage record {}", args.id))?;
    serde_json::to_writer_pretty(&mut *out, &TriageLogEntry::from(&record))?;
    writeln!(out)?;
    Ok(())
}
