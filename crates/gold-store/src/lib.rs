use gold_core::{Expectations, Scope, TileError, TriageDelta, TriageRecord};
use thiserror::Error;

mod ignore;
mod memory;
mod sqlite;
mod tile;

pub use ignore::{IgnoreStore, NoIgnores, StaticIgnoreStore};
pub use memory::MemExpectationsStore;
pub use sqlite::SqliteExpectationsStore;
pub use tile::{JsonTileProvider, StaticTileProvider, TileProvider};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid tile: {0}")]
    Tile(#[from] TileError),
    #[error("corrupt store data: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// One page of the triage log, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogPage {
    pub records: Vec<TriageRecord>,
    /// Number of records in the scope, independent of paging.
    pub total: usize,
}

/// Durable home of expectations and the triage log.
///
/// Implementations own atomicity: `add_change` either applies every delta and
/// appends its record, or changes nothing.
pub trait ExpectationsStore: Send + Sync {
    /// Primary expectations, or primary overlaid with the changelist's own.
    fn expectations(&self, scope: &Scope) -> Result<Expectations, StoreError>;

    fn add_change(
        &self,
        scope: &Scope,
        deltas: &[TriageDelta],
        author: &str,
        timestamp_ms: i64,
    ) -> Result<TriageRecord, StoreError>;

    fn query_log(
        &self,
        scope: &Scope,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<LogPage, StoreError>;

    fn get_record(&self, id: &str) -> Result<Option<TriageRecord>, StoreError>;
}

/// An [`ExpectationsStore`] bound to one scope.
#[derive(Clone)]
pub struct ScopedExpectations<'a> {
    store: &'a dyn ExpectationsStore,
    scope: Scope,
}

impl<'a> ScopedExpectations<'a> {
    pub fn new(store: &'a dyn ExpectationsStore, scope: Scope) -> Self {
        Self { store, scope }
    }

    pub fn primary(store: &'a dyn ExpectationsStore) -> Self {
        Self::new(store, Scope::Primary)
    }

    pub fn for_changelist(store: &'a dyn ExpectationsStore, id: &str, crs: &str) -> Self {
        Self::new(store, Scope::changelist(id, crs))
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn expectations(&self) -> Result<Expectations, StoreError> {
        self.store.expectations(&self.scope)
    }

    pub fn add_change(
        &self,
        deltas: &[TriageDelta],
        author: &str,
        timestamp_ms: i64,
    ) -> Result<TriageRecord, StoreError> {
        self.store
            .add_change(&self.scope, deltas, author, timestamp_ms)
    }

    pub fn query_log(
        &self,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<LogPage, StoreError> {
        self.store
            .query_log(&self.scope, offset, size, with_details)
    }
}
