use std::collections::BTreeSet;

use gold_core::{Tile, TraceId};

use crate::StoreError;

/// Source of the traces hidden by active ignore rules. How rules match traces
/// is up to the implementation.
pub trait IgnoreStore: Send + Sync {
    fn ignored_traces(&self, tile: &Tile) -> Result<BTreeSet<TraceId>, StoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnores;

impl IgnoreStore for NoIgnores {
    fn ignored_traces(&self, _tile: &Tile) -> Result<BTreeSet<TraceId>, StoreError> {
        Ok(BTreeSet::new())
    }
}

/// A fixed set of ignored trace ids.
#[derive(Debug, Clone, Default)]
pub struct StaticIgnoreStore {
    trace_ids: BTreeSet<TraceId>,
}

impl StaticIgnoreStore {
    pub fn new(trace_ids: impl IntoIterator<Item = TraceId>) -> Self {
        Self {
            trace_ids: trace_ids.into_iter().collect(),
        }
    }
}

impl IgnoreStore for StaticIgnoreStore {
    fn ignored_traces(&self, tile: &Tile) -> Result<BTreeSet<TraceId>, StoreError> {
        Ok(self
            .trace_ids
            .iter()
            .filter(|id| tile.trace(id).is_some())
            .cloned()
            .collect())
    }
}
