use std::time::{SystemTime, UNIX_EPOCH};

use gold_store::StoreError;
use thiserror::Error;

mod blame;
mod byblame;
mod cache;
mod summary;
mod triage;

pub use blame::{BlameDistribution, Blamer, compute_blame};
pub use byblame::{ByBlameEntry, MAX_AFFECTED_TESTS, TestRollup, TileIndex, compute_by_blame};
pub use cache::{Cached, Freshness, RefreshCache};
pub use summary::{UntriagedByTest, untriaged_at_head};
pub use triage::{TriageEngine, TriageRequest, WireTriageRequest};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache refresh failed: {0}")]
    Cache(String),
}

pub(crate) fn current_unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
