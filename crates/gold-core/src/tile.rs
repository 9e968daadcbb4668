use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CORPUS_FIELD, Digest, PRIMARY_KEY_FIELD, Params, TraceId, trace_id};

pub type ParamSet = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub index: usize,
    /// Unix seconds. Informational; `index` is the authoritative order.
    pub timestamp: i64,
    pub author: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub params: Params,
    /// One slot per commit in the tile; `None` marks a missing result.
    pub digests: Vec<Option<Digest>>,
}

impl Trace {
    pub fn new(params: Params, digests: Vec<Option<Digest>>) -> Self {
        Self { params, digests }
    }

    pub fn id(&self) -> TraceId {
        trace_id(&self.params)
    }

    pub fn test_name(&self) -> Option<&str> {
        self.params.get(PRIMARY_KEY_FIELD).map(String::as_str)
    }

    pub fn corpus(&self) -> Option<&str> {
        self.params.get(CORPUS_FIELD).map(String::as_str)
    }

    pub fn digest_at(&self, index: usize) -> Option<&str> {
        self.digests.get(index).and_then(|slot| slot.as_deref())
    }

    /// Most recent non-missing result.
    pub fn head(&self) -> Option<(usize, &str)> {
        self.digests
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, slot)| slot.as_deref().map(|digest| (index, digest)))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileError {
    #[error("commit {hash} at position {position} claims index {index}")]
    CommitIndex {
        hash: String,
        position: usize,
        index: usize,
    },
    #[error("duplicate commit hash {0}")]
    DuplicateCommit(String),
    #[error("duplicate trace {0}")]
    DuplicateTrace(TraceId),
    #[error("trace {trace_id} has {actual} digests, expected {expected}")]
    TraceLength {
        trace_id: TraceId,
        actual: usize,
        expected: usize,
    },
    #[error("trace {0} has no 'name' param")]
    MissingTestName(TraceId),
}

/// Immutable window of commits with one digest history per trace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawTile", into = "RawTile")]
pub struct Tile {
    commits: Vec<Commit>,
    traces: BTreeMap<TraceId, Trace>,
    param_set: ParamSet,
}

#[derive(Serialize, Deserialize)]
struct RawTile {
    commits: Vec<Commit>,
    traces: Vec<Trace>,
}

impl TryFrom<RawTile> for Tile {
    type Error = TileError;

    fn try_from(raw: RawTile) -> Result<Self, Self::Error> {
        Tile::new(raw.commits, raw.traces)
    }
}

impl From<Tile> for RawTile {
    fn from(tile: Tile) -> Self {
        RawTile {
            commits: tile.commits,
            traces: tile.traces.into_values().collect(),
        }
    }
}

impl Tile {
    pub fn new(commits: Vec<Commit>, traces: Vec<Trace>) -> Result<Self, TileError> {
        let mut seen_hashes = HashSet::with_capacity(commits.len());
        for (position, commit) in commits.iter().enumerate() {
            if commit.index != position {
                return Err(TileError::CommitIndex {
                    hash: commit.hash.clone(),
                    position,
                    index: commit.index,
                });
            }
            if !seen_hashes.insert(commit.hash.as_str()) {
                return Err(TileError::DuplicateCommit(commit.hash.clone()));
            }
        }

        let expected = commits.len();
        let mut by_id = BTreeMap::new();
        let mut param_set = ParamSet::new();
        for trace in traces {
            let id = trace.id();
            if trace.digests.len() != expected {
                return Err(TileError::TraceLength {
                    trace_id: id,
                    actual: trace.digests.len(),
                    expected,
                });
            }
            if trace.test_name().is_none() {
                return Err(TileError::MissingTestName(id));
            }

            for (key, value) in &trace.params {
                param_set
                    .entry(key.clone())
                    .or_default()
                    .insert(value.clone());
            }

            if by_id.insert(id.clone(), trace).is_some() {
                return Err(TileError::DuplicateTrace(id));
            }
        }

        Ok(Self {
            commits,
            traces: by_id,
            param_set,
        })
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn commit(&self, index: usize) -> Option<&Commit> {
        self.commits.get(index)
    }

    pub fn traces(&self) -> impl Iterator<Item = (&TraceId, &Trace)> {
        self.traces.iter()
    }

    pub fn trace(&self, id: &str) -> Option<&Trace> {
        self.traces.get(id)
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn param_set(&self) -> &ParamSet {
        &self.param_set
    }

    /// Length of the commit window; every trace has exactly this many slots.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}
