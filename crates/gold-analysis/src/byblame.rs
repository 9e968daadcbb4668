use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use gold_core::{Commit, Digest, Expectations, Scope, TestName, Tile, TraceId};
use gold_store::{ExpectationsStore, IgnoreStore, TileProvider};
use serde::{Deserialize, Serialize};

use crate::{AnalysisError, BlameDistribution, Blamer, UntriagedByTest, untriaged_at_head};

/// Groups touching more tests than this carry no per-test rollups.
pub const MAX_AFFECTED_TESTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRollup {
    pub test: TestName,
    pub num: usize,
    pub sample_digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByBlameEntry {
    #[serde(rename = "groupID")]
    pub group_id: String,
    #[serde(rename = "nDigests")]
    pub n_digests: usize,
    #[serde(rename = "nTests")]
    pub n_tests: usize,
    #[serde(rename = "affectedTests")]
    pub affected_tests: Option<Vec<TestRollup>>,
    /// Most recent first by timestamp.
    pub commits: Vec<Commit>,
}

/// Read-only snapshot the blame views are computed from.
#[derive(Debug, Clone)]
pub struct TileIndex {
    tile: Arc<Tile>,
    expectations: Arc<Expectations>,
    ignored: BTreeSet<TraceId>,
    blamer: Blamer,
}

impl TileIndex {
    pub fn new(tile: Arc<Tile>, expectations: Arc<Expectations>, ignored: BTreeSet<TraceId>) -> Self {
        let blamer = Blamer::new(&tile, &expectations, &ignored);
        Self {
            tile,
            expectations,
            ignored,
            blamer,
        }
    }

    /// Snapshots the current tile with primary-branch expectations.
    pub fn build(
        tiles: &dyn TileProvider,
        expectations: &dyn ExpectationsStore,
        ignores: &dyn IgnoreStore,
    ) -> Result<Self, AnalysisError> {
        let tile = tiles.tile()?;
        let expectations = Arc::new(expectations.expectations(&Scope::Primary)?);
        let ignored = ignores.ignored_traces(&tile)?;
        Ok(Self::new(tile, expectations, ignored))
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn expectations(&self) -> &Expectations {
        &self.expectations
    }

    pub fn ignored(&self) -> &BTreeSet<TraceId> {
        &self.ignored
    }

    pub fn blame(&self, corpus: &str, test: &str, digest: &str) -> BlameDistribution {
        self.blamer.blame(corpus, test, digest)
    }

    pub fn untriaged_at_head(&self, corpus: &str) -> UntriagedByTest {
        untriaged_at_head(&self.tile, &self.expectations, &self.ignored, corpus)
    }
}

#[derive(Default)]
struct BlameGroup<'a> {
    freq: &'a [usize],
    digests: BTreeMap<&'a str, BTreeSet<&'a str>>,
}

/// Untriaged HEAD digests of `corpus` grouped by the commits blamed for them,
/// largest group first.
pub fn compute_by_blame(index: &TileIndex, corpus: &str) -> Result<Vec<ByBlameEntry>, AnalysisError> {
    let corpus = corpus.trim();
    if corpus.is_empty() {
        return Err(AnalysisError::InvalidInput(
            "a corpus is required to compute blame groups".to_owned(),
        ));
    }

    let untriaged = index.untriaged_at_head(corpus);
    let commits = index.tile().commits();

    let mut groups: BTreeMap<String, BlameGroup<'_>> = BTreeMap::new();
    for (test, digests) in &untriaged {
        for digest in digests {
            let distribution = match index.blamer.get(corpus, test, digest) {
                Some(distribution) if !distribution.is_empty() => distribution,
                _ => {
                    tracing::warn!(
                        test = %test,
                        digest = %digest,
                        "empty blame distribution, index may still be building"
                    );
                    continue;
                }
            };

            let group = groups
                .entry(group_id(distribution, commits))
                .or_default();
            group.freq = &distribution.freq;
            group
                .digests
                .entry(test.as_str())
                .or_default()
                .insert(digest.as_str());
        }
    }

    let mut entries: Vec<ByBlameEntry> = groups
        .into_iter()
        .map(|(group_id, group)| build_entry(group_id, group, commits))
        .collect();
    entries.sort_by(|a, b| {
        b.n_digests
            .cmp(&a.n_digests)
            .then_with(|| a.group_id.cmp(&b.group_id))
    });

    tracing::debug!(corpus, groups = entries.len(), "computed blame groups");
    Ok(entries)
}

/// `:`-joined hashes of the implicated commits, in commit-index order.
fn group_id(distribution: &BlameDistribution, commits: &[Commit]) -> String {
    distribution
        .commits(commits)
        .into_iter()
        .map(|commit| commit.hash.as_str())
        .collect::<Vec<_>>()
        .join(":")
}

fn build_entry(group_id: String, group: BlameGroup<'_>, commits: &[Commit]) -> ByBlameEntry {
    let n_tests = group.digests.len();
    let n_digests = group.digests.values().map(BTreeSet::len).sum();

    let affected_tests = (n_tests <= MAX_AFFECTED_TESTS).then(|| {
        let mut rollups: Vec<TestRollup> = group
            .digests
            .iter()
            .filter_map(|(test, digests)| {
                digests.first().map(|sample| TestRollup {
                    test: (*test).to_owned(),
                    num: digests.len(),
                    sample_digest: (*sample).to_owned(),
                })
            })
            .collect();
        rollups.sort_by(|a, b| b.num.cmp(&a.num).then_with(|| a.test.cmp(&b.test)));
        rollups
    });

    let mut blamed: Vec<Commit> = group
        .freq
        .iter()
        .filter_map(|index| commits.get(*index))
        .cloned()
        .collect();
    blamed.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.index.cmp(&a.index))
    });

    ByBlameEntry {
        group_id,
        n_digests,
        n_tests,
        affected_tests,
        commits: blamed,
    }
}
