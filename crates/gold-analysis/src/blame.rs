use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::num::NonZeroUsize;

use gold_core::{Commit, Digest, Expectations, Label, TestName, Tile, Trace, TraceId};
use serde::{Deserialize, Serialize};

/// Traces per worker below which the blamer stays on the calling thread.
const MIN_TRACES_PER_SHARD: usize = 256;
const MAX_SHARDS: usize = 8;

/// Candidate culprit commits for one untriaged (test, digest).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlameDistribution {
    /// Implicated commit indices, ascending and distinct.
    pub freq: Vec<usize>,
    /// `weights[i]` is how many traces implicate `freq[i]`.
    pub weights: Vec<u32>,
    /// Some trace showed the digest with no earlier result in the window, so
    /// it may predate the tile.
    pub old: bool,
}

impl BlameDistribution {
    /// True when no trace could be scanned. Callers treat this as an index
    /// that is not ready yet, never as "nothing to blame".
    pub fn is_empty(&self) -> bool {
        self.freq.is_empty()
    }

    pub fn commits<'a>(&self, commits: &'a [Commit]) -> Vec<&'a Commit> {
        self.freq
            .iter()
            .filter_map(|index| commits.get(*index))
            .collect()
    }

    pub fn authors(&self, commits: &[Commit]) -> Vec<String> {
        self.commits(commits)
            .into_iter()
            .map(|commit| commit.author.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Inclusive commit range one trace points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CandidateRange {
    start: usize,
    end: usize,
    old: bool,
}

#[derive(Debug, Clone, Default)]
struct BlameAccumulator {
    weights: BTreeMap<usize, u32>,
    old: bool,
}

impl BlameAccumulator {
    fn add(&mut self, range: CandidateRange) {
        for index in range.start..=range.end {
            *self.weights.entry(index).or_default() += 1;
        }
        self.old |= range.old;
    }

    fn merge(&mut self, other: BlameAccumulator) {
        for (index, weight) in other.weights {
            *self.weights.entry(index).or_default() += weight;
        }
        self.old |= other.old;
    }

    fn finish(self) -> BlameDistribution {
        let (freq, weights) = self.weights.into_iter().unzip();
        BlameDistribution {
            freq,
            weights,
            old: self.old,
        }
    }
}

/// Where `target` first shows up in a trace and the last different result
/// before it. When `target` is the trace's head value only the run ending at
/// head counts; otherwise its first appearance in the window does. Missing
/// results never close a range, so they widen it.
fn candidate_range(digests: &[Option<Digest>], target: &str) -> Option<CandidateRange> {
    let (head_index, head) = digests
        .iter()
        .enumerate()
        .rev()
        .find_map(|(index, slot)| slot.as_deref().map(|digest| (index, digest)))?;

    let (first, boundary) = if head == target {
        let mut first = head_index;
        let mut boundary = None;
        for index in (0..head_index).rev() {
            match digests[index].as_deref() {
                None => {}
                Some(digest) if digest == target => first = index,
                Some(_) => {
                    boundary = Some(index);
                    break;
                }
            }
        }
        (first, boundary)
    } else {
        let first = digests
            .iter()
            .position(|slot| slot.as_deref() == Some(target))?;
        let boundary = digests[..first].iter().rposition(Option::is_some);
        (first, boundary)
    };

    Some(CandidateRange {
        start: boundary.map_or(first, |index| index + 1),
        end: first,
        old: boundary.is_none(),
    })
}

/// Blame for a single (test, digest) over the traces of `test` in `corpus`,
/// leaving out `ignored` ones.
pub fn compute_blame(
    corpus: &str,
    test: &str,
    digest: &str,
    tile: &Tile,
    expectations: &Expectations,
    ignored: &BTreeSet<TraceId>,
) -> BlameDistribution {
    if expectations.classification(test, digest) != Label::Untriaged {
        tracing::debug!(test, digest, "computing blame for an already triaged digest");
    }

    let mut accumulator = BlameAccumulator::default();
    for (trace_id, trace) in tile.traces() {
        if ignored.contains(trace_id)
            || trace.corpus() != Some(corpus)
            || trace.test_name() != Some(test)
        {
            continue;
        }
        if let Some(range) = candidate_range(&trace.digests, digest) {
            accumulator.add(range);
        }
    }
    accumulator.finish()
}

type BlamesByTest = BTreeMap<TestName, BTreeMap<Digest, BlameDistribution>>;

/// Precomputed blame for every untriaged (corpus, test, digest) in a tile.
#[derive(Debug, Clone, Default)]
pub struct Blamer {
    blames: BTreeMap<String, BlamesByTest>,
}

type ShardBlame = BTreeMap<(String, TestName, Digest), BlameAccumulator>;

impl Blamer {
    /// Scans disjoint trace shards on scoped threads and merges the partial
    /// results after join; shards share nothing mutable. Ignored traces
    /// never contribute.
    pub fn new(tile: &Tile, expectations: &Expectations, ignored: &BTreeSet<TraceId>) -> Self {
        let traces: Vec<&Trace> = tile
            .traces()
            .filter(|(trace_id, _)| !ignored.contains(*trace_id))
            .map(|(_, trace)| trace)
            .collect();
        let shard_count = shard_count(traces.len());
        let chunk_size = traces.len().div_ceil(shard_count).max(1);

        let shards: Vec<ShardBlame> = if shard_count <= 1 {
            vec![blame_shard(&traces, expectations)]
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = traces
                    .chunks(chunk_size)
                    .map(|chunk| scope.spawn(move || blame_shard(chunk, expectations)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                    })
                    .collect()
            })
        };

        let mut merged = ShardBlame::new();
        for shard in shards {
            for (key, accumulator) in shard {
                merged.entry(key).or_default().merge(accumulator);
            }
        }

        let mut blames: BTreeMap<String, BlamesByTest> = BTreeMap::new();
        for ((corpus, test, digest), accumulator) in merged {
            blames
                .entry(corpus)
                .or_default()
                .entry(test)
                .or_default()
                .insert(digest, accumulator.finish());
        }

        tracing::debug!(
            traces = traces.len(),
            ignored = ignored.len(),
            shards = shard_count,
            corpora = blames.len(),
            "computed blame"
        );
        Self { blames }
    }

    pub fn get(&self, corpus: &str, test: &str, digest: &str) -> Option<&BlameDistribution> {
        self.blames
            .get(corpus)
            .and_then(|tests| tests.get(test))
            .and_then(|digests| digests.get(digest))
    }

    /// Blame for a pair, empty when the pair was never seen untriaged.
    pub fn blame(&self, corpus: &str, test: &str, digest: &str) -> BlameDistribution {
        self.get(corpus, test, digest).cloned().unwrap_or_default()
    }

    pub fn tests(&self, corpus: &str) -> impl Iterator<Item = &str> {
        self.blames
            .get(corpus)
            .into_iter()
            .flat_map(|tests| tests.keys().map(String::as_str))
    }
}

fn shard_count(trace_count: usize) -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    (trace_count / MIN_TRACES_PER_SHARD)
        .min(parallelism)
        .clamp(1, MAX_SHARDS)
}

fn blame_shard(traces: &[&Trace], expectations: &Expectations) -> ShardBlame {
    let mut shard = ShardBlame::new();
    for trace in traces {
        let (Some(corpus), Some(test)) = (trace.corpus(), trace.test_name()) else {
            continue;
        };

        let mut seen = HashSet::new();
        for digest in trace.digests.iter().flatten() {
            if !seen.insert(digest.as_str()) {
                continue;
            }
            if expectations.classification(test, digest) != Label::Untriaged {
                continue;
            }
            if let Some(range) = candidate_range(&trace.digests, digest) {
                shard
                    .entry((corpus.to_owned(), test.to_owned(), digest.clone()))
                    .or_default()
                    .add(range);
            }
        }
    }
    shard
}

#[cfg(test)]
mod tests {
    use gold_core::Params;

    use super::*;

    fn slots(values: &[Option<&str>]) -> Vec<Option<Digest>> {
        values.iter().map(|d| d.map(str::to_owned)).collect()
    }

    fn commits(count: usize) -> Vec<Commit> {
        (0..count)
            .map(|index| Commit {
                hash: format!("hash{index}"),
                index,
                timestamp: 1_000 + index as i64,
                author: format!("author{}", index % 2),
                subject: format!("change {index}"),
            })
            .collect()
    }

    fn trace(test: &str, device: &str, values: &[Option<&str>]) -> Trace {
        corpus_trace("gm", test, device, values)
    }

    fn corpus_trace(corpus: &str, test: &str, device: &str, values: &[Option<&str>]) -> Trace {
        let params: Params = [
            ("name".to_owned(), test.to_owned()),
            ("device".to_owned(), device.to_owned()),
            ("source_type".to_owned(), corpus.to_owned()),
        ]
        .into_iter()
        .collect();
        Trace::new(params, slots(values))
    }

    fn blame(tile: &Tile, test: &str, digest: &str) -> BlameDistribution {
        compute_blame("gm", test, digest, tile, &Expectations::new(), &BTreeSet::new())
    }

    #[test]
    fn candidate_range_blames_transition_into_head_run() {
        let digests = slots(&[Some("A"), Some("A"), Some("B"), None, Some("B")]);
        assert_eq!(
            candidate_range(&digests, "B"),
            Some(CandidateRange {
                start: 2,
                end: 2,
                old: false
            })
        );
    }

    #[test]
    fn candidate_range_widens_over_missing_results() {
        let digests = slots(&[Some("A"), None, None, Some("B")]);
        assert_eq!(
            candidate_range(&digests, "B"),
            Some(CandidateRange {
                start: 1,
                end: 3,
                old: false
            })
        );
    }

    #[test]
    fn candidate_range_uses_first_appearance_when_not_at_head() {
        let digests = slots(&[Some("A"), Some("B"), Some("B"), Some("A"), Some("A")]);
        assert_eq!(
            candidate_range(&digests, "B"),
            Some(CandidateRange {
                start: 1,
                end: 1,
                old: false
            })
        );
        assert_eq!(candidate_range(&digests, "C"), None);
    }

    #[test]
    fn candidate_range_marks_digests_present_from_window_start() {
        let digests = slots(&[None, Some("B"), Some("B")]);
        assert_eq!(
            candidate_range(&digests, "B"),
            Some(CandidateRange {
                start: 1,
                end: 1,
                old: true
            })
        );
        assert_eq!(candidate_range(&slots(&[None, None]), "B"), None);
    }

    #[test]
    fn disagreeing_traces_split_weight_across_commits() {
        let tile = Tile::new(
            commits(4),
            vec![
                trace("circle", "a", &[Some("A"), Some("B"), Some("B"), Some("B")]),
                trace("circle", "b", &[Some("A"), Some("B"), Some("B"), Some("B")]),
                trace("circle", "c", &[Some("A"), Some("A"), None, Some("B")]),
            ],
        )
        .expect("tile");

        let dist = blame(&tile, "circle", "B");
        assert_eq!(dist.freq, vec![1, 2, 3]);
        assert_eq!(dist.weights, vec![2, 1, 1]);
        assert!(!dist.old);
        assert_eq!(dist.authors(tile.commits()), vec!["author0", "author1"]);
    }

    #[test]
    fn blame_is_empty_without_matching_traces() {
        let tile = Tile::new(commits(2), vec![trace("circle", "a", &[Some("A"), Some("B")])])
            .expect("tile");

        assert!(blame(&tile, "square", "B").is_empty());
        assert!(blame(&tile, "circle", "Z").is_empty());
    }

    #[test]
    fn blamer_skips_triaged_digests_and_matches_single_pair_blame() {
        let tile = Tile::new(
            commits(3),
            vec![
                trace("circle", "a", &[Some("A"), Some("B"), Some("C")]),
                trace("circle", "b", &[Some("A"), None, Some("C")]),
            ],
        )
        .expect("tile");
        let mut exp = Expectations::new();
        exp.set("circle", "A", Label::Positive);

        let none = BTreeSet::new();
        let blamer = Blamer::new(&tile, &exp, &none);
        assert!(blamer.get("gm", "circle", "A").is_none());
        assert_eq!(
            blamer.blame("gm", "circle", "C"),
            compute_blame("gm", "circle", "C", &tile, &exp, &none)
        );
        assert_eq!(blamer.blame("gm", "circle", "C").freq, vec![1, 2]);
        assert_eq!(blamer.blame("gm", "circle", "C").weights, vec![1, 2]);
        assert_eq!(blamer.tests("gm").collect::<Vec<_>>(), vec!["circle"]);
        assert_eq!(blamer.tests("svg").count(), 0);
    }

    #[test]
    fn sharded_blamer_matches_sequential_blame() {
        let traces: Vec<Trace> = (0..2_000)
            .map(|device| {
                let values = if device % 3 == 0 {
                    [Some("A"), None, Some("B"), Some("B")]
                } else {
                    [Some("A"), Some("B"), Some("B"), Some("B")]
                };
                trace("circle", &format!("device{device:04}"), &values)
            })
            .collect();
        let tile = Tile::new(commits(4), traces).expect("tile");
        let exp = Expectations::new();

        let none = BTreeSet::new();
        let blamer = Blamer::new(&tile, &exp, &none);
        let expected = compute_blame("gm", "circle", "B", &tile, &exp, &none);
        assert_eq!(blamer.blame("gm", "circle", "B"), expected);
        assert_eq!(expected.weights.iter().sum::<u32>(), 2_000 + 667);
    }

    #[test]
    fn ignored_and_other_corpus_traces_do_not_widen_blame() {
        let flaky = corpus_trace(
            "gm",
            "circle",
            "flaky",
            &[Some("A"), Some("B"), Some("B"), Some("B"), Some("B")],
        );
        let flaky_id = flaky.id();
        let tile = Tile::new(
            commits(5),
            vec![
                trace("circle", "good", &[Some("A"), Some("A"), Some("A"), Some("A"), Some("B")]),
                flaky,
                corpus_trace("svg", "circle", "good", &[Some("A"), Some("B"), None, None, None]),
            ],
        )
        .expect("tile");
        let exp = Expectations::new();
        let ignored: BTreeSet<TraceId> = [flaky_id].into_iter().collect();

        let blamer = Blamer::new(&tile, &exp, &ignored);
        assert_eq!(blamer.blame("gm", "circle", "B").freq, vec![4]);
        assert_eq!(blamer.blame("gm", "circle", "B").weights, vec![1]);
        assert_eq!(blamer.blame("svg", "circle", "B").freq, vec![1]);
        assert_eq!(
            blamer.blame("gm", "circle", "B"),
            compute_blame("gm", "circle", "B", &tile, &exp, &ignored)
        );
    }
}
