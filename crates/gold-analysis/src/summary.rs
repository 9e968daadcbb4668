use std::collections::{BTreeMap, BTreeSet};

use gold_core::{Digest, Expectations, Label, TestName, Tile, TraceId};

pub type UntriagedByTest = BTreeMap<TestName, BTreeSet<Digest>>;

/// Untriaged digests at HEAD: the latest non-missing result of every
/// non-ignored trace in `corpus` that has no label yet.
pub fn untriaged_at_head(
    tile: &Tile,
    expectations: &Expectations,
    ignored: &BTreeSet<TraceId>,
    corpus: &str,
) -> UntriagedByTest {
    let mut untriaged = UntriagedByTest::new();
    for (trace_id, trace) in tile.traces() {
        if ignored.contains(trace_id) || trace.corpus() != Some(corpus) {
            continue;
        }
        let (Some(test), Some((_, digest))) = (trace.test_name(), trace.head()) else {
            continue;
        };
        if expectations.classification(test, digest) == Label::Untriaged {
            untriaged
                .entry(test.to_owned())
                .or_default()
                .insert(digest.to_owned());
        }
    }
    untriaged
}
