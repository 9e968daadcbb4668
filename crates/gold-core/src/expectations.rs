use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Digest, Label, TestName, TriageDelta};

/// Triage labels keyed by (test, digest). Anything absent is untriaged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Expectations {
    labels: BTreeMap<TestName, BTreeMap<Digest, Label>>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classification(&self, test: &str, digest: &str) -> Label {
        self.labels
            .get(test)
            .and_then(|digests| digests.get(digest))
            .copied()
            .unwrap_or_default()
    }

    /// Records an explicit label. Untriaged is stored too so that a changelist
    /// overlay can shadow a primary-branch label back to untriaged.
    pub fn set(&mut self, test: impl Into<TestName>, digest: impl Into<Digest>, label: Label) {
        self.labels
            .entry(test.into())
            .or_default()
            .insert(digest.into(), label);
    }

    pub fn apply(&mut self, deltas: &[TriageDelta]) {
        for delta in deltas {
            self.set(delta.test.as_str(), delta.digest.as_str(), delta.label_after);
        }
    }

    /// Returns a copy of `self` with every entry of `shadow` layered on top.
    pub fn overlay(&self, shadow: &Expectations) -> Expectations {
        let mut merged = self.clone();
        for (test, digest, label) in shadow.iter() {
            merged.set(test, digest, label);
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Label)> {
        self.labels.iter().flat_map(|(test, digests)| {
            digests
                .iter()
                .map(move |(digest, label)| (test.as_str(), digest.as_str(), *label))
        })
    }

    pub fn len(&self) -> usize {
        self.labels.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
