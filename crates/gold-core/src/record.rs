use serde::{Deserialize, Serialize};

use crate::{Digest, Label, Scope, TestName};

/// One label change for one (test, digest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageDelta {
    pub test: TestName,
    pub digest: Digest,
    pub label_before: Label,
    pub label_after: Label,
}

impl TriageDelta {
    /// The change that takes `label_after` back to `label_before`.
    pub fn inverse(&self) -> Self {
        Self {
            test: self.test.clone(),
            digest: self.digest.clone(),
            label_before: self.label_after,
            label_after: self.label_before,
        }
    }
}

/// Immutable audit-log entry for one triage or undo call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageRecord {
    pub id: String,
    pub scope: Scope,
    pub author: String,
    pub timestamp_ms: i64,
    /// Kept separately from `deltas` so summaries can omit the details.
    pub change_count: usize,
    pub deltas: Vec<TriageDelta>,
}

impl TriageRecord {
    pub fn new(
        id: impl Into<String>,
        scope: Scope,
        author: impl Into<String>,
        timestamp_ms: i64,
        deltas: Vec<TriageDelta>,
    ) -> Self {
        Self {
            id: id.into(),
            scope,
            author: author.into(),
            timestamp_ms,
            change_count: deltas.len(),
            deltas,
        }
    }

    pub fn num_changes(&self) -> usize {
        self.change_count
    }

    pub fn without_details(mut self) -> Self {
        self.deltas.clear();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageLogDetail {
    pub test_name: TestName,
    pub digest: Digest,
    pub label: Label,
}

/// Wire form of a [`TriageRecord`] for the triage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageLogEntry {
    pub id: String,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    #[serde(rename = "changeCount")]
    pub change_count: usize,
    pub details: Vec<TriageLogDetail>,
}

impl From<&TriageRecord> for TriageLogEntry {
    fn from(record: &TriageRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.author.clone(),
            ts: record.timestamp_ms,
            change_count: record.change_count,
            details: record
                .deltas
                .iter()
                .map(|delta| TriageLogDetail {
                    test_name: delta.test.clone(),
                    digest: delta.digest.clone(),
                    label: delta.label_after,
                })
                .collect(),
        }
    }
}
