use std::collections::BTreeMap;
use std::sync::Arc;

use gold_core::{Digest, Label, LabelChoice, Scope, TestName, TriageDelta, TriageRecord};
use gold_store::{ExpectationsStore, LogPage, ScopedExpectations};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{AnalysisError, current_unix_timestamp_millis};

/// Triage request body as sent by the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireTriageRequest {
    #[serde(rename = "testDigestStatus", default)]
    pub test_digest_status: BTreeMap<TestName, BTreeMap<Digest, Option<String>>>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub issue: Option<String>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(rename = "imageMatchingAlgorithm", default)]
    pub image_matching_algorithm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriageRequest {
    pub changes: BTreeMap<TestName, BTreeMap<Digest, LabelChoice>>,
    pub scope: Scope,
    /// When set, recorded as the author instead of the calling user.
    pub image_matching_algorithm: Option<String>,
}

impl TriageRequest {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn with_change(
        mut self,
        test: impl Into<TestName>,
        digest: impl Into<Digest>,
        choice: LabelChoice,
    ) -> Self {
        self.changes
            .entry(test.into())
            .or_default()
            .insert(digest.into(), choice);
        self
    }

    /// Validates labels and resolves the scope. Unknown label strings are
    /// rejected here so the engine only ever sees closed values.
    pub fn from_wire(wire: WireTriageRequest) -> Result<Self, AnalysisError> {
        let mut changes: BTreeMap<TestName, BTreeMap<Digest, LabelChoice>> = BTreeMap::new();
        for (test, digests) in wire.test_digest_status {
            if test.trim().is_empty() {
                return Err(AnalysisError::InvalidInput(
                    "test name must not be empty".to_owned(),
                ));
            }
            for (digest, label) in digests {
                if digest.trim().is_empty() {
                    return Err(AnalysisError::InvalidInput(format!(
                        "empty digest for test '{test}'"
                    )));
                }
                let choice = LabelChoice::from_wire(label.as_deref()).map_err(|err| {
                    AnalysisError::InvalidInput(format!("test '{test}' digest '{digest}': {err}"))
                })?;
                changes.entry(test.clone()).or_default().insert(digest, choice);
            }
        }

        Ok(Self {
            changes,
            scope: Scope::from_request(wire.issue.as_deref(), wire.crs.as_deref()),
            image_matching_algorithm: wire
                .image_matching_algorithm
                .map(|name| name.trim().to_owned())
                .filter(|name| !name.is_empty()),
        })
    }
}

/// Applies triage decisions and undos as append-only log records.
#[derive(Clone)]
pub struct TriageEngine {
    store: Arc<dyn ExpectationsStore>,
    clock: fn() -> i64,
}

impl TriageEngine {
    pub fn new(store: Arc<dyn ExpectationsStore>) -> Self {
        Self::with_clock(store, current_unix_timestamp_millis)
    }

    pub fn with_clock(store: Arc<dyn ExpectationsStore>, clock: fn() -> i64) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn ExpectationsStore> {
        &self.store
    }

    /// Writes exactly one record per call. `Unchanged` choices are dropped
    /// before the deltas are built; a request made only of them still writes
    /// a record, with zero changes.
    pub fn triage(
        &self,
        actor: &str,
        request: &TriageRequest,
    ) -> Result<TriageRecord, AnalysisError> {
        let actor = require_actor(actor)?;
        let author = request
            .image_matching_algorithm
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(actor);

        let scoped = ScopedExpectations::new(self.store.as_ref(), request.scope.clone());
        let current = scoped.expectations()?;

        let deltas: Vec<TriageDelta> = request
            .changes
            .iter()
            .flat_map(|(test, digests)| {
                digests.iter().filter_map(move |(digest, choice)| {
                    choice.label().map(|label_after| (test, digest, label_after))
                })
            })
            .map(|(test, digest, label_after)| TriageDelta {
                test: test.clone(),
                digest: digest.clone(),
                label_before: current.classification(test, digest),
                label_after,
            })
            .collect();

        let record = scoped.add_change(&deltas, author, (self.clock)())?;
        tracing::info!(
            record_id = %record.id,
            author = %record.author,
            scope = %record.scope.key(),
            changes = record.num_changes(),
            "triage recorded"
        );
        Ok(record)
    }

    /// Appends a record reversing every delta of `record_id`, in that record's
    /// scope. The original record is left as it was.
    pub fn undo(&self, record_id: &str, actor: &str) -> Result<TriageRecord, AnalysisError> {
        let actor = require_actor(actor)?;
        let record_id = record_id.trim();
        if record_id.is_empty() {
            return Err(AnalysisError::InvalidInput(
                "a triage record id is required".to_owned(),
            ));
        }

        let original = self
            .store
            .get_record(record_id)?
            .ok_or_else(|| AnalysisError::NotFound(format!("triage record '{record_id}'")))?;
        let inverse: Vec<TriageDelta> = original.deltas.iter().map(TriageDelta::inverse).collect();

        let scoped = ScopedExpectations::new(self.store.as_ref(), original.scope.clone());
        let record = scoped.add_change(&inverse, actor, (self.clock)())?;
        tracing::info!(
            record_id = %record.id,
            undone = %original.id,
            author = %record.author,
            changes = record.num_changes(),
            "triage undone"
        );
        Ok(record)
    }

    pub fn log(
        &self,
        scope: &Scope,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<LogPage, AnalysisError> {
        Ok(self.store.query_log(scope, offset, size, with_details)?)
    }

    pub fn classification(&self, scope: &Scope, test: &str, digest: &str) -> Result<Label, AnalysisError> {
        Ok(self.store.expectations(scope)?.classification(test, digest))
    }
}

fn require_actor(actor: &str) -> Result<&str, AnalysisError> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(AnalysisError::InvalidInput(
            "triage requires an authenticated user".to_owned(),
        ));
    }
    Ok(actor)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(value)) => Some(value),
        Some(Value::Number(value)) => Some(value.to_string()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected a string or number, got {other}"
            )));
        }
    })
}
