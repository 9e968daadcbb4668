use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use gold_core::{Expectations, Scope, TriageDelta, TriageRecord};

use crate::{ExpectationsStore, LogPage, StoreError};

/// Process-local expectations store. Every call holds one lock, which makes
/// `add_change` all-or-nothing.
#[derive(Debug, Default)]
pub struct MemExpectationsStore {
    state: Mutex<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    by_scope: HashMap<Scope, Expectations>,
    records: Vec<TriageRecord>,
}

impl MemExpectationsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds primary-branch expectations without writing a log record.
    pub fn with_primary(expectations: Expectations) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            state.by_scope.insert(Scope::Primary, expectations);
        }
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ExpectationsStore for MemExpectationsStore {
    fn expectations(&self, scope: &Scope) -> Result<Expectations, StoreError> {
        let state = self.lock()?;
        let primary = state
            .by_scope
            .get(&Scope::Primary)
            .cloned()
            .unwrap_or_default();
        if scope.is_primary() {
            return Ok(primary);
        }

        Ok(match state.by_scope.get(scope) {
            Some(changelist) => primary.overlay(changelist),
            None => primary,
        })
    }

    fn add_change(
        &self,
        scope: &Scope,
        deltas: &[TriageDelta],
        author: &str,
        timestamp_ms: i64,
    ) -> Result<TriageRecord, StoreError> {
        let mut state = self.lock()?;
        let id = (state.records.len() + 1).to_string();
        let record = TriageRecord::new(id, scope.clone(), author, timestamp_ms, deltas.to_vec());

        state
            .by_scope
            .entry(scope.clone())
            .or_default()
            .apply(deltas);
        state.records.push(record.clone());

        Ok(record)
    }

    fn query_log(
        &self,
        scope: &Scope,
        offset: usize,
        size: usize,
        with_details: bool,
    ) -> Result<LogPage, StoreError> {
        let state = self.lock()?;
        let mut in_scope: Vec<(usize, &TriageRecord)> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| &record.scope == scope)
            .collect();
        in_scope.sort_by(|(a_seq, a), (b_seq, b)| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| b_seq.cmp(a_seq))
        });

        let total = in_scope.len();
        let records = in_scope
            .into_iter()
            .skip(offset)
            .take(size)
            .map(|(_, record)| {
                if with_details {
                    record.clone()
                } else {
                    record.clone().without_details()
                }
            })
            .collect();

        Ok(LogPage { records, total })
    }

    fn get_record(&self, id: &str) -> Result<Option<TriageRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .records
            .iter()
            .find(|record| record.id == id.trim())
            .cloned())
    }
}
