use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use gold_analysis::{
    AnalysisError, ByBlameEntry, TileIndex, TriageRequest, WireTriageRequest, compute_by_blame,
};
use gold_core::{CORPUS_FIELD, Scope, TriageLogEntry};
use serde::{Deserialize, Serialize};

use crate::{AppState, DEFAULT_LOG_PAGE_SIZE, MAX_LOG_PAGE_SIZE, USER_HEADER, WebError};

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ByBlameParams {
    /// URL-encoded trace query, e.g. `source_type=gm`.
    query: Option<String>,
    corpus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByBlameResponse {
    pub data: Vec<ByBlameEntry>,
    /// Set when a refresh overran its wait and an older result was served.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageResponse {
    pub id: String,
    #[serde(rename = "changeCount")]
    pub change_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TriageLogParams {
    offset: Option<usize>,
    size: Option<usize>,
    details: Option<bool>,
    issue: Option<String>,
    crs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageLogResponse {
    pub entries: Vec<TriageLogEntry>,
    pub offset: usize,
    pub size: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct UndoParams {
    id: Option<String>,
}

pub(crate) async fn healthz() -> &'static str {
    "ok"
}

pub(crate) async fn by_blame(
    State(state): State<AppState>,
    Query(params): Query<ByBlameParams>,
) -> Result<Json<ByBlameResponse>, WebError> {
    let corpus = corpus_from_params(&params)?;

    let tiles = Arc::clone(&state.tiles);
    let store = Arc::clone(state.engine.store());
    let ignores = Arc::clone(&state.ignores);
    let refresh_corpus = corpus.clone();
    let cached = state
        .by_blame
        .get_or_refresh(corpus, move || {
            let index = TileIndex::build(tiles.as_ref(), store.as_ref(), ignores.as_ref())?;
            compute_by_blame(&index, &refresh_corpus).map(Arc::new)
        })
        .await?;

    Ok(Json(ByBlameResponse {
        data: cached.value.as_ref().clone(),
        stale: cached.is_stale(),
    }))
}

pub(crate) async fn triage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(wire): Json<WireTriageRequest>,
) -> Result<Json<TriageResponse>, WebError> {
    let user = require_user(&headers)?;
    let request = TriageRequest::from_wire(wire)?;

    let engine = state.engine.clone();
    let record = run_blocking(move || engine.triage(&user, &request)).await?;
    if record.scope.is_primary() && record.num_changes() > 0 {
        state.by_blame.invalidate();
    }

    Ok(Json(TriageResponse {
        change_count: record.num_changes(),
        id: record.id,
    }))
}

pub(crate) async fn triage_log(
    State(state): State<AppState>,
    Query(params): Query<TriageLogParams>,
) -> Result<Json<TriageLogResponse>, WebError> {
    let offset = params.offset.unwrap_or(0);
    let size = params
        .size
        .unwrap_or(DEFAULT_LOG_PAGE_SIZE)
        .clamp(1, MAX_LOG_PAGE_SIZE);
    let details = params.details.unwrap_or(false);
    let scope = Scope::from_request(params.issue.as_deref(), params.crs.as_deref());

    let engine = state.engine.clone();
    let page = run_blocking(move || engine.log(&scope, offset, size, details)).await?;

    Ok(Json(TriageLogResponse {
        entries: page.records.iter().map(TriageLogEntry::from).collect(),
        offset,
        size,
        total: page.total,
    }))
}

pub(crate) async fn undo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UndoParams>,
) -> Result<Json<TriageLogEntry>, WebError> {
    let user = require_user(&headers)?;
    let id = params
        .id
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WebError::BadRequest("missing 'id' query parameter".to_owned()))?;

    let engine = state.engine.clone();
    let record = run_blocking(move || engine.undo(&id, &user)).await?;
    if record.scope.is_primary() && record.num_changes() > 0 {
        state.by_blame.invalidate();
    }

    Ok(Json(TriageLogEntry::from(&record)))
}

fn corpus_from_params(params: &ByBlameParams) -> Result<String, WebError> {
    if let Some(corpus) = params
        .corpus
        .as_deref()
        .map(str::trim)
        .filter(|corpus| !corpus.is_empty())
    {
        return Ok(corpus.to_owned());
    }

    params
        .query
        .as_deref()
        .and_then(corpus_from_query)
        .ok_or_else(|| {
            WebError::BadRequest(format!(
                "a '{CORPUS_FIELD}' must be given in 'query' or as 'corpus'"
            ))
        })
}

/// First `source_type` value of an `a=b&c=d` trace query.
fn corpus_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == CORPUS_FIELD)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn require_user(headers: &HeaderMap) -> Result<String, WebError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| WebError::Unauthorized("you must be logged in to triage".to_owned()))
}

async fn run_blocking<T, F>(work: F) -> Result<T, WebError>
where
    F: FnOnce() -> Result<T, AnalysisError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await??)
}
