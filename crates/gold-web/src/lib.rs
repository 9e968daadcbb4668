use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use gold_analysis::{ByBlameEntry, RefreshCache, TriageEngine};
use gold_store::{ExpectationsStore, IgnoreStore, TileProvider};
use tower_http::trace::TraceLayer;

mod api;
mod error;

pub use api::{ByBlameResponse, TriageLogResponse, TriageResponse};
pub use error::WebError;

/// Header the fronting login proxy puts the signed-in user's email in.
pub const USER_HEADER: &str = "x-gold-user";

pub const DEFAULT_LOG_PAGE_SIZE: usize = 20;
pub const MAX_LOG_PAGE_SIZE: usize = 200;

pub type ByBlameCache = RefreshCache<String, Arc<Vec<ByBlameEntry>>>;

#[derive(Clone)]
pub struct AppState {
    pub tiles: Arc<dyn TileProvider>,
    pub ignores: Arc<dyn IgnoreStore>,
    pub engine: TriageEngine,
    /// Blame groups per corpus; invalidated by primary-branch triage.
    pub by_blame: ByBlameCache,
}

impl AppState {
    pub fn new(
        tiles: Arc<dyn TileProvider>,
        store: Arc<dyn ExpectationsStore>,
        ignores: Arc<dyn IgnoreStore>,
        by_blame: ByBlameCache,
    ) -> Self {
        Self {
            tiles,
            ignores,
            engine: TriageEngine::new(store),
            by_blame,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/json/v2/byblame", get(api::by_blame))
        .route("/json/v2/triage", post(api::triage))
        .route("/json/v2/triagelog", get(api::triage_log))
        .route("/json/v2/triagelog/undo", post(api::undo))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
