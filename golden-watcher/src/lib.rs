//! golden-watcher library - golden image review service
//!
//! Collects actual-result artifacts from a device or local test output,
//! caches their metadata and serves them to the review UI, which can then
//! promote selected results into the source tree.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod cache;
pub mod error;
pub mod normalizer;
pub mod source;

pub use crate::cache::{GoldenCache, GoldenRecord};
pub use crate::error::{ApiError, ApiResult};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Golden records; every refresh, promotion and listing holds this lock
    pub cache: Arc<Mutex<GoldenCache>>,
    /// Shared secret expected in the access token header
    pub access_token: Arc<str>,
    /// Base URL clients reach this service at, e.g. `http://localhost:8123`
    pub public_url: Arc<str>,
    /// Per-run workspace served under `/golden/`
    pub workspace: Arc<PathBuf>,
}

impl AppState {
    /// Create new application state around a cache
    pub fn new(
        cache: GoldenCache,
        access_token: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        let workspace = Arc::new(cache.workspace().to_path_buf());
        Self {
            cache: Arc::new(Mutex::new(cache)),
            access_token: Arc::from(access_token.into()),
            public_url: Arc::from(public_url.into().trim_end_matches('/')),
            workspace,
        }
    }
}

/// Build application router
///
/// `/service/*` requires the access token; capability URLs under
/// `/golden/` and `/expected/` and the health check do not.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;
    use axum::routing::{get, post, put};

    // Protected routes (require access token)
    let protected = Router::new()
        .route("/service/list", get(api::list_goldens).fallback(api::not_found))
        .route("/service/refresh", post(api::refresh_goldens).fallback(api::not_found))
        .route("/service/update", put(api::update_golden).fallback(api::not_found))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::auth_middleware,
        ));

    // Public routes (capability URLs, no token)
    let public = Router::new()
        .route("/golden/:checksum/*path", get(api::serve_golden).fallback(api::not_found))
        .route("/expected/:id", get(api::serve_expected).fallback(api::not_found))
        .merge(api::health_routes());

    let router = Router::new()
        .merge(protected)
        .merge(public)
        .fallback(api::not_found)
        .layer(middleware::from_fn(api::preflight));

    api::with_cross_origin_headers(router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
