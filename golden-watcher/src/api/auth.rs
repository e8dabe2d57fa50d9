//! Access control and cross-origin plumbing
//!
//! The review UI is served from a different origin than this local service,
//! so every response carries permissive cross-origin headers and OPTIONS is
//! answered on any path. State-reading and state-changing endpoints
//! additionally require the shared secret in the `Golden-Access-Token`
//! header.

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Router,
};
use golden_common::token::{token_matches, ACCESS_TOKEN_HEADER};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::warn;

use crate::{ApiError, AppState};

/// Methods advertised in answer to OPTIONS
pub const ALLOWED_METHODS: &str = "GET,POST,PUT";

const CORS_ALLOW_METHODS: &str = "POST, PUT, GET, OPTIONS";

// Accept-Ranges lets the browser seek in served recordings.
const CORS_ALLOW_HEADERS: &str =
    "Golden-Access-Token, Content-Type, Content-Length, Range, Accept-ranges";

/// Access token middleware
///
/// Rejects the request with 403 before the handler runs, so an
/// unauthenticated call never touches the cache.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    if !token_matches(&state.access_token, presented) {
        warn!(
            method = %request.method(),
            uri = %request.uri(),
            "Rejected request with bad access token"
        );
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(request).await)
}

/// Answer OPTIONS on any path without authentication
pub async fn preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return (
            StatusCode::OK,
            [(header::ALLOW, ALLOWED_METHODS)],
            ALLOWED_METHODS,
        )
            .into_response();
    }
    next.run(request).await
}

/// Add the permissive cross-origin headers to every response of `router`
pub fn with_cross_origin_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(overriding(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .layer(overriding(header::ACCESS_CONTROL_ALLOW_METHODS, CORS_ALLOW_METHODS))
        .layer(overriding(header::ACCESS_CONTROL_ALLOW_HEADERS, CORS_ALLOW_HEADERS))
        .layer(overriding(header::ACCEPT_RANGES, "bytes"))
}

fn overriding(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}
