//! HTTP API handlers for golden-watcher

pub mod auth;
pub mod files;
pub mod health;
pub mod service;

pub use auth::{auth_middleware, preflight, with_cross_origin_headers};
pub use files::{serve_expected, serve_golden};
pub use health::health_routes;
pub use service::{list_goldens, refresh_goldens, update_golden, GoldenView};

use crate::ApiError;

/// Fallback for unknown routes and unsupported methods on known ones
pub async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}
