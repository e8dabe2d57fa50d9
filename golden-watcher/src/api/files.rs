//! Capability-URL file serving
//!
//! - `GET /golden/<checksum>/<path>`: a file from the per-run workspace
//! - `GET /expected/<id>`: the current source-tree golden of a record
//!
//! Neither requires the access token; the checksum and id in the URL are
//! only known to clients that listed the goldens. Every requested path is
//! resolved against its root and refused with 404 unless it stays inside.

use std::path::{Path, PathBuf};

use axum::{
    extract::{Path as UrlPath, Request, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::debug;

use crate::{ApiError, AppState};

/// GET /golden/:checksum/*path
pub async fn serve_golden(
    State(state): State<AppState>,
    UrlPath((_checksum, relative)): UrlPath<(String, String)>,
    request: Request,
) -> Response {
    serve_contained(&state.workspace, &relative, request, None).await
}

/// GET /expected/:id
pub async fn serve_expected(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    request: Request,
) -> Response {
    let target = {
        let cache = state.cache.lock().await;
        cache
            .get(&id)
            .map(|record| (cache.repo_root().to_path_buf(), record.golden_repo_path.clone()))
    };

    match target {
        Some((root, relative)) => {
            serve_contained(&root, &relative, request, Some("application/json")).await
        }
        None => ApiError::NotFound(format!("no golden with id {}", id)).into_response(),
    }
}

async fn serve_contained(
    root: &Path,
    relative: &str,
    request: Request,
    content_type: Option<&'static str>,
) -> Response {
    let Some(path) = resolve_contained(root, relative).await else {
        debug!(root = %root.display(), relative, "Refused file request");
        return ApiError::NotFound(relative.to_string()).into_response();
    };

    let mut response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    };
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// Resolve `relative` below `root`
///
/// Returns the canonical path only if it names a regular file inside the
/// canonical root; `..` segments, absolute paths and symlinks leading out
/// of the root are all refused.
pub async fn resolve_contained(root: &Path, relative: &str) -> Option<PathBuf> {
    let root = tokio::fs::canonicalize(root).await.ok()?;
    let resolved = tokio::fs::canonicalize(root.join(relative)).await.ok()?;

    if !resolved.starts_with(&root) {
        return None;
    }

    let metadata = tokio::fs::metadata(&resolved).await.ok()?;
    metadata.is_file().then_some(resolved)
}
