//! Review service endpoints
//!
//! - `GET /service/list`: current goldens with freshly computed URLs
//! - `POST /service/refresh`: optionally clear, then re-read the source
//! - `PUT /service/update?id=<id>`: promote one golden into the source tree
//!
//! Each handler takes the cache lock for its whole pass and does the
//! blocking filesystem and adb work on the blocking pool.

use std::path::{Component, Path};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::cache::{GoldenCache, GoldenRecord};
use crate::{ApiError, ApiResult, AppState};

/// Client-facing projection of a golden record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GoldenView {
    pub id: String,
    pub result: String,
    pub label: String,
    pub golden_repo_path: String,
    pub updated: bool,
    pub test_class_name: String,
    pub test_method_name: String,
    pub test_time: String,
    pub actual_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Only present while the golden exists in the source tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_url: Option<String>,
}

/// Body of `POST /service/refresh`
#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    /// Drop all cached goldens before re-reading
    #[serde(default)]
    pub clear: bool,
}

/// Query of `PUT /service/update`
#[derive(Debug, Deserialize)]
pub struct UpdateQuery {
    pub id: Option<String>,
}

/// GET /service/list
pub async fn list_goldens(State(state): State<AppState>) -> ApiResult<Json<Vec<GoldenView>>> {
    let cache = state.cache.clone().lock_owned().await;
    let public_url = state.public_url.clone();

    let views = tokio::task::spawn_blocking(move || project(&cache, &public_url)).await?;
    Ok(Json(views))
}

/// POST /service/refresh
///
/// **Request:** `{"clear": true}` with `Content-Type: application/json`
/// **Response:** same as `/service/list`
///
/// A refresh arriving while another runs waits for the lock.
pub async fn refresh_goldens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Vec<GoldenView>>> {
    if !is_json(&headers) {
        return Err(ApiError::BadRequest(
            "Content-Type must be application/json".to_string(),
        ));
    }
    let request: RefreshRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let mut cache = state.cache.clone().lock_owned().await;
    let public_url = state.public_url.clone();

    let views = tokio::task::spawn_blocking(move || -> ApiResult<Vec<GoldenView>> {
        if request.clear {
            cache.clear_and_refresh()?;
        } else {
            cache.refresh()?;
        }
        Ok(project(&cache, &public_url))
    })
    .await??;

    Ok(Json(views))
}

/// PUT /service/update?id=<id>
///
/// **Response:** `{"result": "OK"}`; 400 for an unknown id
pub async fn update_golden(
    State(state): State<AppState>,
    Query(query): Query<UpdateQuery>,
) -> ApiResult<Json<Value>> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing id parameter".to_string()))?;

    let mut cache = state.cache.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || -> ApiResult<()> {
        let record = cache.promote(&id)?;
        info!(
            label = %record.golden_identifier,
            path = %record.golden_repo_path,
            "Promoted golden"
        );
        Ok(())
    })
    .await??;

    Ok(Json(json!({ "result": "OK" })))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

/// Project every cached record for the client
pub fn project(cache: &GoldenCache, public_url: &str) -> Vec<GoldenView> {
    cache
        .all()
        .into_iter()
        .filter_map(|record| view(cache, record, public_url))
        .collect()
}

fn view(cache: &GoldenCache, record: &GoldenRecord, public_url: &str) -> Option<GoldenView> {
    let golden_url = |path: &Path| {
        url_path(cache.workspace(), path)
            .map(|relative| format!("{}/golden/{}/{}", public_url, record.checksum, relative))
    };

    let expected_url = cache
        .expected_path(record)
        .filter(|path| path.is_file())
        .map(|_| format!("{}/expected/{}", public_url, record.id));

    Some(GoldenView {
        id: record.id.clone(),
        result: record.result.clone(),
        label: record.golden_identifier.clone(),
        golden_repo_path: record.golden_repo_path.clone(),
        updated: record.promoted,
        test_class_name: record.test_class_name.clone(),
        test_method_name: record.test_method_name.clone(),
        test_time: record.test_time.clone(),
        actual_url: golden_url(&record.local_raw_path)?,
        video_url: record.local_media_path.as_deref().and_then(golden_url),
        expected_url,
    })
}

/// `path` relative to `root`, joined with `/`
fn url_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    let parts = parts?;
    (!parts.is_empty()).then(|| parts.join("/"))
}
