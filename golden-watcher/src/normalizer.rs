//! Metadata normalizer
//!
//! Actual-result files carry a reserved `//metadata` object next to the
//! comparable payload. The normalizer pulls the review fields out of that
//! block and rewrites the local file without it, so what the review UI
//! diffs is exactly the payload.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

/// Key of the reserved metadata block
pub const METADATA_KEY: &str = "//metadata";

/// Normalizer errors
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// Artifact lacks the metadata block or a required field
    #[error("Malformed artifact {path}: {reason}")]
    MalformedArtifact { path: PathBuf, reason: String },

    /// Reading or rewriting the local file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Review fields extracted from the metadata block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenMetadata {
    pub result: String,
    pub golden_repo_path: String,
    pub golden_identifier: String,
    pub test_class_name: String,
    pub test_method_name: String,
    /// Directory on the producing device the artifact was written to
    pub device_local_path: String,
    /// Recording path relative to `device_local_path`
    pub video_location: Option<String>,
    /// Capture time, when the producer recorded one
    pub test_time: Option<String>,
}

/// Extract metadata from the file at `path` and strip it from the file
pub fn normalize_file(path: &Path) -> Result<GoldenMetadata, NormalizeError> {
    let content = fs::read(path)?;
    let malformed = |reason: String| NormalizeError::MalformedArtifact {
        path: path.to_path_buf(),
        reason,
    };

    let document: Value =
        serde_json::from_slice(&content).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
    let (metadata, body) = split_metadata(document).map_err(malformed)?;

    let rendered = serde_json::to_string_pretty(&Value::Object(body))
        .map_err(|e| malformed(format!("cannot render body: {}", e)))?;
    fs::write(path, rendered)?;

    Ok(metadata)
}

/// Separate the metadata block from the payload body
///
/// Pure counterpart of [`normalize_file`]; the error is a human-readable
/// reason.
pub fn split_metadata(document: Value) -> Result<(GoldenMetadata, Map<String, Value>), String> {
    let Value::Object(mut body) = document else {
        return Err("top-level value is not an object".to_string());
    };

    let block = match body.shift_remove(METADATA_KEY) {
        Some(Value::Object(block)) => block,
        Some(_) => return Err(format!("{} is not an object", METADATA_KEY)),
        None => return Err(format!("missing {} block", METADATA_KEY)),
    };

    let metadata = GoldenMetadata {
        result: required(&block, "result")?,
        golden_repo_path: required(&block, "goldenRepoPath")?,
        golden_identifier: required(&block, "goldenIdentifier")?,
        test_class_name: required(&block, "testClassName")?,
        test_method_name: required(&block, "testMethodName")?,
        device_local_path: required(&block, "deviceLocalPath")?,
        video_location: optional(&block, "videoLocation"),
        test_time: optional(&block, "testTime"),
    };

    Ok((metadata, body))
}

fn required(block: &Map<String, Value>, key: &str) -> Result<String, String> {
    match block.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(format!("metadata field {} is not a string", key)),
        None => Err(format!("missing metadata field {}", key)),
    }
}

fn optional(block: &Map<String, Value>, key: &str) -> Option<String> {
    block
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
