//! Test-runner log artifact source
//!
//! The test runner copies device outputs into its invocation log tree, e.g.
//! `/tmp/atest_result_$USER/LATEST/log/.../inv_<n>/<name>.actual_<hash>.json.gz`.
//! File names follow several historical conventions; see
//! [`parse_artifact_file_name`]. The tree is read-only to us: nothing is
//! consumed, and the same files show up again on the next refresh.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::filename::{looks_like_json_artifact, parse_artifact_file_name, ArtifactFileName};
use super::{
    contained_destination, copy_artifact, walk_files, ArtifactSource, MediaRequest, SourceError,
    SourceLocator,
};

/// Extension of recordings that accompany a golden
const MEDIA_EXTENSION: &str = "mp4";

/// Default log tree for the current user
pub fn default_runner_root() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_default();
    PathBuf::from(format!("/tmp/atest_result_{}/LATEST/", user))
}

/// Artifact source reading a test-runner invocation log tree
#[derive(Debug, Clone)]
pub struct RunnerLogSource {
    root: PathBuf,
}

impl RunnerLogSource {
    /// Source over `root`, which must exist
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SourceError::RootMissing(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn parse_locator(locator: &SourceLocator) -> Result<ArtifactFileName, SourceError> {
        Path::new(locator.as_str())
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_artifact_file_name)
            .ok_or_else(|| SourceError::Unrecognised(locator.to_string()))
    }

    fn find_recording(&self, golden_name: &str) -> Result<Option<(PathBuf, bool)>, SourceError> {
        for path in walk_files(&self.root)? {
            let Some(parsed) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_artifact_file_name)
            else {
                continue;
            };
            if parsed.name == golden_name && parsed.extension == MEDIA_EXTENSION {
                return Ok(Some((path, parsed.compressed)));
            }
        }
        Ok(None)
    }
}

impl ArtifactSource for RunnerLogSource {
    fn name(&self) -> &'static str {
        "runner-log"
    }

    fn list_pending(&self) -> Result<Vec<SourceLocator>, SourceError> {
        let mut pending = Vec::new();
        for path in walk_files(&self.root)? {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !looks_like_json_artifact(file_name) {
                continue;
            }
            match parse_artifact_file_name(file_name) {
                Some(parsed) if parsed.extension == "json" => {
                    pending.push(SourceLocator::from(path.as_path()))
                }
                _ => debug!("Skipping unrecognised artifact name {}", path.display()),
            }
        }
        Ok(pending)
    }

    fn materialize(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, SourceError> {
        let parsed = Self::parse_locator(locator)?;
        let local = dir.join(parsed.local_json_name());
        copy_artifact(Path::new(locator.as_str()), &local, parsed.compressed)?;
        Ok(local)
    }

    fn materialize_media(
        &self,
        locator: &SourceLocator,
        media: MediaRequest<'_>,
        workspace: &Path,
    ) -> Result<Option<PathBuf>, SourceError> {
        let parsed = Self::parse_locator(locator)?;
        let Some(local) = contained_destination(workspace, media.media_location) else {
            warn!(
                "Refusing recording {:?} of {}: escapes the workspace",
                media.media_location, locator
            );
            return Ok(None);
        };

        match self.find_recording(&parsed.name)? {
            Some((recording, compressed)) => {
                copy_artifact(&recording, &local, compressed)?;
                Ok(Some(local))
            }
            None => {
                debug!("No recording found for {}", parsed.name);
                Ok(None)
            }
        }
    }
}
