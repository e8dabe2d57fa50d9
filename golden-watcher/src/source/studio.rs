//! IDE-run artifact source
//!
//! Deviceless tests started from the IDE write plain `*.actual.json` files
//! below `/tmp/motion/`. Every fetch gets a fresh local copy.

use std::path::{Path, PathBuf};

use golden_common::hashing::freshness_token;

use super::{copy_artifact, walk_files, ArtifactSource, SourceError, SourceLocator};

/// Default output tree of IDE runs
pub const STUDIO_ROOT: &str = "/tmp/motion/";

const STUDIO_SUFFIX: &str = ".actual.json";

/// Artifact source reading the IDE run output tree
#[derive(Debug, Clone)]
pub struct StudioSource {
    root: PathBuf,
}

impl StudioSource {
    /// Source over `root`, which must exist
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SourceError::RootMissing(root));
        }
        Ok(Self { root })
    }
}

impl ArtifactSource for StudioSource {
    fn name(&self) -> &'static str {
        "studio"
    }

    fn list_pending(&self) -> Result<Vec<SourceLocator>, SourceError> {
        Ok(walk_files(&self.root)?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(STUDIO_SUFFIX))
            })
            .map(|path| SourceLocator::from(path.as_path()))
            .collect())
    }

    fn materialize(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, SourceError> {
        let source = Path::new(locator.as_str());
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SourceError::Unrecognised(locator.to_string()))?;
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json");

        let local = dir.join(format!("copy_{}_{}.{}", stem, freshness_token(), ext));
        copy_artifact(source, &local, false)?;
        Ok(local)
    }
}
