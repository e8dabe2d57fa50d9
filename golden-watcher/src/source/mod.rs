//! Artifact sources
//!
//! An artifact source knows where a test run leaves its actual-result files
//! and how to bring them into the per-run workspace. Three variants exist,
//! one of which is selected at startup:
//!
//! - [`DeviceSource`]: pulls from a connected device over adb
//! - [`RunnerLogSource`]: reads the test runner's invocation log tree
//! - [`StudioSource`]: reads the IDE run output tree
//!
//! All variants yield the same [`SourceLocator`]s and local files, so the
//! cache never needs to know which one it is talking to.

pub mod device;
pub mod filename;
pub mod runner_log;
pub mod studio;

pub use device::{AdbClient, DeviceSource};
pub use runner_log::RunnerLogSource;
pub use studio::StudioSource;

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

/// Artifact source errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// An adb invocation exited unsuccessfully
    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// adb refused to restart as root
    #[error("Unable to run adbd as root: {0}")]
    RootUnavailable(String),

    /// No device serial given and none connected
    #[error("No adb devices found")]
    NoDevice,

    /// No device serial given and several connected
    #[error("Multiple adb devices found, specify --serial")]
    MultipleDevices,

    /// Configured output directory does not exist
    #[error("Artifact root not found: {0}")]
    RootMissing(PathBuf),

    /// Locator does not follow the source's naming convention
    #[error("Unrecognised artifact: {0}")]
    Unrecognised(String),

    /// I/O error while copying or decompressing
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opaque descriptor of where an artifact came from
///
/// A device path for the device source, a filesystem path for the log
/// sources. The identity hash of a golden is derived from this value only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceLocator(String);

impl SourceLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable identity hash used as the API-level id
    pub fn id(&self) -> String {
        golden_common::hashing::stable_id(&self.0)
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for SourceLocator {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

/// Auxiliary recording referenced by an artifact's metadata
#[derive(Debug, Clone, Copy)]
pub struct MediaRequest<'a> {
    /// Directory on the producing device the recording path is relative to
    pub device_local_path: &'a str,
    /// Recording path relative to `device_local_path` and to the workspace
    pub media_location: &'a str,
}

/// Capability set every artifact source provides
///
/// Implementations perform blocking I/O; callers run them off the async
/// runtime.
pub trait ArtifactSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Enumerate currently available artifacts; never mutates the source
    fn list_pending(&self) -> Result<Vec<SourceLocator>, SourceError>;

    /// Copy the artifact body into `dir`, returning the local path
    ///
    /// `dir` is a staging directory inside the workspace. Local file names
    /// never collide between distinct locators.
    fn materialize(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, SourceError>;

    /// Copy the artifact's recording into `workspace`, if the source has one
    fn materialize_media(
        &self,
        _locator: &SourceLocator,
        _media: MediaRequest<'_>,
        _workspace: &Path,
    ) -> Result<Option<PathBuf>, SourceError> {
        Ok(None)
    }

    /// Remove a processed artifact from the source
    fn consume(&self, _locator: &SourceLocator) -> Result<(), SourceError> {
        Ok(())
    }

    /// Whether [`consume`](Self::consume) removes artifacts, so they will
    /// not be listed again
    fn consumes_artifacts(&self) -> bool {
        false
    }
}

/// Destination of a recording inside the workspace
///
/// Returns `None` when `relative` is absolute or climbs out of `workspace`.
pub fn contained_destination(workspace: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let mut has_normal = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    has_normal.then(|| workspace.join(relative))
}

/// All regular files below `root`, in a stable order
///
/// Unreadable entries are logged and skipped.
pub(crate) fn walk_files(root: &Path) -> Result<Vec<PathBuf>, SourceError> {
    if !root.is_dir() {
        return Err(SourceError::RootMissing(root.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!("Error accessing entry: {}", e),
        }
    }
    Ok(files)
}

/// Copy `source` to `target`, creating parent directories and gunzipping
/// when `compressed` is set
pub(crate) fn copy_artifact(source: &Path, target: &Path, compressed: bool) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if compressed {
        let mut decoder = GzDecoder::new(File::open(source)?);
        let mut out = File::create(target)?;
        io::copy(&mut decoder, &mut out)?;
    } else {
        fs::copy(source, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn contained_destination_rejects_escapes() {
        let ws = Path::new("/tmp/ws");
        assert_eq!(
            contained_destination(ws, "videos/a.mp4"),
            Some(PathBuf::from("/tmp/ws/videos/a.mp4"))
        );
        assert!(contained_destination(ws, "../a.mp4").is_none());
        assert!(contained_destination(ws, "videos/../../a.mp4").is_none());
        assert!(contained_destination(ws, "/etc/passwd").is_none());
        assert!(contained_destination(ws, "").is_none());
    }

    #[test]
    fn copy_artifact_decompresses_gzip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.json.gz");
        let mut encoder = GzEncoder::new(File::create(&source).unwrap(), Compression::default());
        encoder.write_all(br#"{"frames":[]}"#).unwrap();
        encoder.finish().unwrap();

        let target = dir.path().join("out").join("a.json");
        copy_artifact(&source, &target, true).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), r#"{"frames":[]}"#);
    }

    #[test]
    fn locator_id_is_stable() {
        let a = SourceLocator::new("/data/user/0/x.actual.json");
        let b = SourceLocator::new("/data/user/0/x.actual.json");
        assert_eq!(a.id(), b.id());
    }
}
