//! Golden record cache
//!
//! Holds one [`GoldenRecord`] per outstanding artifact of the selected
//! [`ArtifactSource`]. It is the only state the review API reads, and it is
//! owned by a single lock in [`AppState`](crate::AppState): refresh, clear,
//! promotion and listing never interleave.
//!
//! **Refresh policy:** a refresh builds a new snapshot from scratch and swaps
//! it in. Artifacts that fail to fetch or normalize are logged and left out;
//! the rest of the cycle continues. Sources that consume their artifacts
//! cannot list them again, so records from such sources are carried over
//! until [`GoldenCache::clear`] is called.
//!
//! Artifacts are fetched into a staging directory and only moved into the
//! workspace once normalized, so a served file never carries metadata.
//! Workspace files of records that leave the cache are deleted.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use golden_common::hashing::freshness_token;
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalizer::{normalize_file, GoldenMetadata};
use crate::source::{contained_destination, ArtifactSource, MediaRequest, SourceError, SourceLocator};

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// The source could not be enumerated at all
    #[error("Failed to list artifacts from {source_name} source: {source}")]
    Enumerate {
        source_name: &'static str,
        #[source]
        source: SourceError,
    },

    /// The per-refresh staging directory could not be created
    #[error("Failed to prepare staging directory: {0}")]
    Staging(#[source] io::Error),

    /// No record with this id
    #[error("No golden with id {0}")]
    UnknownGolden(String),

    /// Repo path from the metadata points outside the source tree
    #[error("Golden path {0} is outside the source tree")]
    OutsideRepo(String),

    /// Writing the golden into the source tree failed
    #[error("Failed to update golden {id}: {source}")]
    Promotion {
        id: String,
        #[source]
        source: io::Error,
    },
}

/// One actual-result artifact awaiting review
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenRecord {
    /// Stable hash of `source_locator`
    pub id: String,
    pub source_locator: SourceLocator,
    /// Workspace copy of the payload, metadata stripped
    pub local_raw_path: PathBuf,
    /// Workspace copy of the recording
    pub local_media_path: Option<PathBuf>,
    /// Changes on every fetch; busts client caches
    pub checksum: String,
    pub result: String,
    pub golden_repo_path: String,
    pub golden_identifier: String,
    pub test_class_name: String,
    pub test_method_name: String,
    pub test_time: String,
    /// Set once the golden has been written into the source tree
    pub promoted: bool,
}

impl GoldenRecord {
    fn new(
        locator: SourceLocator,
        local_raw_path: PathBuf,
        local_media_path: Option<PathBuf>,
        metadata: GoldenMetadata,
    ) -> Self {
        Self {
            id: locator.id(),
            source_locator: locator,
            local_raw_path,
            local_media_path,
            checksum: freshness_token(),
            result: metadata.result,
            golden_repo_path: metadata.golden_repo_path,
            golden_identifier: metadata.golden_identifier,
            test_class_name: metadata.test_class_name,
            test_method_name: metadata.test_method_name,
            test_time: metadata
                .test_time
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            promoted: false,
        }
    }

    /// Workspace files owned by this record
    fn local_files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.local_raw_path.as_path()).chain(self.local_media_path.as_deref())
    }
}

/// Artifact left out of a refresh
#[derive(Debug, Clone)]
pub struct SkippedArtifact {
    pub locator: SourceLocator,
    pub reason: String,
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Default)]
pub struct RefreshSummary {
    /// Records fetched in this cycle
    pub loaded: usize,
    /// Records carried over from earlier cycles
    pub retained: usize,
    pub skipped: Vec<SkippedArtifact>,
}

/// In-memory golden records keyed by source locator
pub struct GoldenCache {
    source: Box<dyn ArtifactSource>,
    workspace: PathBuf,
    repo_root: PathBuf,
    records: BTreeMap<SourceLocator, GoldenRecord>,
}

impl GoldenCache {
    /// Empty cache; call [`refresh`](Self::refresh) to populate it
    pub fn new(
        source: Box<dyn ArtifactSource>,
        workspace: impl Into<PathBuf>,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            workspace: workspace.into(),
            repo_root: repo_root.into(),
            records: BTreeMap::new(),
        }
    }

    /// Per-run directory holding materialized artifacts
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Root of the source tree goldens are promoted into
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Re-read all pending artifacts and replace the record set
    ///
    /// Fails only when the source cannot be enumerated; the previous
    /// snapshot is kept in that case.
    pub fn refresh(&mut self) -> Result<RefreshSummary, CacheError> {
        self.rebuild(false)
    }

    /// Drop every record, then re-read the source
    ///
    /// The source is enumerated before anything is dropped, so a failed
    /// listing leaves the cache as it was.
    pub fn clear_and_refresh(&mut self) -> Result<RefreshSummary, CacheError> {
        self.rebuild(true)
    }

    fn rebuild(&mut self, clear: bool) -> Result<RefreshSummary, CacheError> {
        let pending = self
            .source
            .list_pending()
            .map_err(|source| CacheError::Enumerate {
                source_name: self.source.name(),
                source,
            })?;
        info!("Updating goldens - found {} files", pending.len());

        // Removed with whatever failed to normalize when dropped
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.workspace)
            .map_err(CacheError::Staging)?;

        let mut summary = RefreshSummary::default();
        let mut snapshot = BTreeMap::new();

        for locator in pending {
            match self.load(&locator, &staging) {
                Ok(record) => {
                    debug!(id = %record.id, locator = %locator, "Loaded golden");
                    snapshot.insert(locator, record);
                }
                Err(reason) => {
                    warn!(locator = %locator, "Skipping artifact: {}", reason);
                    summary.skipped.push(SkippedArtifact { locator, reason });
                }
            }
        }
        summary.loaded = snapshot.len();

        let retain = self.source.consumes_artifacts() && !clear;
        let mut dropped = Vec::new();
        for (locator, record) in std::mem::take(&mut self.records) {
            if retain && !snapshot.contains_key(&locator) {
                snapshot.insert(locator, record);
                summary.retained += 1;
            } else {
                dropped.push(record);
            }
        }
        remove_local_files(&dropped, &snapshot);

        self.records = snapshot;
        info!(
            loaded = summary.loaded,
            retained = summary.retained,
            skipped = summary.skipped.len(),
            "Golden refresh complete"
        );
        Ok(summary)
    }

    fn load(&self, locator: &SourceLocator, staging: &TempDir) -> Result<GoldenRecord, String> {
        let staged = self
            .source
            .materialize(locator, staging.path())
            .map_err(|e| format!("fetch failed: {}", e))?;

        if self.source.consumes_artifacts() {
            if let Err(e) = self.source.consume(locator) {
                warn!(locator = %locator, "Failed to remove pulled artifact: {}", e);
            }
        }

        let metadata = normalize_file(&staged).map_err(|e| e.to_string())?;

        let file_name = staged
            .file_name()
            .ok_or_else(|| format!("fetched artifact {} has no file name", staged.display()))?;
        let local = self.workspace.join(file_name);
        fs::rename(&staged, &local)
            .map_err(|e| format!("cannot move {} into workspace: {}", staged.display(), e))?;

        let media = match metadata.video_location.as_deref() {
            Some(media_location) => {
                let request = MediaRequest {
                    device_local_path: &metadata.device_local_path,
                    media_location,
                };
                match self.source.materialize_media(locator, request, &self.workspace) {
                    Ok(media) => media,
                    Err(e) => {
                        warn!(locator = %locator, "Recording unavailable: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(GoldenRecord::new(locator.clone(), local, media, metadata))
    }

    /// Drop every record and delete its workspace files
    pub fn clear(&mut self) {
        let dropped: Vec<GoldenRecord> = std::mem::take(&mut self.records).into_values().collect();
        remove_local_files(&dropped, &self.records);
    }

    /// Record with the given id
    pub fn get(&self, id: &str) -> Option<&GoldenRecord> {
        self.records.values().find(|record| record.id == id)
    }

    /// All records, ordered by source locator
    pub fn all(&self) -> Vec<&GoldenRecord> {
        self.records.values().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Location of a record's golden in the source tree
    pub fn expected_path(&self, record: &GoldenRecord) -> Option<PathBuf> {
        contained_destination(&self.repo_root, &record.golden_repo_path)
    }

    /// Copy a record's payload over its golden in the source tree
    ///
    /// The golden is replaced in one rename; on failure the source tree is
    /// unchanged and the record stays unpromoted.
    pub fn promote(&mut self, id: &str) -> Result<&GoldenRecord, CacheError> {
        let record = self
            .records
            .values_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| CacheError::UnknownGolden(id.to_string()))?;

        let destination = contained_destination(&self.repo_root, &record.golden_repo_path)
            .ok_or_else(|| CacheError::OutsideRepo(record.golden_repo_path.clone()))?;

        replace_file(&record.local_raw_path, &destination).map_err(|source| {
            CacheError::Promotion {
                id: id.to_string(),
                source,
            }
        })?;

        record.promoted = true;
        info!(id = %id, destination = %destination.display(), "Golden updated");
        Ok(record)
    }
}

/// Delete the workspace files of `dropped` records that no `live` record uses
fn remove_local_files(dropped: &[GoldenRecord], live: &BTreeMap<SourceLocator, GoldenRecord>) {
    let in_use: HashSet<&Path> = live
        .values()
        .flat_map(|record| record.local_files())
        .collect();

    for path in dropped.iter().flat_map(|record| record.local_files()) {
        if in_use.contains(path) {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale workspace file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

/// Write `source`'s bytes to `destination` via a sibling temp file and rename
fn replace_file(source: &Path, destination: &Path) -> io::Result<()> {
    let parent = destination
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut staged = NamedTempFile::new_in(parent)?;
    io::copy(&mut File::open(source)?, &mut staged)?;
    staged.as_file().sync_all()?;
    if let Some(permissions) = target_permissions(destination)? {
        staged.as_file().set_permissions(permissions)?;
    }
    staged.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

/// Permissions for a replaced golden: the old file's, or 0644 for new files
fn target_permissions(destination: &Path) -> io::Result<Option<fs::Permissions>> {
    match fs::metadata(destination) {
        Ok(metadata) => Ok(Some(metadata.permissions())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(new_file_permissions()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn new_file_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<fs::Permissions> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Source serving JSON documents from memory
    ///
    /// Clones share state, so a test can keep a handle after handing the
    /// source to the cache.
    #[derive(Clone, Default)]
    struct MemorySource {
        documents: Arc<Mutex<Map<String, String>>>,
        consumes: bool,
        /// Fetch every locator to the same local name each time
        fixed_names: bool,
        unlistable: Arc<AtomicBool>,
        fetch_dirs: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl MemorySource {
        fn new(consumes: bool) -> Self {
            Self {
                consumes,
                ..Self::default()
            }
        }

        fn with_fixed_names(mut self) -> Self {
            self.fixed_names = true;
            self
        }

        fn fail_listing(&self) {
            self.unlistable.store(true, Ordering::SeqCst);
        }

        fn fetch_dirs(&self) -> Vec<PathBuf> {
            self.fetch_dirs.lock().unwrap().clone()
        }

        fn put(&self, locator: &str, document: serde_json::Value) {
            self.documents
                .lock()
                .unwrap()
                .insert(locator.to_string(), document.to_string());
        }
    }

    impl ArtifactSource for MemorySource {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn list_pending(&self) -> Result<Vec<SourceLocator>, SourceError> {
            if self.unlistable.load(Ordering::SeqCst) {
                return Err(SourceError::RootMissing(PathBuf::from("/memory")));
            }
            Ok(self.documents.lock().unwrap().keys().map(SourceLocator::new).collect())
        }

        fn materialize(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, SourceError> {
            self.fetch_dirs.lock().unwrap().push(dir.to_path_buf());
            let documents = self.documents.lock().unwrap();
            let content = documents
                .get(locator.as_str())
                .ok_or_else(|| SourceError::Unrecognised(locator.to_string()))?;
            let local = if self.fixed_names {
                dir.join(format!("{}.json", locator.id()))
            } else {
                dir.join(format!("{}_{}.json", locator.id(), freshness_token()))
            };
            fs::write(&local, content)?;
            Ok(local)
        }

        fn consume(&self, locator: &SourceLocator) -> Result<(), SourceError> {
            self.documents.lock().unwrap().remove(locator.as_str());
            Ok(())
        }

        fn consumes_artifacts(&self) -> bool {
            self.consumes
        }
    }

    fn golden(result: &str, repo_path: &str) -> serde_json::Value {
        json!({
            "frame_ids": [0, 16],
            "//metadata": {
                "result": result,
                "goldenRepoPath": repo_path,
                "goldenIdentifier": "scroll",
                "testClassName": "ScrollTest",
                "testMethodName": "scrollDown",
                "deviceLocalPath": "/data/user/0/com.example/files"
            }
        })
    }

    struct Fixture {
        workspace: TempDir,
        repo: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                workspace: TempDir::new().unwrap(),
                repo: TempDir::new().unwrap(),
            }
        }

        fn cache(&self, source: MemorySource) -> GoldenCache {
            GoldenCache::new(Box::new(source), self.workspace.path(), self.repo.path())
        }
    }

    #[test]
    fn refresh_skips_malformed_and_keeps_valid() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut broken = golden("FAILED", "goldens/b.json");
        broken["//metadata"].as_object_mut().unwrap().remove("goldenIdentifier");
        source.put("/b.actual.json", broken);

        let mut cache = fixture.cache(source);
        let summary = cache.refresh().unwrap();

        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].locator.as_str(), "/b.actual.json");
        let all = cache.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].result, "PASSED");
        assert!(!fs::read_to_string(&all[0].local_raw_path).unwrap().contains("//metadata"));
    }

    #[test]
    fn id_is_stable_and_checksum_changes_across_refreshes() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);

        cache.refresh().unwrap();
        let first = cache.all()[0].clone();
        cache.refresh().unwrap();
        let second = cache.all()[0].clone();

        assert_eq!(first.id, second.id);
        assert_ne!(first.checksum, second.checksum);
        assert_eq!(cache.get(&first.id).unwrap().source_locator.as_str(), "/a.actual.json");
    }

    #[test]
    fn consumed_artifacts_survive_refresh_until_cleared() {
        let fixture = Fixture::new();
        let source = MemorySource::new(true);
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);

        cache.refresh().unwrap();
        assert_eq!(cache.len(), 1);

        let summary = cache.refresh().unwrap();
        assert_eq!(summary.loaded, 0);
        assert_eq!(summary.retained, 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        cache.refresh().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn promote_copies_payload_and_marks_record() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("FAILED", "frameworks/goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let id = cache.all()[0].id.clone();

        let promoted = cache.promote(&id).unwrap();
        assert!(promoted.promoted);

        let destination = fixture.repo.path().join("frameworks/goldens/a.json");
        assert_eq!(
            fs::read(&destination).unwrap(),
            fs::read(&cache.get(&id).unwrap().local_raw_path).unwrap()
        );
    }

    #[test]
    fn promote_unknown_id_changes_nothing() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("FAILED", "goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let before = cache.all()[0].clone();

        let err = cache.promote("0000").unwrap_err();

        assert!(matches!(err, CacheError::UnknownGolden(_)));
        assert_eq!(cache.all()[0], &before);
        assert!(!fixture.repo.path().join("goldens/a.json").exists());
    }

    #[test]
    fn promote_refuses_paths_outside_repo() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("FAILED", "../escape.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let id = cache.all()[0].id.clone();

        assert!(matches!(cache.promote(&id), Err(CacheError::OutsideRepo(_))));
        assert!(!cache.get(&id).unwrap().promoted);
    }

    #[test]
    fn failed_write_leaves_record_unpromoted() {
        let fixture = Fixture::new();
        // A file where the golden's directory should be
        fs::write(fixture.repo.path().join("goldens"), "not a dir").unwrap();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("FAILED", "goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let id = cache.all()[0].id.clone();

        assert!(matches!(cache.promote(&id), Err(CacheError::Promotion { .. })));
        assert!(!cache.get(&id).unwrap().promoted);
    }

    fn workspace_entries(fixture: &Fixture) -> Vec<PathBuf> {
        fs::read_dir(fixture.workspace.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[test]
    fn superseded_fetches_are_removed_from_workspace() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);

        let first = {
            cache.refresh().unwrap();
            cache.all()[0].local_raw_path.clone()
        };
        for _ in 0..4 {
            cache.refresh().unwrap();
        }

        assert!(!first.exists());
        assert_eq!(workspace_entries(&fixture), vec![cache.all()[0].local_raw_path.clone()]);
    }

    #[test]
    fn clear_removes_workspace_files() {
        let fixture = Fixture::new();
        let source = MemorySource::new(true);
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let local = cache.all()[0].local_raw_path.clone();

        cache.clear();

        assert!(cache.is_empty());
        assert!(!local.exists());
        assert!(workspace_entries(&fixture).is_empty());
    }

    #[test]
    fn failed_refetch_keeps_previous_file_intact() {
        let fixture = Fixture::new();
        let source = MemorySource::new(true).with_fixed_names();
        let handle = source.clone();
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let local = cache.all()[0].local_raw_path.clone();
        let served = fs::read(&local).unwrap();

        // Same locator comes back, this time without usable metadata
        handle.put("/a.actual.json", json!({"frame_ids": [0]}));
        let summary = cache.refresh().unwrap();

        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.retained, 1);
        assert_eq!(cache.all()[0].local_raw_path, local);
        assert_eq!(fs::read(&local).unwrap(), served);

        let dirs = handle.fetch_dirs();
        assert_eq!(dirs.len(), 2);
        for dir in dirs {
            assert_ne!(dir, fixture.workspace.path());
            assert!(!dir.exists());
        }
    }

    #[test]
    fn failed_listing_on_clear_keeps_records() {
        let fixture = Fixture::new();
        let source = MemorySource::new(false);
        let handle = source.clone();
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();
        let local = cache.all()[0].local_raw_path.clone();

        handle.fail_listing();
        let err = cache.clear_and_refresh().unwrap_err();

        assert!(matches!(err, CacheError::Enumerate { .. }));
        assert_eq!(cache.len(), 1);
        assert!(local.exists());
    }

    #[test]
    fn clear_and_refresh_drops_consumed_records() {
        let fixture = Fixture::new();
        let source = MemorySource::new(true);
        let handle = source.clone();
        source.put("/a.actual.json", golden("PASSED", "goldens/a.json"));
        let mut cache = fixture.cache(source);
        cache.refresh().unwrap();

        handle.put("/b.actual.json", golden("FAILED", "goldens/b.json"));
        let summary = cache.clear_and_refresh().unwrap();

        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.retained, 0);
        assert_eq!(cache.all()[0].source_locator.as_str(), "/b.actual.json");
    }
}
