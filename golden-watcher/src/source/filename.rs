//! File name grammar for test-runner artifacts
//!
//! The test runner has written actual-result files under several naming
//! conventions over time, for example:
//!
//! ```text
//! light_portrait_pagingRight.actual.json_4383267726505225616.txt.gz
//! recordMotion_captureCrossfade.actual_10536896158799342698.json
//! light_portrait_noOverscrollRight.actual_118505410949600545.json.gz
//! light_portrait_noOverscrollRight.actual_12613191689435798576.mp4
//! light_portrait_pagingRight.actual.mp4_1617964025478041468.txt.gz
//! ```
//!
//! Parsing is a pure function over the file name so it can be tested
//! without touching the filesystem.

use once_cell::sync::Lazy;
use regex::Regex;

static ARTIFACT_FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>.+)\.actual(?:\.(?P<ext1>[a-zA-Z0-9]+)_(?P<hash1>\d+)\.txt|_(?P<hash2>\d+)\.(?P<ext2>[a-zA-Z0-9]+))(?P<compressed>\.gz)?$",
    )
    .expect("artifact file name pattern is valid")
});

/// Structured view of a recognised artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFileName {
    /// Logical golden name (shared by the JSON body and its recording)
    pub name: String,
    /// Payload extension (`json`, `mp4`, ...)
    pub extension: String,
    /// De-duplication suffix the runner appended
    pub dedup_hash: String,
    /// Whether the file is gzip-compressed
    pub compressed: bool,
}

impl ArtifactFileName {
    /// Local file name used in the workspace for a JSON body
    pub fn local_json_name(&self) -> String {
        format!("{}_{}.actual.json", self.name, self.dedup_hash)
    }
}

/// Parse a runner artifact file name (no directory part)
///
/// Returns `None` for names that follow none of the known conventions.
pub fn parse_artifact_file_name(file_name: &str) -> Option<ArtifactFileName> {
    let caps = ARTIFACT_FILE_NAME.captures(file_name)?;

    let extension = caps.name("ext1").or_else(|| caps.name("ext2"))?;
    let dedup_hash = caps.name("hash1").or_else(|| caps.name("hash2"))?;

    Some(ArtifactFileName {
        name: caps["name"].to_string(),
        extension: extension.as_str().to_string(),
        dedup_hash: dedup_hash.as_str().to_string(),
        compressed: caps.name("compressed").is_some(),
    })
}

/// Cheap pre-filter matching the runner's `*.actual*json*` discovery glob
pub fn looks_like_json_artifact(file_name: &str) -> bool {
    match file_name.find(".actual") {
        Some(idx) => file_name[idx..].contains("json"),
        None => false,
    }
}
