//! Persistent access token for the review API
//!
//! The token is a shared secret between the local service and the review UI.
//! It is generated once, stored at `<user config dir>/motion-golden/.token`
//! with owner-only permissions, and reused on every later run.
//!
//! Persistence is best effort: when the file cannot be written the freshly
//! generated token is still used for the current process.

use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::config_dir;

/// HTTP header carrying the token on every authenticated request
pub const ACCESS_TOKEN_HEADER: &str = "Golden-Access-Token";

/// Token file name inside the config directory
pub const TOKEN_FILE_NAME: &str = ".token";

/// Number of random bytes in a generated token (64 hex chars)
const TOKEN_BYTES: usize = 32;

/// Access token store bound to one file path
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Store at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default per-user location
    ///
    /// Falls back to the current directory when no config dir is known.
    pub fn at_default_location() -> Self {
        let dir = config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir.join(TOKEN_FILE_NAME))
    }

    /// Token file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted token, or create and persist a new one
    pub fn get_or_create(&self) -> String {
        if let Some(token) = self.read_existing() {
            return token;
        }

        let token = generate_token();
        match self.persist(&token) {
            Ok(()) => info!("Created access token at {}", self.path.display()),
            Err(e) => warn!(
                "Unable to save persistent token to {}: {} (token valid for this run only)",
                self.path.display(),
                e
            ),
        }
        token
    }

    fn read_existing(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        let token = content.lines().next().unwrap_or("").trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }

    fn persist(&self, token: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = owner_only_options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        // The creation mode does not apply to a file that already existed
        restrict_permissions(&file)?;
        file.write_all(token.as_bytes())
    }
}

/// Generate a new random token
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Byte-for-byte comparison of a presented token against the expected one
pub fn token_matches(expected: &str, presented: Option<&str>) -> bool {
    matches!(presented, Some(p) if !p.is_empty() && p.as_bytes() == expected.as_bytes())
}

#[cfg(unix)]
fn owner_only_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only_options() -> OpenOptions {
    OpenOptions::new()
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> io::Result<()> {
    Ok(())
}
