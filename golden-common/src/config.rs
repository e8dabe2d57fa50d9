//! Configuration loading and repo root resolution
//!
//! Every setting follows the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file (`<user config dir>/motion-golden/config.toml`)
//! 4. Compiled default (fallback)
//!
//! A missing or unreadable TOML file never stops startup; it is logged and
//! the remaining tiers apply.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory name under the user config dir holding token and config file
pub const CONFIG_DIR_NAME: &str = "motion-golden";

/// Config file name inside [`CONFIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable naming the root of the source checkout
pub const BUILD_TOP_ENV: &str = "ANDROID_BUILD_TOP";

/// Environment variable overriding the listen port
pub const PORT_ENV: &str = "GOLDEN_WATCHER_PORT";

/// Where the review UI is deployed when nothing else is configured
pub const DEFAULT_CLIENT_URL: &str = "http://motion.teams.x20web.corp.google.com/";

/// Optional on-disk configuration
///
/// All keys are optional; absent keys fall through to the compiled defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TomlConfig {
    /// Root of the source checkout that goldens are promoted into
    #[serde(default)]
    pub android_build_top: Option<PathBuf>,

    /// Port for the review API (0 = pick any free port)
    #[serde(default)]
    pub port: Option<u16>,

    /// URL of the review UI
    #[serde(default)]
    pub client_url: Option<String>,
}

impl TomlConfig {
    /// Load the TOML config from the default location
    ///
    /// Never fails: a missing config dir or file yields the defaults.
    pub fn load_default() -> Self {
        match default_config_file() {
            Some(path) => Self::load_or_default(&path),
            None => {
                debug!("No user config directory available, using defaults");
                Self::default()
            }
        }
    }

    /// Load the TOML config from `path`, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    warn!("Ignoring config file {}: {}", path.display(), e);
                } else {
                    debug!("No config file at {}, using defaults", path.display());
                }
                Self::default()
            }
        }
    }

    /// Strictly load and parse the TOML config at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))
    }
}

/// Per-user configuration directory (`~/.config/motion-golden` on Linux)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME))
}

fn default_config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

/// Resolve the source checkout root
///
/// The resolved directory must exist; a missing checkout is a startup error.
pub fn resolve_build_top(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml: &TomlConfig,
) -> Result<PathBuf> {
    let candidate = cli_arg
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(env_var_name).map(PathBuf::from))
        .or_else(|| toml.android_build_top.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "{} not set. Have you sourced envsetup.sh?",
                env_var_name
            ))
        })?;

    if !candidate.is_dir() {
        return Err(Error::NotFound(format!(
            "source checkout root {} does not exist",
            candidate.display()
        )));
    }

    Ok(candidate)
}

/// Resolve the listen port; 0 asks the OS for any free port
pub fn resolve_port(cli_arg: Option<u16>, env_var_name: &str, toml: &TomlConfig) -> Result<u16> {
    if let Some(port) = cli_arg {
        return Ok(port);
    }

    if let Ok(value) = std::env::var(env_var_name) {
        return value
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("{}={:?} is not a port: {}", env_var_name, value, e)));
    }

    Ok(toml.port.unwrap_or(0))
}

/// Resolve the review UI URL
pub fn resolve_client_url(cli_arg: Option<&str>, toml: &TomlConfig) -> String {
    cli_arg
        .map(str::to_string)
        .or_else(|| toml.client_url.clone())
        .unwrap_or_else(|| DEFAULT_CLIENT_URL.to_string())
}
