//! Device-backed artifact source
//!
//! Goldens written by on-device tests live under the app data directories.
//! They are found with a remote `find`, pulled into the workspace and then
//! deleted on the device so the next refresh only sees new results.
//!
//! Pulling from app data requires adbd to run as root. That is established
//! once at startup; failing to do so is fatal.

use std::path::{Path, PathBuf};
use std::process::Command;

use golden_common::hashing::stable_id;
use tracing::{debug, info, warn};

use super::{contained_destination, ArtifactSource, MediaRequest, SourceError, SourceLocator};

/// Directory searched on the device
pub const DEVICE_ROOT: &str = "/data/user/0/";

/// File name pattern of actual results on the device
const DEVICE_PATTERN: &str = "*.actual.json";

/// Thin wrapper around the `adb` binary bound to one device serial
#[derive(Debug, Clone)]
pub struct AdbClient {
    binary: PathBuf,
    serial: String,
}

impl AdbClient {
    /// Client for the device with `serial`
    pub fn new(serial: impl Into<String>) -> Self {
        Self::with_binary("adb", serial)
    }

    /// Client invoking `binary` instead of the `adb` found on `PATH`
    pub fn with_binary(binary: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            serial: serial.into(),
        }
    }

    /// Client for the only connected device
    ///
    /// Fails when zero or several devices are attached.
    pub fn for_single_device() -> Result<Self, SourceError> {
        let output = run_command(Command::new("adb").arg("devices"))?;
        match parse_device_serials(&output).as_slice() {
            [] => Err(SourceError::NoDevice),
            [serial] => Ok(Self::new(serial.clone())),
            _ => Err(SourceError::MultipleDevices),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Run `adb -s <serial> <args>` and return its stdout
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String, SourceError> {
        let mut command = Command::new(&self.binary);
        command.arg("-s").arg(&self.serial);
        for arg in args {
            command.arg(arg.as_ref());
        }
        run_command(&mut command)
    }

    /// Restart adbd as root, waiting for the device to come back
    pub fn run_as_root(&self) -> Result<(), SourceError> {
        let output = self.run(&["root"])?;
        match classify_root_output(&output) {
            RootOutcome::Restarted => {
                info!("adbd restarting as root, waiting for device {}", self.serial);
                self.run(&["wait-for-device"])?;
                Ok(())
            }
            RootOutcome::AlreadyRoot => Ok(()),
            RootOutcome::Refused => Err(SourceError::RootUnavailable(output.trim().to_string())),
        }
    }
}

fn run_command(command: &mut Command) -> Result<String, SourceError> {
    let rendered = format!("{:?}", command);
    debug!(command = %rendered, "Running");

    let output = command.output()?;
    if !output.status.success() {
        return Err(SourceError::Command {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Serials listed by `adb devices`
pub fn parse_device_serials(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Result of `adb root`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOutcome {
    Restarted,
    AlreadyRoot,
    Refused,
}

pub fn classify_root_output(output: &str) -> RootOutcome {
    if output.contains("restarting adbd as root") {
        RootOutcome::Restarted
    } else if output.contains("adbd is already running as root") {
        RootOutcome::AlreadyRoot
    } else {
        RootOutcome::Refused
    }
}

/// Local workspace file name for a pulled device file
///
/// The remote path hash keeps same-named goldens from different apps apart.
pub fn local_file_name(remote_path: &str) -> String {
    let base = Path::new(remote_path);
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}_{}{}", stem, stable_id(remote_path), ext)
}

/// Artifact source backed by a connected device
#[derive(Debug)]
pub struct DeviceSource {
    adb: AdbClient,
    device_root: String,
}

impl DeviceSource {
    /// Source for the device behind `adb`; adbd must already run as root
    pub fn new(adb: AdbClient) -> Self {
        Self {
            adb,
            device_root: DEVICE_ROOT.to_string(),
        }
    }

    /// Obtain root on the device and build the source
    pub fn connect(adb: AdbClient) -> Result<Self, SourceError> {
        adb.run_as_root()?;
        Ok(Self::new(adb))
    }
}

impl ArtifactSource for DeviceSource {
    fn name(&self) -> &'static str {
        "device"
    }

    fn list_pending(&self) -> Result<Vec<SourceLocator>, SourceError> {
        let find = format!("find {} -type f -name '{}'", self.device_root, DEVICE_PATTERN);
        let output = self.adb.run(&["shell", find.as_str()])?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(SourceLocator::new)
            .collect())
    }

    fn materialize(&self, locator: &SourceLocator, dir: &Path) -> Result<PathBuf, SourceError> {
        let local = dir.join(local_file_name(locator.as_str()));
        let local_arg = local.to_string_lossy();
        self.adb.run(&["pull", locator.as_str(), &*local_arg])?;
        Ok(local)
    }

    fn materialize_media(
        &self,
        locator: &SourceLocator,
        media: MediaRequest<'_>,
        workspace: &Path,
    ) -> Result<Option<PathBuf>, SourceError> {
        let Some(local) = contained_destination(workspace, media.media_location) else {
            warn!(
                "Refusing recording {:?} of {}: escapes the workspace",
                media.media_location, locator
            );
            return Ok(None);
        };

        let remote = format!(
            "{}/{}",
            media.device_local_path.trim_end_matches('/'),
            media.media_location
        );
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let local_arg = local.to_string_lossy();
        self.adb.run(&["pull", remote.as_str(), &*local_arg])?;
        self.adb.run(&["shell", "rm", remote.as_str()])?;
        Ok(Some(local))
    }

    fn consume(&self, locator: &SourceLocator) -> Result<(), SourceError> {
        self.adb.run(&["shell", "rm", locator.as_str()])?;
        Ok(())
    }

    fn consumes_artifacts(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    const REMOTE: &str = "/data/user/0/com.a/files/x.actual.json";

    /// Stand-in adb that appends its arguments to `adb.log`
    #[cfg(unix)]
    struct FakeAdb {
        dir: TempDir,
    }

    #[cfg(unix)]
    impl FakeAdb {
        fn new() -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = TempDir::new().unwrap();
            let log = dir.path().join("adb.log");
            let script = format!(
                "#!/bin/sh\n\
                 echo \"$*\" >> '{log}'\n\
                 case \"$4\" in\n\
                 find*) echo '{remote}' ;;\n\
                 esac\n\
                 if [ \"$3\" = pull ]; then echo '{{}}' > \"$5\"; fi\n",
                log = log.display(),
                remote = REMOTE,
            );
            let binary = dir.path().join("adb");
            fs::write(&binary, script).unwrap();
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        fn source(&self) -> DeviceSource {
            DeviceSource::new(AdbClient::with_binary(self.dir.path().join("adb"), "SERIAL"))
        }

        fn calls(&self) -> Vec<String> {
            fs::read_to_string(self.dir.path().join("adb.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn single_device_listing() {
        let output = "List of devices attached\n0123456789ABCDEF\tdevice\n\n";
        assert_eq!(parse_device_serials(output), vec!["0123456789ABCDEF"]);
    }

    #[test]
    fn empty_and_multiple_device_listings() {
        assert!(parse_device_serials("List of devices attached\n\n").is_empty());

        let output = "* daemon started successfully\nList of devices attached\n\
                      emulator-5554\tdevice\nR58M123\tdevice\n";
        assert_eq!(parse_device_serials(output), vec!["emulator-5554", "R58M123"]);
    }

    #[test]
    fn root_output_classification() {
        assert_eq!(classify_root_output("restarting adbd as root\n"), RootOutcome::Restarted);
        assert_eq!(
            classify_root_output("adbd is already running as root\n"),
            RootOutcome::AlreadyRoot
        );
        assert_eq!(
            classify_root_output("adbd cannot run as root in production builds\n"),
            RootOutcome::Refused
        );
    }

    #[test]
    fn local_names_do_not_collide() {
        let a = local_file_name("/data/user/0/com.a/files/goldens/scroll.actual.json");
        let b = local_file_name("/data/user/0/com.b/files/goldens/scroll.actual.json");
        assert_ne!(a, b);
        assert!(a.starts_with("scroll.actual_"));
        assert!(a.ends_with(".json"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn pull_then_remove_on_device() {
        let adb = FakeAdb::new();
        let workspace = TempDir::new().unwrap();
        let source = adb.source();

        let pending = source.list_pending().unwrap();
        assert_eq!(pending, vec![SourceLocator::new(REMOTE)]);

        let local = source.materialize(&pending[0], workspace.path()).unwrap();
        assert_eq!(local, workspace.path().join(local_file_name(REMOTE)));
        assert!(local.is_file());
        source.consume(&pending[0]).unwrap();

        assert_eq!(
            adb.calls(),
            vec![
                "-s SERIAL shell find /data/user/0/ -type f -name '*.actual.json'".to_string(),
                format!("-s SERIAL pull {} {}", REMOTE, local.display()),
                format!("-s SERIAL shell rm {}", REMOTE),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn recording_pulled_from_device_local_path() {
        let adb = FakeAdb::new();
        let workspace = TempDir::new().unwrap();
        let request = MediaRequest {
            device_local_path: "/data/user/0/com.a/files/",
            media_location: "videos/x.mp4",
        };

        let local = adb
            .source()
            .materialize_media(&SourceLocator::new(REMOTE), request, workspace.path())
            .unwrap()
            .unwrap();

        assert_eq!(local, workspace.path().join("videos/x.mp4"));
        assert_eq!(
            adb.calls(),
            vec![
                format!(
                    "-s SERIAL pull /data/user/0/com.a/files/videos/x.mp4 {}",
                    local.display()
                ),
                "-s SERIAL shell rm /data/user/0/com.a/files/videos/x.mp4".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn escaping_recording_runs_no_adb_command() {
        let adb = FakeAdb::new();
        let workspace = TempDir::new().unwrap();
        let request = MediaRequest {
            device_local_path: "/data/user/0/com.a/files",
            media_location: "../x.mp4",
        };

        let media = adb
            .source()
            .materialize_media(&SourceLocator::new(REMOTE), request, workspace.path())
            .unwrap();

        assert_eq!(media, None);
        assert!(adb.calls().is_empty());
    }
}
