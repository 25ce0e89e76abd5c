//! Platform trait: free space, removable volumes, in-use detection.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::errors::{FusError, Result};

/// Filesystem statistics for the volume holding a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub is_readonly: bool,
}

/// A mounted volume that can receive backups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub path: PathBuf,
    /// `None` when the volume's stats could not be read.
    pub available_bytes: Option<u64>,
}

/// OS abstraction used by the relocation and restore flows.
pub trait Platform {
    fn fs_stats(&self, path: &Path) -> Result<FsStats>;

    /// Mounted volumes under `volumes_dir`, minus `excluded` names, by name.
    fn removable_volumes(&self, volumes_dir: &Path, excluded: &[String]) -> Result<Vec<Volume>>;

    /// Whether any process holds a file inside `bundle` open.
    fn is_in_use(&self, bundle: &Path) -> bool;
}

/// Real implementation for macOS and Linux.
#[derive(Debug, Default)]
pub struct UnixPlatform;

impl Platform for UnixPlatform {
    #[cfg(unix)]
    #[allow(clippy::useless_conversion)]
    fn fs_stats(&self, path: &Path) -> Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|error| FusError::FsStats {
            path: path.to_path_buf(),
            details: error.to_string(),
        })?;
        let fragment = u64::from(stat.fragment_size());
        Ok(FsStats {
            total_bytes: u64::from(stat.blocks()).saturating_mul(fragment),
            free_bytes: u64::from(stat.blocks_free()).saturating_mul(fragment),
            available_bytes: u64::from(stat.blocks_available()).saturating_mul(fragment),
            is_readonly: stat.flags().contains(nix::sys::statvfs::FsFlags::ST_RDONLY),
        })
    }

    #[cfg(not(unix))]
    fn fs_stats(&self, path: &Path) -> Result<FsStats> {
        Err(FusError::FsStats {
            path: path.to_path_buf(),
            details: "statvfs is not available on this platform".to_string(),
        })
    }

    fn removable_volumes(&self, volumes_dir: &Path, excluded: &[String]) -> Result<Vec<Volume>> {
        let names = list_volume_dirs(volumes_dir, excluded)?;
        Ok(names
            .into_iter()
            .map(|(name, path)| {
                let available_bytes = self.fs_stats(&path).ok().map(|s| s.available_bytes);
                Volume {
                    name,
                    path,
                    available_bytes,
                }
            })
            .collect())
    }

    fn is_in_use(&self, bundle: &Path) -> bool {
        #[cfg(target_os = "linux")]
        {
            proc_holds_open(bundle)
        }
        #[cfg(not(target_os = "linux"))]
        {
            lsof_reports_open(bundle)
        }
    }
}

/// Directories under `volumes_dir` that are not excluded, hidden or symlinks.
fn list_volume_dirs(volumes_dir: &Path, excluded: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(volumes_dir).map_err(|err| FusError::io(volumes_dir, err))?;
    let mut volumes: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || excluded.iter().any(|ex| ex == &name) {
                return None;
            }
            let file_type = entry.file_type().ok()?;
            (file_type.is_dir() && !file_type.is_symlink()).then(|| (name, entry.path()))
        })
        .collect();
    volumes.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(volumes)
}

#[cfg(target_os = "linux")]
fn proc_holds_open(bundle: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(proc_dir) = fs::read_dir("/proc") else {
        return false;
    };
    for proc_entry in proc_dir.flatten() {
        let pid_name = proc_entry.file_name();
        let pid_bytes = pid_name.as_bytes();
        if pid_bytes.is_empty() || !pid_bytes.iter().all(u8::is_ascii_digit) {
            continue;
        }
        if fs::read_link(proc_entry.path().join("exe")).is_ok_and(|exe| exe.starts_with(bundle)) {
            return true;
        }
        let Ok(fds) = fs::read_dir(proc_entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if fs::read_link(fd.path()).is_ok_and(|target| target.starts_with(bundle)) {
                return true;
            }
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
fn lsof_reports_open(bundle: &Path) -> bool {
    // lsof exits 1 when nothing matches; any failure to run counts as not in use.
    Command::new("lsof")
        .arg("-t")
        .arg("+D")
        .arg(bundle)
        .output()
        .is_ok_and(|out| out.status.success() && !out.stdout.trim_ascii().is_empty())
}

/// Run an external tool and return trimmed stdout, or an `ExternalTool` error.
pub fn run_tool(tool: &'static str, program: &Path, args: &[&std::ffi::OsStr]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| FusError::Io {
            path: program.to_path_buf(),
            source,
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(FusError::ExternalTool {
            tool,
            details: format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// In-memory platform for deterministic tests.
#[derive(Debug, Default)]
pub struct MockPlatform {
    stats_by_mount: HashMap<PathBuf, FsStats>,
    in_use: HashSet<PathBuf>,
    /// Bundles that report busy for a number of polls, then free up.
    busy_polls: Mutex<HashMap<PathBuf, u32>>,
}

impl MockPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register stats for every path under `mount`.
    #[must_use]
    pub fn with_stats(mut self, mount: impl Into<PathBuf>, stats: FsStats) -> Self {
        self.stats_by_mount.insert(mount.into(), stats);
        self
    }

    /// Convenience: a volume with `total` bytes of which `available` are free.
    #[must_use]
    pub fn with_free_space(self, mount: impl Into<PathBuf>, total: u64, available: u64) -> Self {
        self.with_stats(
            mount,
            FsStats {
                total_bytes: total,
                free_bytes: available,
                available_bytes: available,
                is_readonly: false,
            },
        )
    }

    #[must_use]
    pub fn with_in_use(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.in_use.insert(bundle.into());
        self
    }

    #[must_use]
    pub fn with_busy_polls(self, bundle: impl Into<PathBuf>, polls: u32) -> Self {
        if let Ok(mut busy) = self.busy_polls.lock() {
            busy.insert(bundle.into(), polls);
        }
        self
    }
}

impl Platform for MockPlatform {
    fn fs_stats(&self, path: &Path) -> Result<FsStats> {
        self.stats_by_mount
            .iter()
            .filter(|(mount, _)| path.starts_with(mount))
            .max_by_key(|(mount, _)| mount.as_os_str().len())
            .map(|(_, stats)| stats.clone())
            .ok_or_else(|| FusError::FsStats {
                path: path.to_path_buf(),
                details: "mock stats not found".to_string(),
            })
    }

    fn removable_volumes(&self, volumes_dir: &Path, excluded: &[String]) -> Result<Vec<Volume>> {
        Ok(list_volume_dirs(volumes_dir, excluded)?
            .into_iter()
            .map(|(name, path)| {
                let available_bytes = self.fs_stats(&path).ok().map(|s| s.available_bytes);
                Volume {
                    name,
                    path,
                    available_bytes,
                }
            })
            .collect())
    }

    fn is_in_use(&self, bundle: &Path) -> bool {
        if self.in_use.contains(bundle) {
            return true;
        }
        let Ok(mut busy) = self.busy_polls.lock() else {
            return false;
        };
        match busy.get_mut(bundle) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Result of the privilege preflight before moving bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeCheck {
    Sufficient,
    /// Not root and a directory involved is not writable: moves may fail.
    Limited,
    /// Root is required by configuration and missing.
    Refused,
}

impl PrivilegeCheck {
    pub const fn evaluate(is_root: bool, require_root: bool, writable: bool) -> Self {
        if is_root {
            Self::Sufficient
        } else if require_root {
            Self::Refused
        } else if writable {
            Self::Sufficient
        } else {
            Self::Limited
        }
    }
}

/// Whether the effective user is root.
pub fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Whether entries can be created and removed in `dir`.
pub fn can_modify(dir: &Path) -> bool {
    #[cfg(unix)]
    {
        nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
    }
    #[cfg(not(unix))]
    {
        dir.is_dir()
    }
}

/// Detect the active platform implementation.
pub fn detect_platform() -> Result<Box<dyn Platform>> {
    #[cfg(unix)]
    {
        Ok(Box::new(UnixPlatform))
    }
    #[cfg(not(unix))]
    {
        Err(FusError::UnsupportedPlatform {
            details: "only macOS and Linux are supported".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn privilege_check_matrix() {
        use PrivilegeCheck::{Limited, Refused, Sufficient};
        assert_eq!(PrivilegeCheck::evaluate(true, true, false), Sufficient);
        assert_eq!(PrivilegeCheck::evaluate(false, true, true), Refused);
        assert_eq!(PrivilegeCheck::evaluate(false, false, true), Sufficient);
        assert_eq!(PrivilegeCheck::evaluate(false, false, false), Limited);
    }

    #[cfg(unix)]
    #[test]
    fn can_modify_follows_write_permission() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        assert!(can_modify(tmp.path()));
        assert!(!can_modify(&tmp.path().join("missing")));
        if running_as_root() {
            return;
        }
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        assert!(!can_modify(&locked));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn mock_stats_prefer_longest_mount() {
        let platform = MockPlatform::new()
            .with_free_space("/", 1_000, 100)
            .with_free_space("/Volumes/Backup", 5_000, 4_000);
        assert_eq!(
            platform
                .fs_stats(Path::new("/Volumes/Backup/AppBackup_1"))
                .unwrap()
                .available_bytes,
            4_000
        );
        assert_eq!(
            platform
                .fs_stats(Path::new("/Applications"))
                .unwrap()
                .available_bytes,
            100
        );
    }

    #[test]
    fn mock_stats_missing_mount_is_error() {
        let platform = MockPlatform::new().with_free_space("/Volumes/A", 1, 1);
        let err = platform.fs_stats(Path::new("/elsewhere")).unwrap_err();
        assert_eq!(err.code(), "FUS-2001");
    }

    #[test]
    fn volumes_skip_excluded_hidden_and_files() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("Backup Drive")).unwrap();
        fs::create_dir_all(tmp.path().join("Macintosh HD")).unwrap();
        fs::create_dir_all(tmp.path().join(".timemachine")).unwrap();
        fs::create_dir_all(tmp.path().join("Archive")).unwrap();
        fs::write(tmp.path().join("README"), "x").unwrap();

        let platform = MockPlatform::new().with_free_space(tmp.path(), 10, 5);
        let volumes = platform
            .removable_volumes(tmp.path(), &["Macintosh HD".to_string()])
            .unwrap();
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["Archive", "Backup Drive"]);
        assert_eq!(volumes[0].available_bytes, Some(5));
    }

    #[test]
    fn missing_volumes_dir_is_error() {
        let tmp = TempDir::new().unwrap();
        let platform = MockPlatform::new();
        assert!(
            platform
                .removable_volumes(&tmp.path().join("nope"), &[])
                .is_err()
        );
    }

    #[test]
    fn mock_busy_polls_count_down() {
        let bundle = PathBuf::from("/Applications/Busy.app");
        let platform = MockPlatform::new().with_busy_polls(&bundle, 2);
        assert!(platform.is_in_use(&bundle));
        assert!(platform.is_in_use(&bundle));
        assert!(!platform.is_in_use(&bundle));
    }

    #[cfg(unix)]
    #[test]
    fn unix_platform_reads_real_stats() {
        let tmp = TempDir::new().unwrap();
        let stats = UnixPlatform.fs_stats(tmp.path()).unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.available_bytes <= stats.total_bytes);
    }

    #[cfg(unix)]
    #[test]
    fn run_tool_reports_failure() {
        let err = run_tool("false", Path::new("false"), &[]).unwrap_err();
        assert_eq!(err.code(), "FUS-3003");
        let out = run_tool("echo", Path::new("echo"), &[std::ffi::OsStr::new("hi")]).unwrap();
        assert_eq!(out, "hi");
    }
}
