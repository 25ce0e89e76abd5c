//! Application bundle records and structural checks.

#![allow(missing_docs)]

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::errors::{FusError, Result};

/// Info.plist files smaller than this are treated as placeholders.
const MIN_INFO_PLIST_BYTES: u64 = 100;

/// Subdirectory holding a bundle's executables.
pub const EXECUTABLE_DIR: &str = "Contents/MacOS";

static BUNDLE_EXECUTABLE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"<key>\s*CFBundleExecutable\s*</key>\s*<string>\s*([^<]+?)\s*</string>").ok()
});

/// One installed application bundle, as found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationRecord {
    /// Bundle file name without the extension.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ApplicationRecord {
    /// Final path component, e.g. `Xcode.app`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

impl fmt::Display for ApplicationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Reason a nested entry was not counted toward a bundle's size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Sum of regular file sizes under `root`, never following symlinks.
///
/// Unreadable nested entries are skipped and reported; the readable part of
/// the tree is still counted. Fails only when `root` itself cannot be read.
pub fn bundle_size(root: &Path) -> Result<(u64, Vec<ScanWarning>)> {
    let meta = fs::symlink_metadata(root).map_err(|err| FusError::io(root, err))?;
    if meta.file_type().is_symlink() {
        return Ok((0, Vec::new()));
    }
    if meta.is_file() {
        return Ok((meta.len(), Vec::new()));
    }

    let mut total: u64 = 0;
    let mut warnings = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    let mut at_root = true;

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if at_root => return Err(FusError::io(&dir, err)),
            Err(err) => {
                warnings.push(ScanWarning {
                    path: dir,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        at_root = false;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warnings.push(ScanWarning {
                        path: dir.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            let path = entry.path();
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {}
                Ok(meta) if meta.is_dir() => stack.push(path),
                Ok(meta) if meta.is_file() => total = total.saturating_add(meta.len()),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warnings.push(ScanWarning {
                    path,
                    reason: err.to_string(),
                }),
            }
        }
    }

    Ok((total, warnings))
}

/// Outcome of a structural check on a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleIntegrity {
    Intact,
    MissingInfoPlist,
    MissingExecutable(String),
}

impl BundleIntegrity {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact)
    }
}

impl fmt::Display for BundleIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intact => write!(f, "intact"),
            Self::MissingInfoPlist => write!(f, "missing Contents/Info.plist"),
            Self::MissingExecutable(name) => write!(f, "missing executable {name}"),
        }
    }
}

/// Check that `bundle` has an Info.plist and, if the plist names an
/// executable, that the executable is present.
///
/// Binary plists are accepted without the executable check.
pub fn check_integrity(bundle: &Path) -> BundleIntegrity {
    let info_plist = bundle.join("Contents").join("Info.plist");
    let Ok(bytes) = fs::read(&info_plist) else {
        return BundleIntegrity::MissingInfoPlist;
    };

    let text = String::from_utf8_lossy(&bytes);
    if let Some(re) = BUNDLE_EXECUTABLE.as_ref()
        && let Some(caps) = re.captures(&text)
    {
        let executable = caps[1].to_string();
        if fs::symlink_metadata(bundle.join(EXECUTABLE_DIR).join(&executable)).is_err() {
            return BundleIntegrity::MissingExecutable(executable);
        }
    }
    BundleIntegrity::Intact
}

/// Whether `bundle` looks like a link or placeholder rather than a real
/// application: a symlink, no `Contents`, or a missing or tiny Info.plist.
pub fn looks_like_alias(bundle: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(bundle) else {
        return true;
    };
    if meta.file_type().is_symlink() || !meta.is_dir() {
        return true;
    }
    let contents = bundle.join("Contents");
    if !contents.is_dir() {
        return true;
    }
    fs::metadata(contents.join("Info.plist"))
        .map_or(true, |plist| plist.len() < MIN_INFO_PLIST_BYTES)
}

/// Hex SHA-256 over the bundle's Info.plist, file name and total size.
///
/// Cheap identity check; does not hash the executable payload.
pub fn fingerprint(bundle: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let info_plist = bundle.join("Contents").join("Info.plist");
    match fs::read(&info_plist) {
        Ok(bytes) => hasher.update(&bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(FusError::io(&info_plist, err)),
    }
    if let Some(name) = bundle.file_name() {
        hasher.update(name.to_string_lossy().as_bytes());
    }
    let (size, _) = bundle_size(bundle)?;
    hasher.update(size.to_le_bytes());

    let digest = hasher.finalize();
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Whether two bundles are the same application build.
///
/// Both must exist and carry an Info.plist; then their fingerprints are
/// compared. Any read failure counts as "not identical".
pub fn bundles_identical(a: &Path, b: &Path) -> bool {
    let has_plist = |p: &Path| p.join("Contents").join("Info.plist").is_file();
    if !has_plist(a) || !has_plist(b) {
        return false;
    }
    match (fingerprint(a), fingerprint(b)) {
        (Ok(fa), Ok(fb)) => fa == fb,
        _ => false,
    }
}
