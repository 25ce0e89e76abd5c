//! Trust reset: make a restored bundle launchable again.
//!
//! Applies a fixed permission template and clears quarantine-style extended
//! attributes. Works best-effort per file and reports what it could not fix.

#![allow(missing_docs)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::config::RestoreConfig;
use crate::platform::pal::run_tool;

/// Mode applied to every directory in a bundle.
pub const DIR_MODE: u32 = 0o755;
/// Bits added to every regular file.
pub const FILE_READ_BITS: u32 = 0o444;
/// Bits added to files under the executable subdirectory.
pub const EXEC_BITS: u32 = 0o555;

/// One file the reset could not fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionIssue {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for PermissionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Summary of one reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrustReport {
    pub entries_updated: usize,
    pub quarantine_cleared: bool,
    pub issues: Vec<PermissionIssue>,
}

impl TrustReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Reset permissions and trust attributes on a bundle.
pub trait TrustReset {
    fn reset(&self, bundle: &Path) -> TrustReport;
}

/// chmod template plus `xattr -cr` on macOS.
#[derive(Debug, Clone)]
pub struct UnixTrustReset {
    executable_subdir: PathBuf,
    clear_quarantine: bool,
    xattr_program: PathBuf,
}

impl UnixTrustReset {
    pub fn new(executable_subdir: impl Into<PathBuf>, clear_quarantine: bool) -> Self {
        Self {
            executable_subdir: executable_subdir.into(),
            clear_quarantine,
            xattr_program: PathBuf::from("/usr/bin/xattr"),
        }
    }

    pub fn from_config(config: &RestoreConfig) -> Self {
        Self::new(&config.executable_subdir, config.clear_quarantine)
    }

    #[must_use]
    pub fn with_xattr_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.xattr_program = program.into();
        self
    }

    #[cfg(unix)]
    fn apply_template(&self, bundle: &Path, report: &mut TrustReport) {
        use std::os::unix::fs::PermissionsExt;

        let exec_root = bundle.join(&self.executable_subdir);
        let mut stack = vec![bundle.to_path_buf()];

        while let Some(path) = stack.pop() {
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    report.issues.push(PermissionIssue {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if meta.file_type().is_symlink() {
                continue;
            }

            let current = meta.permissions().mode() & 0o7777;
            let wanted = if meta.is_dir() {
                DIR_MODE
            } else if path.starts_with(&exec_root) {
                current | EXEC_BITS
            } else {
                current | FILE_READ_BITS
            };

            if wanted != current {
                match fs::set_permissions(&path, fs::Permissions::from_mode(wanted)) {
                    Ok(()) => report.entries_updated += 1,
                    Err(err) => report.issues.push(PermissionIssue {
                        path: path.clone(),
                        reason: err.to_string(),
                    }),
                }
            }

            if meta.is_dir() {
                match fs::read_dir(&path) {
                    Ok(entries) => stack.extend(entries.flatten().map(|e| e.path())),
                    Err(err) => report.issues.push(PermissionIssue {
                        path,
                        reason: err.to_string(),
                    }),
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn apply_template(&self, bundle: &Path, report: &mut TrustReport) {
        report.issues.push(PermissionIssue {
            path: bundle.to_path_buf(),
            reason: "permission template is not supported on this platform".to_string(),
        });
    }

    fn clear_quarantine(&self, bundle: &Path, report: &mut TrustReport) {
        if !self.clear_quarantine || !cfg!(target_os = "macos") {
            return;
        }
        let args = [std::ffi::OsStr::new("-cr"), bundle.as_os_str()];
        match run_tool("xattr", &self.xattr_program, &args) {
            Ok(_) => report.quarantine_cleared = true,
            Err(err) => report.issues.push(PermissionIssue {
                path: bundle.to_path_buf(),
                reason: err.to_string(),
            }),
        }
    }
}

impl TrustReset for UnixTrustReset {
    fn reset(&self, bundle: &Path) -> TrustReport {
        let mut report = TrustReport::default();
        self.apply_template(bundle, &mut report);
        self.clear_quarantine(bundle, &mut report);
        report
    }
}
