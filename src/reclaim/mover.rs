//! Moving bundles between directories and volumes.
//!
//! A rename is tried first. When source and destination are on different
//! filesystems the bundle is copied, the copy is verified, and only then is
//! the source removed.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;

use crate::core::config::BackupConfig;
use crate::core::errors::{FusError, Result};
use crate::inventory::bundle::bundle_size;

/// How a bundle reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMethod {
    Rename,
    CopyVerifyDelete,
    /// Moved by the user after the automatic move failed.
    Manual,
}

impl MoveMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rename => "rename",
            Self::CopyVerifyDelete => "copy",
            Self::Manual => "manual",
        }
    }
}

/// Move capability used by the ledger and the restore resolver.
pub trait BundleMover {
    /// Move `source` to `destination`. `destination` must not exist.
    fn move_bundle(&self, source: &Path, destination: &Path) -> Result<MoveMethod>;
}

/// Filesystem-backed mover.
#[derive(Debug, Clone)]
pub struct FsMover {
    verify_copies: bool,
    size_tolerance_pct: f64,
}

impl Default for FsMover {
    fn default() -> Self {
        Self {
            verify_copies: true,
            size_tolerance_pct: 1.0,
        }
    }
}

impl FsMover {
    pub fn new(verify_copies: bool, size_tolerance_pct: f64) -> Self {
        Self {
            verify_copies,
            size_tolerance_pct,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(config.verify_copies, config.size_tolerance_pct)
    }

    /// Cross-volume path: copy, verify, then delete the source.
    ///
    /// A failed copy or verification removes the partial copy and leaves the
    /// source untouched. If the source cannot be removed afterwards, the
    /// verified copy is kept and the error is returned.
    pub fn copy_verify_delete(&self, source: &Path, destination: &Path) -> Result<MoveMethod> {
        if fs::symlink_metadata(destination).is_ok() {
            return Err(FusError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        if let Err(err) = copy_tree(source, destination) {
            let _ = fs::remove_dir_all(destination);
            return Err(err);
        }

        if self.verify_copies
            && let Err(err) = self.verify_copy(source, destination)
        {
            let _ = fs::remove_dir_all(destination);
            return Err(err);
        }

        fs::remove_dir_all(source).map_err(|err| FusError::io(source, err))?;
        Ok(MoveMethod::CopyVerifyDelete)
    }

    /// Same Info.plist presence and total size within tolerance.
    #[allow(clippy::cast_precision_loss)]
    fn verify_copy(&self, source: &Path, destination: &Path) -> Result<()> {
        let plist = Path::new("Contents").join("Info.plist");
        if source.join(&plist).is_file() && !destination.join(&plist).is_file() {
            return Err(FusError::CopyVerification {
                path: destination.to_path_buf(),
                details: "Contents/Info.plist missing from copy".to_string(),
            });
        }

        let (source_size, _) = bundle_size(source)?;
        let (dest_size, _) = bundle_size(destination)?;
        let diff = source_size.abs_diff(dest_size) as f64;
        let allowed = source_size as f64 * self.size_tolerance_pct / 100.0;
        if diff > allowed {
            return Err(FusError::CopyVerification {
                path: destination.to_path_buf(),
                details: format!("copied {dest_size} of {source_size} bytes"),
            });
        }
        Ok(())
    }
}

impl BundleMover for FsMover {
    fn move_bundle(&self, source: &Path, destination: &Path) -> Result<MoveMethod> {
        if fs::symlink_metadata(destination).is_ok() {
            return Err(FusError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| FusError::io(parent, err))?;
        }

        match fs::rename(source, destination) {
            Ok(()) => Ok(MoveMethod::Rename),
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                self.copy_verify_delete(source, destination)
            }
            Err(err) => Err(FusError::io(source, err)),
        }
    }
}

/// Recursively copy a tree, recreating symlinks rather than following them.
fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(source).map_err(|err| FusError::io(source, err))?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(source).map_err(|err| FusError::io(source, err))?;
        return make_symlink(&target, destination);
    }

    if meta.is_dir() {
        fs::create_dir(destination).map_err(|err| FusError::io(destination, err))?;
        let entries = fs::read_dir(source).map_err(|err| FusError::io(source, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| FusError::io(source, err))?;
            copy_tree(&entry.path(), &destination.join(entry.file_name()))?;
        }
        fs::set_permissions(destination, meta.permissions())
            .map_err(|err| FusError::io(destination, err))?;
        return Ok(());
    }

    fs::copy(source, destination).map_err(|err| FusError::io(source, err))?;
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|err| FusError::io(link, err))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(FusError::UnsupportedPlatform {
        details: format!("cannot recreate symlink {}", link.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::bundle::tests::make_bundle;
    use tempfile::TempDir;

    #[test]
    fn rename_within_volume() {
        let tmp = TempDir::new().unwrap();
        let source = make_bundle(tmp.path(), "Mover.app", 64);
        let dest = tmp.path().join("AppBackup_1").join("Mover.app");

        let method = FsMover::default().move_bundle(&source, &dest).unwrap();
        assert_eq!(method, MoveMethod::Rename);
        assert!(!source.exists());
        assert!(dest.join("Contents/Info.plist").is_file());
    }

    #[test]
    fn existing_destination_is_refused() {
        let tmp = TempDir::new().unwrap();
        let source = make_bundle(tmp.path(), "Dup.app", 8);
        let backup = tmp.path().join("backup");
        make_bundle(&backup, "Dup.app", 8);

        let err = FsMover::default()
            .move_bundle(&source, &backup.join("Dup.app"))
            .unwrap_err();
        assert_eq!(err.code(), "FUS-2202");
        assert!(source.exists());
    }

    #[test]
    fn missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let err = FsMover::default()
            .move_bundle(&tmp.path().join("Gone.app"), &tmp.path().join("b/Gone.app"))
            .unwrap_err();
        assert_eq!(err.code(), "FUS-3002");
    }

    #[test]
    fn copy_verify_delete_moves_tree() {
        let tmp = TempDir::new().unwrap();
        let source = make_bundle(tmp.path(), "Copy.app", 4096);
        fs::create_dir_all(source.join("Contents/Resources/en.lproj")).unwrap();
        fs::write(source.join("Contents/Resources/en.lproj/Strings"), "hi").unwrap();
        let dest = tmp.path().join("Copied.app");

        let (before, _) = bundle_size(&source).unwrap();
        let method = FsMover::default().copy_verify_delete(&source, &dest).unwrap();

        assert_eq!(method, MoveMethod::CopyVerifyDelete);
        assert!(!source.exists());
        assert_eq!(bundle_size(&dest).unwrap().0, before);
        assert!(dest.join("Contents/Resources/en.lproj/Strings").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn copy_preserves_symlinks_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let source = make_bundle(tmp.path(), "Links.app", 16);
        let exe = source.join("Contents/MacOS/Links");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("MacOS/Links", source.join("Contents/current")).unwrap();
        let dest = tmp.path().join("out/Links.app");
        fs::create_dir_all(tmp.path().join("out")).unwrap();

        FsMover::default().copy_verify_delete(&source, &dest).unwrap();

        let link = fs::symlink_metadata(dest.join("Contents/current")).unwrap();
        assert!(link.file_type().is_symlink());
        let mode = fs::metadata(dest.join("Contents/MacOS/Links"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn method_labels() {
        assert_eq!(MoveMethod::Rename.as_str(), "rename");
        assert_eq!(MoveMethod::CopyVerifyDelete.as_str(), "copy");
    }
}
