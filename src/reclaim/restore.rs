//! Restore: move bundles from a backup folder back into the applications
//! directory and reset their permissions.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{FusError, Result};
use crate::inventory::bundle::{bundles_identical, check_integrity};
use crate::inventory::{ApplicationInventory, ApplicationRecord};
use crate::logger::{ActivityLog, EventType, LogEntry, Severity};
use crate::platform::trust::{PermissionIssue, TrustReset};
use crate::reclaim::ledger::{BackupFolder, list_backup_folders};
use crate::reclaim::mover::{BundleMover, MoveMethod};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSkip {
    /// The same build is already installed.
    AlreadyPresent,
    /// A different build is installed and the caller chose to keep it.
    Declined,
    /// The backup copy is incomplete.
    Damaged(String),
    /// The backup copy disappeared between resolve and restore.
    Missing,
}

impl std::fmt::Display for RestoreSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyPresent => f.write_str("identical copy already installed"),
            Self::Declined => f.write_str("kept the installed copy"),
            Self::Damaged(why) => write!(f, "backup copy is damaged ({why})"),
            Self::Missing => f.write_str("no longer in the backup folder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored {
        method: MoveMethod,
        replaced_existing: bool,
        permission_issues: Vec<PermissionIssue>,
    },
    WouldRestore,
    Skipped {
        reason: RestoreSkip,
    },
    Failed {
        code: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreItem {
    pub app: ApplicationRecord,
    pub destination: PathBuf,
    #[serde(flatten)]
    pub outcome: RestoreOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub items: Vec<RestoreItem>,
}

impl RestoreReport {
    /// True when the resolved set was empty.
    pub fn nothing_to_restore(&self) -> bool {
        self.items.is_empty()
    }

    pub fn restored(&self) -> usize {
        self.items
            .iter()
            .filter(|i| {
                matches!(
                    i.outcome,
                    RestoreOutcome::Restored { .. } | RestoreOutcome::WouldRestore
                )
            })
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, RestoreOutcome::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, RestoreOutcome::Skipped { .. }))
            .count()
    }

    /// Files whose permissions could not be fixed, across all bundles.
    pub fn permission_issues(&self) -> impl Iterator<Item = &PermissionIssue> {
        self.items.iter().flat_map(|i| match &i.outcome {
            RestoreOutcome::Restored {
                permission_issues, ..
            } => permission_issues.as_slice(),
            _ => &[],
        })
    }

    pub fn is_partial(&self) -> bool {
        self.failed() > 0 || self.permission_issues().next().is_some()
    }

    pub fn summary(&self) -> String {
        if self.nothing_to_restore() {
            return "nothing to restore".to_string();
        }
        format!("{}/{} restored", self.restored(), self.items.len())
    }
}

pub struct RestoreResolver<'a> {
    inventory: ApplicationInventory,
    mover: &'a dyn BundleMover,
    trust: &'a dyn TrustReset,
    folder_prefix: String,
    dry_run: bool,
}

impl<'a> RestoreResolver<'a> {
    pub fn new(
        bundle_extension: &str,
        folder_prefix: &str,
        mover: &'a dyn BundleMover,
        trust: &'a dyn TrustReset,
    ) -> Self {
        Self {
            inventory: ApplicationInventory::unprotected(bundle_extension),
            mover,
            trust,
            folder_prefix: folder_prefix.to_string(),
            dry_run: false,
        }
    }

    pub fn from_config(
        config: &Config,
        mover: &'a dyn BundleMover,
        trust: &'a dyn TrustReset,
    ) -> Self {
        Self::new(
            &config.inventory.bundle_extension,
            &config.backup.folder_prefix,
            mover,
            trust,
        )
        .with_dry_run(config.backup.dry_run)
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Bundles currently held by a backup folder, in name order.
    pub fn resolve(&self, folder: &Path) -> Result<Vec<ApplicationRecord>> {
        if !folder.is_dir() {
            return Err(FusError::BackupNotFound {
                path: folder.to_path_buf(),
            });
        }
        Ok(self.inventory.scan(folder)?.records)
    }

    /// Move each record into `destination_root`, then reset its permissions.
    ///
    /// Damaged bundles and bundles identical to the installed copy are
    /// skipped. A different installed copy is replaced only when `overwrite`
    /// says so. Failures are per bundle; the run always continues.
    pub fn restore<F>(
        &self,
        records: &[ApplicationRecord],
        destination_root: &Path,
        overwrite: &mut F,
        log: &mut ActivityLog,
    ) -> RestoreReport
    where
        F: FnMut(&ApplicationRecord) -> bool + ?Sized,
    {
        let mut items = Vec::with_capacity(records.len());
        for app in records {
            let destination = destination_root.join(app.file_name());
            let outcome = self.restore_one(app, &destination, overwrite, log);
            items.push(RestoreItem {
                app: app.clone(),
                destination,
                outcome,
            });
        }
        RestoreReport { items }
    }

    fn restore_one<F>(
        &self,
        app: &ApplicationRecord,
        destination: &Path,
        overwrite: &mut F,
        log: &mut ActivityLog,
    ) -> RestoreOutcome
    where
        F: FnMut(&ApplicationRecord) -> bool + ?Sized,
    {
        if fs::symlink_metadata(&app.path).is_err() {
            return RestoreOutcome::Skipped {
                reason: RestoreSkip::Missing,
            };
        }
        let integrity = check_integrity(&app.path);
        if !integrity.is_intact() {
            return RestoreOutcome::Skipped {
                reason: RestoreSkip::Damaged(integrity.to_string()),
            };
        }

        let installed = fs::symlink_metadata(destination).is_ok();
        if installed {
            if bundles_identical(&app.path, destination) {
                return RestoreOutcome::Skipped {
                    reason: RestoreSkip::AlreadyPresent,
                };
            }
            if !overwrite(app) {
                return RestoreOutcome::Skipped {
                    reason: RestoreSkip::Declined,
                };
            }
        }

        if self.dry_run {
            return RestoreOutcome::WouldRestore;
        }

        match self.move_back(app, destination, installed) {
            Ok(method) => {
                let trust = self.trust.reset(destination);
                let mut entry = LogEntry::new(
                    EventType::AppRestored,
                    if trust.is_clean() {
                        Severity::Info
                    } else {
                        Severity::Warning
                    },
                )
                .with_app(&app.name)
                .with_path(&app.path)
                .with_destination(destination);
                entry.method = Some(method.as_str().to_string());
                entry.size = Some(app.size_bytes);
                entry.ok = Some(true);
                if !trust.is_clean() {
                    entry.details = Some(format!("{} permission issues", trust.issues.len()));
                }
                log.record(&entry);
                RestoreOutcome::Restored {
                    method,
                    replaced_existing: installed,
                    permission_issues: trust.issues,
                }
            }
            Err(err) => {
                log.record(
                    &LogEntry::new(EventType::RestoreFailed, Severity::Error)
                        .with_app(&app.name)
                        .with_path(&app.path)
                        .with_destination(destination)
                        .with_error(&err),
                );
                RestoreOutcome::Failed {
                    code: err.code().to_string(),
                    error: err.to_string(),
                }
            }
        }
    }

    fn move_back(
        &self,
        app: &ApplicationRecord,
        destination: &Path,
        replace: bool,
    ) -> Result<MoveMethod> {
        if !replace {
            return self.mover.move_bundle(&app.path, destination);
        }

        // Keep the installed copy until the backup is in place.
        let aside = aside_path(destination);
        fs::rename(destination, &aside).map_err(|err| FusError::io(destination, err))?;
        match self.mover.move_bundle(&app.path, destination) {
            Ok(method) => {
                let _ = remove_installed(&aside);
                Ok(method)
            }
            Err(err) => {
                // If the mover kept a verified copy, the aside copy stays too.
                if fs::symlink_metadata(destination).is_err() {
                    fs::rename(&aside, destination).map_err(|err| FusError::io(&aside, err))?;
                }
                Err(err)
            }
        }
    }

    /// Restore every backup folder on `volume`, newest first.
    pub fn restore_all<F>(
        &self,
        volume: &Path,
        destination_root: &Path,
        overwrite: &mut F,
        log: &mut ActivityLog,
    ) -> Result<Vec<(BackupFolder, RestoreReport)>>
    where
        F: FnMut(&ApplicationRecord) -> bool + ?Sized,
    {
        let folders = list_backup_folders(
            volume,
            &self.folder_prefix,
            self.inventory.bundle_extension(),
        )?;
        let mut results = Vec::with_capacity(folders.len());
        for folder in folders {
            let records = self.resolve(&folder.path)?;
            let report = self.restore(&records, destination_root, overwrite, log);
            results.push((folder, report));
        }
        Ok(results)
    }
}

/// Hidden sibling name for an installed bundle being replaced.
fn aside_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map_or_else(|| "bundle".to_string(), |n| n.to_string_lossy().into_owned());
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let mut candidate = parent.join(format!(".{name}.fus-replaced"));
    let mut n = 1;
    while fs::symlink_metadata(&candidate).is_ok() {
        candidate = parent.join(format!(".{name}.fus-replaced-{n}"));
        n += 1;
    }
    candidate
}

fn remove_installed(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|err| FusError::io(path, err))?;
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(|err| FusError::io(path, err))
    } else {
        fs::remove_file(path).map_err(|err| FusError::io(path, err))
    }
}
