//! Backup ledger: relocate selected bundles into a timestamped folder and
//! enumerate existing backup folders.
//!
//! There is no manifest. A backup folder's contents are whatever bundles it
//! holds, so listing and restoring always re-derive them from disk.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{FusError, Result};
use crate::core::paths::{
    deduplicated_folder_name, has_bundle_extension, parse_folder_timestamp,
    timestamped_folder_name,
};
use crate::inventory::ApplicationRecord;
use crate::logger::{ActivityLog, EventType, LogEntry, Severity};
use crate::reclaim::mover::{BundleMover, MoveMethod};
use crate::reclaim::selector::SelectionResult;

/// What happened to one selected bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Moved { method: MoveMethod },
    /// Dry run: nothing touched.
    WouldMove,
    Skipped { reason: String },
    Failed { code: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub app: ApplicationRecord,
    pub destination: PathBuf,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Result of one relocation run.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub folder: PathBuf,
    pub dry_run: bool,
    pub items: Vec<ItemReport>,
}

impl CommitReport {
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Moved { .. } | ItemOutcome::WouldMove))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Skipped { .. }))
            .count()
    }

    /// Bytes that left the source volume (or would have, on a dry run).
    pub fn bytes_moved(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Moved { .. } | ItemOutcome::WouldMove))
            .map(|i| i.app.size_bytes)
            .sum()
    }

    pub fn is_partial(&self) -> bool {
        self.failed() > 0
    }

    /// `"k/n succeeded"`.
    pub fn summary(&self) -> String {
        format!("{}/{} succeeded", self.succeeded(), self.items.len())
    }
}

/// A backup folder found on a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupFolder {
    pub name: String,
    pub path: PathBuf,
    /// Parsed from the folder name; `None` for a name with a foreign suffix.
    pub timestamp: Option<DateTime<Local>>,
    /// Bundle file names in the folder, sorted.
    pub applications: Vec<String>,
}

impl BackupFolder {
    pub fn app_count(&self) -> usize {
        self.applications.len()
    }
}

/// Relocates selections and indexes backup folders.
pub struct BackupLedger<'a> {
    mover: &'a dyn BundleMover,
    folder_prefix: String,
    bundle_extension: String,
    dry_run: bool,
}

impl<'a> BackupLedger<'a> {
    pub fn new(
        mover: &'a dyn BundleMover,
        folder_prefix: impl Into<String>,
        bundle_extension: impl Into<String>,
    ) -> Self {
        Self {
            mover,
            folder_prefix: folder_prefix.into(),
            bundle_extension: bundle_extension.into(),
            dry_run: false,
        }
    }

    pub fn from_config(mover: &'a dyn BundleMover, config: &Config) -> Self {
        Self::new(
            mover,
            &config.backup.folder_prefix,
            &config.inventory.bundle_extension,
        )
        .with_dry_run(config.backup.dry_run)
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Move every chosen bundle into a backup folder on `volume`.
    ///
    /// `existing` reuses a folder instead of creating a new timestamped one.
    /// A failure on one bundle is recorded and the run continues; bundles
    /// already moved stay moved.
    pub fn commit(
        &self,
        volume: &Path,
        selection: &SelectionResult,
        existing: Option<&Path>,
        log: &mut ActivityLog,
    ) -> Result<CommitReport> {
        self.commit_with(volume, selection, existing, &mut |_: &ItemReport| true, log)
    }

    /// Like [`commit`](Self::commit), calling `after_failure` for each failed
    /// item. Returning `false` stops the run; the remaining items are
    /// reported as skipped. A bundle the caller moved by hand in the
    /// meantime is recorded as moved.
    pub fn commit_with<F>(
        &self,
        volume: &Path,
        selection: &SelectionResult,
        existing: Option<&Path>,
        after_failure: &mut F,
        log: &mut ActivityLog,
    ) -> Result<CommitReport>
    where
        F: FnMut(&ItemReport) -> bool + ?Sized,
    {
        if !volume.is_dir() {
            return Err(FusError::io(
                volume,
                std::io::Error::new(std::io::ErrorKind::NotFound, "volume is not mounted"),
            ));
        }

        let folder = match existing {
            Some(path) => {
                if !self.dry_run {
                    fs::create_dir_all(path).map_err(|err| FusError::io(path, err))?;
                }
                path.to_path_buf()
            }
            None => {
                let base = timestamped_folder_name(&self.folder_prefix, &Local::now());
                if self.dry_run {
                    volume.join(base)
                } else {
                    create_fresh_folder(volume, &base)?
                }
            }
        };

        let mut items = Vec::with_capacity(selection.chosen.len());
        let mut stopped = false;
        for app in &selection.chosen {
            let destination = folder.join(app.file_name());
            if stopped {
                items.push(ItemReport {
                    app: app.clone(),
                    destination,
                    outcome: ItemOutcome::Skipped {
                        reason: "run stopped after an earlier failure".to_string(),
                    },
                });
                continue;
            }

            let outcome = self.relocate_one(app, &destination, log);
            let mut item = ItemReport {
                app: app.clone(),
                destination,
                outcome,
            };
            if matches!(item.outcome, ItemOutcome::Failed { .. }) {
                stopped = !after_failure(&item);
                if moved_by_hand(&item.app.path, &item.destination) {
                    let mut entry = LogEntry::new(EventType::AppMoved, Severity::Info)
                        .with_app(&item.app.name)
                        .with_path(&item.app.path)
                        .with_destination(&item.destination);
                    entry.size = Some(item.app.size_bytes);
                    entry.method = Some(MoveMethod::Manual.as_str().to_string());
                    entry.ok = Some(true);
                    log.record(&entry);
                    item.outcome = ItemOutcome::Moved {
                        method: MoveMethod::Manual,
                    };
                }
            }
            items.push(item);
        }

        let report = CommitReport {
            folder,
            dry_run: self.dry_run,
            items,
        };

        let mut entry = LogEntry::new(
            EventType::BackupCommitted,
            if report.is_partial() {
                Severity::Warning
            } else {
                Severity::Info
            },
        )
        .with_destination(&report.folder)
        .with_details(report.summary());
        entry.succeeded = Some(report.succeeded());
        entry.failed = Some(report.failed());
        entry.size = Some(report.bytes_moved());
        entry.dry_run = Some(self.dry_run);
        log.record(&entry);

        Ok(report)
    }

    fn relocate_one(
        &self,
        app: &ApplicationRecord,
        destination: &Path,
        log: &mut ActivityLog,
    ) -> ItemOutcome {
        if fs::symlink_metadata(&app.path).is_err() {
            return ItemOutcome::Skipped {
                reason: "no longer present".to_string(),
            };
        }
        if self.dry_run {
            return ItemOutcome::WouldMove;
        }

        match self.mover.move_bundle(&app.path, destination) {
            Ok(method) => {
                let mut entry = LogEntry::new(EventType::AppMoved, Severity::Info)
                    .with_app(&app.name)
                    .with_path(&app.path)
                    .with_destination(destination);
                entry.size = Some(app.size_bytes);
                entry.method = Some(method.as_str().to_string());
                entry.ok = Some(true);
                log.record(&entry);
                ItemOutcome::Moved { method }
            }
            Err(err) => {
                log.record(
                    &LogEntry::new(EventType::AppMoveFailed, Severity::Error)
                        .with_app(&app.name)
                        .with_path(&app.path)
                        .with_destination(destination)
                        .with_error(&err),
                );
                ItemOutcome::Failed {
                    code: err.code().to_string(),
                    error: err.to_string(),
                }
            }
        }
    }

    pub fn list_backup_folders(&self, volume: &Path) -> Result<Vec<BackupFolder>> {
        list_backup_folders(volume, &self.folder_prefix, &self.bundle_extension)
    }
}

/// Create a backup folder that no earlier run is using.
fn create_fresh_folder(volume: &Path, base: &str) -> Result<PathBuf> {
    const MAX_ATTEMPTS: u32 = 100;
    for attempt in 1..=MAX_ATTEMPTS {
        let candidate = volume.join(deduplicated_folder_name(base, attempt));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(FusError::io(&candidate, err)),
        }
    }
    Err(FusError::DestinationExists {
        path: volume.join(base),
    })
}

/// The source is gone and a bundle sits at the destination.
fn moved_by_hand(source: &Path, destination: &Path) -> bool {
    fs::symlink_metadata(source).is_err() && destination.is_dir()
}

/// Backup folders directly under `volume`, newest first.
pub fn list_backup_folders(
    volume: &Path,
    prefix: &str,
    bundle_extension: &str,
) -> Result<Vec<BackupFolder>> {
    let entries = fs::read_dir(volume).map_err(|err| FusError::io(volume, err))?;

    let mut folders: Vec<BackupFolder> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|ft| ft.is_dir()))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(prefix) {
                return None;
            }
            let path = entry.path();
            Some(BackupFolder {
                timestamp: parse_folder_timestamp(prefix, &name),
                applications: bundle_names(&path, bundle_extension),
                name,
                path,
            })
        })
        .collect();

    folders.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(folders)
}

fn bundle_names(folder: &Path, bundle_extension: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|ft| ft.is_dir()))
        .map(|e| e.path())
        .filter(|p| has_bundle_extension(p, bundle_extension))
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect();
    names.sort();
    names
}
