//! Snapshot-backed offload and restore.
//!
//! When a snapshot backup destination is configured, a bundle that is
//! confirmed present in the latest backup can simply be deleted locally.
//! Restoring copies it back out of that backup.
//!
//! [`SnapshotStrategy`] is built explicitly by the caller from configuration
//! and a [`SnapshotFacility`]; nothing here is process-global.

#![allow(missing_docs)]

pub mod tmutil;

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::core::config::SnapshotConfig;
use crate::core::errors::{FusError, Result};
use crate::core::paths::has_bundle_extension;
use crate::inventory::ApplicationRecord;
use crate::logger::{ActivityLog, EventType, LogEntry, Severity};
use crate::platform::trust::{TrustReport, TrustReset};

pub use tmutil::TmutilFacility;

/// The OS backup facility, reduced to what fus needs from it.
pub trait SnapshotFacility {
    /// Configured backup destination, `None` if there is none.
    fn destination(&self) -> Result<Option<String>>;
    /// Completed backups, oldest first.
    fn list_backups(&self) -> Result<Vec<PathBuf>>;
    fn latest_backup(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_backups()?.pop())
    }
    /// Copy `source` out of a backup to `destination`.
    fn restore(&self, source: &Path, destination: &Path) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotStatus {
    Available { destination: String },
    NotConfigured,
    Unsupported,
}

impl SnapshotStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available { destination } => write!(f, "available ({destination})"),
            Self::NotConfigured => f.write_str("no backup destination configured"),
            Self::Unsupported => f.write_str("not supported on this system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OffloadOutcome {
    Deleted { snapshot_path: PathBuf },
    /// Dry run: verified but left in place.
    WouldDelete { snapshot_path: PathBuf },
    /// Never found in a backup; the local copy is untouched.
    Unverified { attempts: u32 },
    Failed { code: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct OffloadItem {
    pub app: ApplicationRecord,
    #[serde(flatten)]
    pub outcome: OffloadOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct OffloadReport {
    pub backup: PathBuf,
    pub dry_run: bool,
    pub items: Vec<OffloadItem>,
}

impl OffloadReport {
    pub fn deleted(&self) -> usize {
        self.items
            .iter()
            .filter(|i| {
                matches!(
                    i.outcome,
                    OffloadOutcome::Deleted { .. } | OffloadOutcome::WouldDelete { .. }
                )
            })
            .count()
    }

    pub fn unverified(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, OffloadOutcome::Unverified { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, OffloadOutcome::Failed { .. }))
            .count()
    }

    pub fn bytes_freed(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, OffloadOutcome::Deleted { .. }))
            .map(|i| i.app.size_bytes)
            .sum()
    }

    /// Something was left behind or broke.
    pub fn is_partial(&self) -> bool {
        self.unverified() + self.failed() > 0
    }

    pub fn summary(&self) -> String {
        format!("{}/{} deleted", self.deleted(), self.items.len())
    }
}

/// A bundle copied back from the latest backup.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRestore {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub permissions: TrustReport,
}

pub struct SnapshotStrategy<'a> {
    facility: Option<&'a dyn SnapshotFacility>,
    max_verify_attempts: u32,
    dry_run: bool,
}

impl<'a> SnapshotStrategy<'a> {
    pub fn new(facility: Option<&'a dyn SnapshotFacility>, max_verify_attempts: u32) -> Self {
        Self {
            facility,
            max_verify_attempts: max_verify_attempts.max(1),
            dry_run: false,
        }
    }

    pub fn from_config(config: &SnapshotConfig, facility: Option<&'a dyn SnapshotFacility>) -> Self {
        Self::new(facility.filter(|_| config.enabled), config.max_verify_attempts)
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn status(&self) -> Result<SnapshotStatus> {
        let Some(facility) = self.facility else {
            return Ok(SnapshotStatus::Unsupported);
        };
        Ok(match facility.destination()? {
            Some(destination) => SnapshotStatus::Available { destination },
            None => SnapshotStatus::NotConfigured,
        })
    }

    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        self.facility()?.list_backups()
    }

    pub fn latest_backup(&self) -> Result<Option<PathBuf>> {
        self.facility()?.latest_backup()
    }

    /// The latest completed backup, when the facility is configured and can
    /// name one. Offloading needs this; callers fall back to a removable
    /// drive when it fails.
    pub fn ready_for_offload(&self) -> Result<PathBuf> {
        let status = self.status()?;
        if !status.is_available() {
            return Err(FusError::SnapshotUnavailable {
                details: status.to_string(),
            });
        }
        self.require_latest()
    }

    /// Where the latest backup holds `record`, if it does.
    pub fn locate(&self, record: &ApplicationRecord) -> Result<Option<PathBuf>> {
        Ok(self
            .latest_backup()?
            .and_then(|backup| locate_in_backup(&backup, &record.path)))
    }

    /// Delete each record locally once the latest backup is shown to hold it.
    ///
    /// A record missing from the backup is retried while `retry` agrees and
    /// attempts remain (the user may run a backup in between). Records that
    /// never verify are left alone.
    pub fn offload<F>(
        &self,
        records: &[ApplicationRecord],
        retry: &mut F,
        log: &mut ActivityLog,
    ) -> Result<OffloadReport>
    where
        F: FnMut(&ApplicationRecord, u32) -> bool + ?Sized,
    {
        let mut backup = self.ready_for_offload()?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let mut attempts = 1;
            let found = loop {
                if let Some(path) = locate_in_backup(&backup, &record.path) {
                    break Some(path);
                }
                if attempts >= self.max_verify_attempts || !retry(record, attempts) {
                    break None;
                }
                attempts += 1;
                backup = self.require_latest()?;
            };

            let outcome = match found {
                None => OffloadOutcome::Unverified { attempts },
                Some(snapshot_path) if self.dry_run => OffloadOutcome::WouldDelete { snapshot_path },
                Some(snapshot_path) => match fs::remove_dir_all(&record.path) {
                    Ok(()) => OffloadOutcome::Deleted { snapshot_path },
                    Err(err) => {
                        let err = FusError::io(&record.path, err);
                        OffloadOutcome::Failed {
                            code: err.code().to_string(),
                            error: err.to_string(),
                        }
                    }
                },
            };
            log_offload(log, record, &outcome);
            items.push(OffloadItem {
                app: record.clone(),
                outcome,
            });
        }

        Ok(OffloadReport {
            backup,
            dry_run: self.dry_run,
            items,
        })
    }

    /// Copy `name` back from the latest backup into `destination_root`.
    pub fn restore(
        &self,
        name: &str,
        bundle_extension: &str,
        destination_root: &Path,
        trust: &dyn TrustReset,
        log: &mut ActivityLog,
    ) -> Result<SnapshotRestore> {
        let file_name = if has_bundle_extension(Path::new(name), bundle_extension) {
            name.to_string()
        } else {
            format!("{name}{bundle_extension}")
        };
        let destination = destination_root.join(&file_name);
        if fs::symlink_metadata(&destination).is_ok() {
            return Err(FusError::DestinationExists { path: destination });
        }

        let backup = self.require_latest()?;
        let source = locate_in_backup(&backup, &destination).ok_or_else(|| {
            FusError::NotInSnapshot {
                path: destination.clone(),
            }
        })?;

        if self.dry_run {
            return Ok(SnapshotRestore {
                source,
                destination,
                permissions: TrustReport::default(),
            });
        }

        if let Err(err) = self.facility()?.restore(&source, &destination) {
            log.record(
                &LogEntry::new(EventType::RestoreFailed, Severity::Error)
                    .with_app(file_name.as_str())
                    .with_path(&source)
                    .with_error(&err),
            );
            return Err(err);
        }
        let permissions = trust.reset(&destination);

        let mut entry = LogEntry::new(EventType::SnapshotRestore, Severity::Info)
            .with_app(file_name.as_str())
            .with_path(&source)
            .with_destination(&destination);
        entry.ok = Some(permissions.is_clean());
        log.record(&entry);

        Ok(SnapshotRestore {
            source,
            destination,
            permissions,
        })
    }

    fn facility(&self) -> Result<&'a dyn SnapshotFacility> {
        self.facility.ok_or_else(|| FusError::SnapshotUnavailable {
            details: SnapshotStatus::Unsupported.to_string(),
        })
    }

    fn require_latest(&self) -> Result<PathBuf> {
        self.latest_backup()?
            .ok_or_else(|| FusError::SnapshotUnavailable {
                details: "no completed backup".to_string(),
            })
    }
}

fn log_offload(log: &mut ActivityLog, record: &ApplicationRecord, outcome: &OffloadOutcome) {
    let entry = LogEntry::new(
        EventType::SnapshotDelete,
        match outcome {
            OffloadOutcome::Deleted { .. } | OffloadOutcome::WouldDelete { .. } => Severity::Info,
            OffloadOutcome::Unverified { .. } => Severity::Warning,
            OffloadOutcome::Failed { .. } => Severity::Error,
        },
    )
    .with_app(record.name.as_str())
    .with_path(&record.path);
    let mut entry = match outcome {
        OffloadOutcome::Deleted { snapshot_path } | OffloadOutcome::WouldDelete { snapshot_path } => {
            entry.with_destination(snapshot_path)
        }
        OffloadOutcome::Unverified { attempts } => {
            entry.with_details(format!("not found in backup after {attempts} attempts"))
        }
        OffloadOutcome::Failed { error, .. } => entry.with_details(error.as_str()),
    };
    entry.size = Some(record.size_bytes);
    entry.dry_run = Some(matches!(outcome, OffloadOutcome::WouldDelete { .. }));
    entry.ok = Some(matches!(
        outcome,
        OffloadOutcome::Deleted { .. } | OffloadOutcome::WouldDelete { .. }
    ));
    log.record(&entry);
}

/// Find `original` inside a backup. Backups either mirror the root
/// directly or nest it one level down under a volume name.
pub fn locate_in_backup(backup: &Path, original: &Path) -> Option<PathBuf> {
    let relative: PathBuf = original
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if relative.as_os_str().is_empty() {
        return None;
    }

    let direct = backup.join(&relative);
    if is_real_dir(&direct) {
        return Some(direct);
    }

    let mut volumes: Vec<PathBuf> = fs::read_dir(backup)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| is_real_dir(p))
        .collect();
    volumes.sort();
    volumes
        .into_iter()
        .map(|v| v.join(&relative))
        .find(|candidate| is_real_dir(candidate))
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}
