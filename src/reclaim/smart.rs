//! Smart restore: fix permissions on bundles that were copied back by hand.
//!
//! Such bundles show up as recently modified entries in the applications
//! directory. They get the same trust reset a normal restore applies.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::config::RestoreConfig;
use crate::core::errors::{FusError, Result};
use crate::core::paths::{bundle_stem, has_bundle_extension};
use crate::inventory::bundle::{check_integrity, looks_like_alias};
use crate::logger::{ActivityLog, EventType, LogEntry, Severity};
use crate::platform::Platform;
use crate::platform::trust::{TrustReport, TrustReset};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentBundle {
    pub name: String,
    pub path: PathBuf,
    pub modified: DateTime<Local>,
    /// Why the bundle looks incomplete, if it does.
    pub problem: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecentScan {
    /// Newest first.
    pub bundles: Vec<RecentBundle>,
    /// Recent entries that are links or placeholders, not real bundles.
    pub aliases: Vec<PathBuf>,
}

impl RecentScan {
    pub fn intact(&self) -> impl Iterator<Item = &RecentBundle> {
        self.bundles.iter().filter(|b| b.problem.is_none())
    }
}

/// Bundles in `applications_dir` modified within `window`, newest first.
pub fn recently_modified(
    applications_dir: &Path,
    bundle_extension: &str,
    window: Duration,
) -> Result<RecentScan> {
    let cutoff = SystemTime::now()
        .checked_sub(window)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let entries =
        fs::read_dir(applications_dir).map_err(|err| FusError::io(applications_dir, err))?;

    let mut scan = RecentScan::default();
    let mut found: Vec<(SystemTime, RecentBundle)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !has_bundle_extension(&path, bundle_extension) {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified < cutoff {
            continue;
        }
        if looks_like_alias(&path) {
            scan.aliases.push(path);
            continue;
        }
        let integrity = check_integrity(&path);
        found.push((
            modified,
            RecentBundle {
                name: bundle_stem(&path, bundle_extension),
                modified: DateTime::<Local>::from(modified),
                problem: (!integrity.is_intact()).then(|| integrity.to_string()),
                path,
            },
        ));
    }

    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    scan.bundles = found.into_iter().map(|(_, bundle)| bundle).collect();
    scan.aliases.sort();
    Ok(scan)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FixResult {
    Fixed { report: TrustReport },
    /// Still open after every poll.
    InUse,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub path: PathBuf,
    #[serde(flatten)]
    pub result: FixResult,
}

impl FixOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(&self.result, FixResult::Fixed { report } if report.is_clean())
    }
}

/// Applies trust resets to hand-restored bundles.
pub struct SmartRestore<'a> {
    platform: &'a dyn Platform,
    trust: &'a dyn TrustReset,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl<'a> SmartRestore<'a> {
    pub fn new(platform: &'a dyn Platform, trust: &'a dyn TrustReset) -> Self {
        Self {
            platform,
            trust,
            poll_attempts: 30,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn from_config(
        config: &RestoreConfig,
        platform: &'a dyn Platform,
        trust: &'a dyn TrustReset,
    ) -> Self {
        Self::new(platform, trust).with_polling(
            config.in_use_poll_attempts,
            Duration::from_millis(config.in_use_poll_interval_ms),
        )
    }

    #[must_use]
    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_interval = interval;
        self
    }

    /// Reset each bundle, one at a time. A bundle still in use after the
    /// polling budget is skipped.
    pub fn fix_permissions(&self, bundles: &[PathBuf], log: &mut ActivityLog) -> Vec<FixOutcome> {
        bundles
            .iter()
            .map(|path| {
                let result = self.fix_one(path);
                if let FixResult::Fixed { report } = &result {
                    let mut entry = LogEntry::new(
                        EventType::PermissionsFixed,
                        if report.is_clean() {
                            Severity::Info
                        } else {
                            Severity::Warning
                        },
                    )
                    .with_path(path);
                    entry.ok = Some(report.is_clean());
                    entry.details = Some(format!(
                        "{} entries updated, {} issues",
                        report.entries_updated,
                        report.issues.len()
                    ));
                    log.record(&entry);
                }
                FixOutcome {
                    path: path.clone(),
                    result,
                }
            })
            .collect()
    }

    fn fix_one(&self, path: &Path) -> FixResult {
        if fs::symlink_metadata(path).is_err() {
            return FixResult::Missing;
        }
        if !self.wait_until_free(path) {
            return FixResult::InUse;
        }
        FixResult::Fixed {
            report: self.trust.reset(path),
        }
    }

    fn wait_until_free(&self, path: &Path) -> bool {
        for attempt in 0..=self.poll_attempts {
            if !self.platform.is_in_use(path) {
                return true;
            }
            if attempt < self.poll_attempts && !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::bundle::tests::make_bundle;
    use crate::platform::MockPlatform;
    use crate::platform::trust::PermissionIssue;
    use filetime::FileTime;
    use tempfile::TempDir;

    struct CountingTrust(std::cell::Cell<usize>);

    impl TrustReset for CountingTrust {
        fn reset(&self, _bundle: &Path) -> TrustReport {
            self.0.set(self.0.get() + 1);
            TrustReport::default()
        }
    }

    fn age(path: &Path, hours: i64) {
        let then = FileTime::from_unix_time(FileTime::now().unix_seconds() - hours * 3600, 0);
        filetime::set_file_mtime(path, then).unwrap();
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn recent_bundles_newest_first() {
        let tmp = TempDir::new().unwrap();
        let older = make_bundle(tmp.path(), "Older.app", 10);
        let newer = make_bundle(tmp.path(), "Newer.app", 10);
        let stale = make_bundle(tmp.path(), "Stale.app", 10);
        age(&older, 5);
        age(&newer, 1);
        age(&stale, 48);

        let scan = recently_modified(tmp.path(), ".app", DAY).unwrap();
        let names: Vec<&str> = scan.bundles.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Newer", "Older"]);
        assert!(scan.aliases.is_empty());
    }

    #[test]
    fn aliases_and_damaged_bundles_are_flagged() {
        let tmp = TempDir::new().unwrap();
        let hollow = tmp.path().join("Hollow.app");
        fs::create_dir_all(&hollow).unwrap();
        let broken = make_bundle(tmp.path(), "Broken.app", 10);
        fs::remove_file(broken.join("Contents/MacOS/Broken")).unwrap();
        make_bundle(tmp.path(), "Fine.app", 10);

        let scan = recently_modified(tmp.path(), ".app", DAY).unwrap();
        assert_eq!(scan.aliases, vec![hollow]);
        let intact: Vec<&str> = scan.intact().map(|b| b.name.as_str()).collect();
        assert_eq!(intact, vec!["Fine"]);
        assert_eq!(scan.bundles.len(), 2);
    }

    #[test]
    fn missing_applications_dir_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(recently_modified(&tmp.path().join("nope"), ".app", DAY).is_err());
    }

    #[test]
    fn fixes_free_bundles_and_waits_for_busy_ones() {
        let tmp = TempDir::new().unwrap();
        let free = make_bundle(tmp.path(), "Free.app", 10);
        let busy = make_bundle(tmp.path(), "Busy.app", 10);
        let stuck = make_bundle(tmp.path(), "Stuck.app", 10);
        let platform = MockPlatform::new()
            .with_busy_polls(&busy, 2)
            .with_in_use(&stuck);
        let trust = CountingTrust(std::cell::Cell::new(0));
        let smart = SmartRestore::new(&platform, &trust).with_polling(3, Duration::ZERO);

        let outcomes = smart.fix_permissions(
            &[free, busy, stuck, tmp.path().join("Gone.app")],
            &mut ActivityLog::disabled(),
        );

        assert!(outcomes[0].is_clean());
        assert!(outcomes[1].is_clean());
        assert_eq!(outcomes[2].result, FixResult::InUse);
        assert_eq!(outcomes[3].result, FixResult::Missing);
        assert_eq!(trust.0.get(), 2);
    }

    #[test]
    fn unclean_report_is_not_clean_outcome() {
        let outcome = FixOutcome {
            path: PathBuf::from("/Applications/X.app"),
            result: FixResult::Fixed {
                report: TrustReport {
                    entries_updated: 0,
                    quarantine_cleared: false,
                    issues: vec![PermissionIssue {
                        path: PathBuf::from("/Applications/X.app/Contents"),
                        reason: "denied".to_string(),
                    }],
                },
            },
        };
        assert!(!outcome.is_clean());
    }
}
