//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{FusError, Result};

/// Full free_up_space configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub inventory: InventoryConfig,
    pub selection: SelectionConfig,
    pub volumes: VolumeConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub snapshot: SnapshotConfig,
    pub paths: PathsConfig,
}

/// Where applications live and which of them are off-limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InventoryConfig {
    pub applications_dir: PathBuf,
    /// Directory-name suffix identifying an application bundle.
    pub bundle_extension: String,
    /// Bundle names or glob patterns that are never moved.
    pub protected_apps: Vec<String>,
}

/// Free-space target defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    /// Offered as the default answer to the target prompt.
    pub default_target_free_gb: f64,
    /// Volume whose free space the target refers to.
    pub system_volume: PathBuf,
}

/// Removable volume discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VolumeConfig {
    pub volumes_dir: PathBuf,
    /// Entries under `volumes_dir` that are system volumes, not backup targets.
    pub excluded_volumes: Vec<String>,
    /// Volume offered first when it is mounted and already holds backups.
    pub preferred_volume: Option<String>,
}

/// Relocation behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupConfig {
    pub folder_prefix: String,
    pub dry_run: bool,
    /// Compare source and copy before deleting the source on cross-volume moves.
    pub verify_copies: bool,
    /// Allowed size difference between source and copy, in percent.
    pub size_tolerance_pct: f64,
    /// Refuse to relocate or restore unless running as root.
    pub require_root: bool,
}

/// Restore and permission-fixup behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestoreConfig {
    /// Window used by smart restore to find hand-copied bundles.
    pub recent_window_hours: u64,
    /// Subdirectory of a bundle whose files must be executable.
    pub executable_subdir: PathBuf,
    pub clear_quarantine: bool,
    /// Polls to wait for an in-use bundle before skipping it.
    pub in_use_poll_attempts: u32,
    pub in_use_poll_interval_ms: u64,
}

/// Snapshot backup facility (Time Machine).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub tmutil_path: PathBuf,
    /// How many times the user may retry verification of one item.
    pub max_verify_attempts: u32,
}

/// Filesystem paths used by fus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            applications_dir: PathBuf::from("/Applications"),
            bundle_extension: ".app".to_string(),
            protected_apps: vec!["1Password.app".to_string(), "Obsidian.app".to_string()],
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            default_target_free_gb: 20.0,
            system_volume: PathBuf::from("/"),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            volumes_dir: PathBuf::from("/Volumes"),
            excluded_volumes: vec![
                "Macintosh HD".to_string(),
                "Preboot".to_string(),
                "Recovery".to_string(),
            ],
            preferred_volume: None,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            folder_prefix: "AppBackup_".to_string(),
            dry_run: false,
            verify_copies: true,
            size_tolerance_pct: 1.0,
            require_root: false,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            recent_window_hours: 24,
            executable_subdir: PathBuf::from("Contents/MacOS"),
            clear_quarantine: true,
            in_use_poll_attempts: 30,
            in_use_poll_interval_ms: 1_000,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(target_os = "macos"),
            tmutil_path: PathBuf::from("/usr/bin/tmutil"),
            max_verify_attempts: 3,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[FUS-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("fus").join("config.toml"),
            activity_log: home_dir
                .join(".local")
                .join("share")
                .join("fus")
                .join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| FusError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(FusError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // inventory
        if let Some(raw) = lookup("FUS_APPLICATIONS_DIR") {
            self.inventory.applications_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("FUS_BUNDLE_EXTENSION") {
            self.inventory.bundle_extension = raw;
        }

        // selection
        if let Some(raw) = lookup("FUS_DEFAULT_TARGET_FREE_GB") {
            self.selection.default_target_free_gb =
                parse_env_f64("FUS_DEFAULT_TARGET_FREE_GB", &raw)?;
        }
        if let Some(raw) = lookup("FUS_SYSTEM_VOLUME") {
            self.selection.system_volume = PathBuf::from(raw);
        }

        // volumes
        if let Some(raw) = lookup("FUS_VOLUMES_DIR") {
            self.volumes.volumes_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("FUS_PREFERRED_VOLUME") {
            self.volumes.preferred_volume = Some(raw);
        }

        // backup
        if let Some(raw) = lookup("FUS_BACKUP_DRY_RUN") {
            self.backup.dry_run = parse_env_bool("FUS_BACKUP_DRY_RUN", &raw)?;
        }
        if let Some(raw) = lookup("FUS_REQUIRE_ROOT") {
            self.backup.require_root = parse_env_bool("FUS_REQUIRE_ROOT", &raw)?;
        }
        if let Some(raw) = lookup("FUS_BACKUP_VERIFY_COPIES") {
            self.backup.verify_copies = parse_env_bool("FUS_BACKUP_VERIFY_COPIES", &raw)?;
        }

        // restore
        if let Some(raw) = lookup("FUS_RESTORE_RECENT_WINDOW_HOURS") {
            self.restore.recent_window_hours =
                parse_env_u64("FUS_RESTORE_RECENT_WINDOW_HOURS", &raw)?;
        }
        if let Some(raw) = lookup("FUS_RESTORE_CLEAR_QUARANTINE") {
            self.restore.clear_quarantine =
                parse_env_bool("FUS_RESTORE_CLEAR_QUARANTINE", &raw)?;
        }

        // snapshot
        if let Some(raw) = lookup("FUS_SNAPSHOT_ENABLED") {
            self.snapshot.enabled = parse_env_bool("FUS_SNAPSHOT_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("FUS_SNAPSHOT_TMUTIL_PATH") {
            self.snapshot.tmutil_path = PathBuf::from(raw);
        }

        // paths
        if let Some(raw) = lookup("FUS_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Strip trailing slashes so directory comparisons are exact.
    fn normalize_paths(&mut self) {
        for path in [
            &mut self.inventory.applications_dir,
            &mut self.volumes.volumes_dir,
            &mut self.selection.system_volume,
        ] {
            let s = path.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    /// Reject values no flow can work with.
    pub fn validate(&self) -> Result<()> {
        let ext = &self.inventory.bundle_extension;
        if ext.len() < 2 || !ext.starts_with('.') || ext.contains('/') {
            return Err(FusError::InvalidConfig {
                details: format!(
                    "inventory.bundle_extension must look like \".app\", got {ext:?}"
                ),
            });
        }

        for pattern in &self.inventory.protected_apps {
            crate::inventory::protection::validate_glob_pattern(pattern)?;
        }

        let target = self.selection.default_target_free_gb;
        if !target.is_finite() || target < 0.0 {
            return Err(FusError::InvalidConfig {
                details: format!("selection.default_target_free_gb must be >= 0, got {target}"),
            });
        }

        let prefix = &self.backup.folder_prefix;
        if prefix.is_empty() || prefix.contains('/') {
            return Err(FusError::InvalidConfig {
                details: format!(
                    "backup.folder_prefix must be a non-empty file name, got {prefix:?}"
                ),
            });
        }

        if !(0.0..=100.0).contains(&self.backup.size_tolerance_pct) {
            return Err(FusError::InvalidConfig {
                details: format!(
                    "backup.size_tolerance_pct must be in [0, 100], got {}",
                    self.backup.size_tolerance_pct
                ),
            });
        }

        if self.restore.recent_window_hours == 0 {
            return Err(FusError::InvalidConfig {
                details: "restore.recent_window_hours must be > 0".to_string(),
            });
        }

        if self.restore.executable_subdir.is_absolute() {
            return Err(FusError::InvalidConfig {
                details: "restore.executable_subdir must be relative to the bundle".to_string(),
            });
        }

        if self.snapshot.max_verify_attempts == 0 {
            return Err(FusError::InvalidConfig {
                details: "snapshot.max_verify_attempts must be >= 1".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_f64(name: &str, raw: &str) -> Result<f64> {
    raw.trim().parse::<f64>().map_err(|error| FusError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| FusError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim().parse::<bool>().map_err(|error| FusError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
