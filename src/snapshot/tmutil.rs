//! `tmutil`-backed snapshot facility.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::core::config::SnapshotConfig;
use crate::core::errors::{FusError, Result};
use crate::platform::pal::run_tool;
use crate::snapshot::SnapshotFacility;

const TOOL: &str = "tmutil";

/// Talks to Time Machine through the `tmutil` binary.
#[derive(Debug, Clone)]
pub struct TmutilFacility {
    program: PathBuf,
}

impl TmutilFacility {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `None` when snapshots are disabled or the binary is absent.
    pub fn from_config(config: &SnapshotConfig) -> Option<Self> {
        (config.enabled && config.tmutil_path.is_file()).then(|| Self::new(&config.tmutil_path))
    }

    fn run(&self, args: &[&OsStr]) -> Result<String> {
        run_tool(TOOL, &self.program, args)
    }
}

impl SnapshotFacility for TmutilFacility {
    fn destination(&self) -> Result<Option<String>> {
        match self.run(&[OsStr::new("destinationinfo")]) {
            Ok(out) => Ok(parse_destination_info(&out)),
            Err(FusError::ExternalTool { details, .. })
                if details.contains("No destinations configured") =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let out = self.run(&[OsStr::new("listbackups")])?;
        Ok(parse_backup_list(&out))
    }

    fn latest_backup(&self) -> Result<Option<PathBuf>> {
        let out = self.run(&[OsStr::new("latestbackup")])?;
        Ok(parse_backup_list(&out).pop())
    }

    fn restore(&self, source: &Path, destination: &Path) -> Result<()> {
        self.run(&[
            OsStr::new("restore"),
            source.as_os_str(),
            destination.as_os_str(),
        ])
        .map(|_| ())
    }
}

/// Destination name from `tmutil destinationinfo`; mount point preferred.
pub fn parse_destination_info(output: &str) -> Option<String> {
    if output.contains("No destinations configured") {
        return None;
    }
    let field = |key: &str| {
        output.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key && !v.trim().is_empty()).then(|| v.trim().to_string())
        })
    };
    field("Mount Point").or_else(|| field("Name"))
}

/// One absolute backup path per line; anything else is noise.
pub fn parse_backup_list(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}
