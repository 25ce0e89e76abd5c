//! Explain why a bundle could not be moved.
//!
//! Collects ownership, mode bits, BSD flags, extended attributes and the
//! processes holding files open. Every check is best-effort: a missing tool
//! leaves its field empty.

#![allow(missing_docs)]

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::platform::pal::run_tool;

/// Processes listed per bundle.
pub const MAX_HOLDERS: usize = 5;

/// External programs the diagnosis shells out to.
#[derive(Debug, Clone)]
pub struct DiagnoseTools {
    pub ls: PathBuf,
    pub xattr: PathBuf,
    pub lsof: PathBuf,
}

impl Default for DiagnoseTools {
    fn default() -> Self {
        let lsof = if cfg!(target_os = "macos") {
            "/usr/sbin/lsof"
        } else {
            "/usr/bin/lsof"
        };
        Self {
            ls: PathBuf::from("/bin/ls"),
            xattr: PathBuf::from("/usr/bin/xattr"),
            lsof: PathBuf::from(lsof),
        }
    }
}

/// What is known about a bundle that resisted a move.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtectionDiagnosis {
    pub path: PathBuf,
    pub owner_uid: Option<u32>,
    pub group_gid: Option<u32>,
    /// Permission bits in octal, e.g. `755`.
    pub mode: Option<String>,
    /// BSD file flags as printed by `ls -ldO`.
    pub flags: Option<String>,
    /// System Integrity Protection marks the bundle `restricted`.
    pub restricted: bool,
    pub extended_attributes: Vec<String>,
    pub holders: Vec<String>,
}

impl ProtectionDiagnosis {
    /// Short hints for the person moving the bundle by hand.
    pub fn hints(&self) -> Vec<&'static str> {
        let mut hints = Vec::new();
        if self.restricted {
            hints.push("protected by System Integrity Protection; it cannot be moved");
        }
        if !self.holders.is_empty() {
            hints.push("quit the processes holding it open, then retry");
        }
        if self.owner_uid == Some(0) {
            hints.push("owned by root; moving it needs sudo");
        }
        hints
    }
}

impl fmt::Display for ProtectionDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Diagnosis for {}", self.path.display())?;
        if let (Some(uid), Some(gid)) = (self.owner_uid, self.group_gid) {
            writeln!(f, "  owner: uid {uid}, gid {gid}")?;
        }
        if let Some(mode) = &self.mode {
            writeln!(f, "  mode: {mode}")?;
        }
        if let Some(flags) = &self.flags {
            writeln!(f, "  flags: {flags}")?;
        }
        if !self.extended_attributes.is_empty() {
            writeln!(f, "  extended attributes:")?;
            for attr in &self.extended_attributes {
                writeln!(f, "    {attr}")?;
            }
        }
        if !self.holders.is_empty() {
            writeln!(f, "  held open by:")?;
            for holder in &self.holders {
                writeln!(f, "    {holder}")?;
            }
        }
        for hint in self.hints() {
            writeln!(f, "  hint: {hint}")?;
        }
        Ok(())
    }
}

/// Inspect `path` with the given tools.
pub fn diagnose_protection(path: &Path, tools: &DiagnoseTools) -> ProtectionDiagnosis {
    let mut diagnosis = ProtectionDiagnosis {
        path: path.to_path_buf(),
        ..ProtectionDiagnosis::default()
    };

    #[cfg(unix)]
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        use std::os::unix::fs::MetadataExt;
        diagnosis.owner_uid = Some(meta.uid());
        diagnosis.group_gid = Some(meta.gid());
        diagnosis.mode = Some(format!("{:o}", meta.mode() & 0o7777));
    }

    if cfg!(target_os = "macos") {
        if let Ok(listing) = run_tool("ls", &tools.ls, &[OsStr::new("-ldO"), path.as_os_str()]) {
            diagnosis.flags = parse_ls_flags(&listing);
            diagnosis.restricted = is_restricted(&listing);
        }
        if let Ok(attrs) = run_tool("xattr", &tools.xattr, &[OsStr::new("-l"), path.as_os_str()]) {
            diagnosis.extended_attributes = attrs
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    // lsof exits 1 when nothing holds the path.
    if tools.lsof.is_file()
        && let Ok(listing) = run_tool("lsof", &tools.lsof, &[OsStr::new("+D"), path.as_os_str()])
    {
        diagnosis.holders = parse_lsof_holders(&listing);
    }

    diagnosis
}

/// Holder lines from `lsof` output, header dropped, first few kept.
pub fn parse_lsof_holders(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(MAX_HOLDERS)
        .map(str::to_string)
        .collect()
}

/// Whether an `ls -lO` listing carries the `restricted` flag.
pub fn is_restricted(listing: &str) -> bool {
    listing
        .split_whitespace()
        .any(|field| field.split(',').any(|flag| flag == "restricted"))
}

/// The flags column of `ls -ldO`: the field after the group. `-` means none.
fn parse_ls_flags(listing: &str) -> Option<String> {
    let line = listing.lines().next()?;
    let flags = line.split_whitespace().nth(4)?;
    if flags == "-" || flags.chars().all(|c| c.is_ascii_digit()) {
        None
    } else {
        Some(flags.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lsof_header_is_skipped_and_holders_capped() {
        let mut output = String::from("COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\n");
        for pid in 100..110 {
            output.push_str(&format!("Slack {pid} me txt REG 1,4 100 7 /Applications/Slack.app\n"));
        }
        let holders = parse_lsof_holders(&output);
        assert_eq!(holders.len(), MAX_HOLDERS);
        assert!(holders[0].starts_with("Slack 100"));
        assert!(parse_lsof_holders("COMMAND PID USER\n").is_empty());
        assert!(parse_lsof_holders("").is_empty());
    }

    #[test]
    fn restricted_flag_detection() {
        let sip = "drwxr-xr-x  3 root  wheel  restricted,compressed  96 Jan  1 00:00 /Applications/Safari.app";
        assert!(is_restricted(sip));
        assert_eq!(parse_ls_flags(sip).as_deref(), Some("restricted,compressed"));

        let plain = "drwxr-xr-x  3 me  staff  -  96 Jan  1 00:00 /Applications/Notes2.app";
        assert!(!is_restricted(plain));
        assert_eq!(parse_ls_flags(plain), None);
        assert!(!is_restricted("drwxr-xr-x 3 me staff - 96 /Applications/unrestricted.app"));
    }

    #[test]
    fn hints_follow_findings() {
        let clean = ProtectionDiagnosis::default();
        assert!(clean.hints().is_empty());

        let stuck = ProtectionDiagnosis {
            owner_uid: Some(0),
            restricted: true,
            holders: vec!["Slack 100 me txt".to_string()],
            ..ProtectionDiagnosis::default()
        };
        assert_eq!(stuck.hints().len(), 3);
        let text = stuck.to_string();
        assert!(text.contains("held open by:"));
        assert!(text.contains("needs sudo"));
    }

    #[cfg(unix)]
    #[test]
    fn diagnosis_reads_ownership_and_mode() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("Locked.app");
        std::fs::create_dir(&bundle).unwrap();
        std::fs::set_permissions(&bundle, std::fs::Permissions::from_mode(0o750)).unwrap();

        let tools = DiagnoseTools {
            lsof: tmp.path().join("no-lsof"),
            ..DiagnoseTools::default()
        };
        let diagnosis = diagnose_protection(&bundle, &tools);
        let meta = std::fs::metadata(&bundle).unwrap();
        assert_eq!(diagnosis.owner_uid, Some(meta.uid()));
        assert_eq!(diagnosis.group_gid, Some(meta.gid()));
        assert_eq!(diagnosis.mode.as_deref(), Some("750"));
        assert!(diagnosis.holders.is_empty());
    }

    #[test]
    fn missing_path_yields_empty_diagnosis() {
        let tmp = TempDir::new().unwrap();
        let tools = DiagnoseTools {
            lsof: tmp.path().join("no-lsof"),
            ..DiagnoseTools::default()
        };
        let diagnosis = diagnose_protection(&tmp.path().join("Gone.app"), &tools);
        assert_eq!(diagnosis.owner_uid, None);
        assert_eq!(diagnosis.mode, None);
    }
}
