//! FUS-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, FusError>;

/// Top-level error type for free_up_space.
#[derive(Debug, Error)]
pub enum FusError {
    #[error("[FUS-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[FUS-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[FUS-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[FUS-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[FUS-1102] insufficient privileges: {details}")]
    PrivilegesRequired { details: String },

    #[error("[FUS-1201] invalid free-space target: {details}")]
    InvalidTarget { details: String },

    #[error("[FUS-2001] filesystem stats failure for {path}: {details}")]
    FsStats { path: PathBuf, details: String },

    #[error("[FUS-2003] {path} is protected: {reason}")]
    Protected { path: PathBuf, reason: String },

    #[error("[FUS-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[FUS-2201] backup folder not found: {path}")]
    BackupNotFound { path: PathBuf },

    #[error("[FUS-2202] destination already exists: {path}")]
    DestinationExists { path: PathBuf },

    #[error("[FUS-2203] copy verification failed for {path}: {details}")]
    CopyVerification { path: PathBuf, details: String },

    #[error("[FUS-2301] snapshot facility unavailable: {details}")]
    SnapshotUnavailable { details: String },

    #[error("[FUS-2302] {path} is not captured in the latest snapshot")]
    NotInSnapshot { path: PathBuf },

    #[error("[FUS-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[FUS-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[FUS-3003] external tool `{tool}` failed: {details}")]
    ExternalTool { tool: &'static str, details: String },

    #[error("[FUS-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl FusError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "FUS-1001",
            Self::MissingConfig { .. } => "FUS-1002",
            Self::ConfigParse { .. } => "FUS-1003",
            Self::UnsupportedPlatform { .. } => "FUS-1101",
            Self::PrivilegesRequired { .. } => "FUS-1102",
            Self::InvalidTarget { .. } => "FUS-1201",
            Self::FsStats { .. } => "FUS-2001",
            Self::Protected { .. } => "FUS-2003",
            Self::Serialization { .. } => "FUS-2101",
            Self::BackupNotFound { .. } => "FUS-2201",
            Self::DestinationExists { .. } => "FUS-2202",
            Self::CopyVerification { .. } => "FUS-2203",
            Self::SnapshotUnavailable { .. } => "FUS-2301",
            Self::NotInSnapshot { .. } => "FUS-2302",
            Self::PermissionDenied { .. } => "FUS-3001",
            Self::Io { .. } => "FUS-3002",
            Self::ExternalTool { .. } => "FUS-3003",
            Self::Runtime { .. } => "FUS-3900",
        }
    }

    /// Convenience constructor for IO errors with a known path.
    ///
    /// `PermissionDenied` is lifted into its own variant so callers can report
    /// it without inspecting the source error.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied {
                path: path.as_ref().to_path_buf(),
            };
        }
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for FusError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for FusError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<FusError> {
        vec![
            FusError::InvalidConfig {
                details: String::new(),
            },
            FusError::MissingConfig {
                path: PathBuf::new(),
            },
            FusError::ConfigParse {
                context: "",
                details: String::new(),
            },
            FusError::UnsupportedPlatform {
                details: String::new(),
            },
            FusError::InvalidTarget {
                details: String::new(),
            },
            FusError::FsStats {
                path: PathBuf::new(),
                details: String::new(),
            },
            FusError::Protected {
                path: PathBuf::new(),
                reason: String::new(),
            },
            FusError::Serialization {
                context: "",
                details: String::new(),
            },
            FusError::BackupNotFound {
                path: PathBuf::new(),
            },
            FusError::DestinationExists {
                path: PathBuf::new(),
            },
            FusError::CopyVerification {
                path: PathBuf::new(),
                details: String::new(),
            },
            FusError::SnapshotUnavailable {
                details: String::new(),
            },
            FusError::NotInSnapshot {
                path: PathBuf::new(),
            },
            FusError::PermissionDenied {
                path: PathBuf::new(),
            },
            FusError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            FusError::ExternalTool {
                tool: "",
                details: String::new(),
            },
            FusError::Runtime {
                details: String::new(),
            },
            FusError::PrivilegesRequired {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(FusError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_fus_prefix() {
        for err in &all_variants() {
            assert!(
                err.code().starts_with("FUS-"),
                "code {} must start with FUS-",
                err.code()
            );
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = FusError::InvalidTarget {
            details: "target must not be negative".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("FUS-1201"), "display should contain code: {msg}");
        assert!(msg.contains("negative"), "display should contain details: {msg}");
    }

    #[test]
    fn io_constructor_lifts_permission_denied() {
        let err = FusError::io(
            "/Applications/Locked.app",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.code(), "FUS-3001");
        assert!(err.to_string().contains("Locked.app"));

        let err = FusError::io(
            "/tmp/test.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "FUS-3002");
        assert!(err.to_string().contains("/tmp/test.txt"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: FusError = json_err.into();
        assert_eq!(err.code(), "FUS-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: FusError = toml_err.into();
        assert_eq!(err.code(), "FUS-1003");
    }
}
