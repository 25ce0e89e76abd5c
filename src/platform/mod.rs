//! Platform abstraction layer and trust reset.

pub mod diagnose;
pub mod pal;
pub mod trust;

pub use diagnose::{DiagnoseTools, ProtectionDiagnosis, diagnose_protection};
pub use pal::{
    FsStats, MockPlatform, Platform, PrivilegeCheck, UnixPlatform, Volume, can_modify,
    detect_platform, running_as_root,
};
pub use trust::{PermissionIssue, TrustReport, TrustReset, UnixTrustReset};
