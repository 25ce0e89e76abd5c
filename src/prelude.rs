//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use free_up_space::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{FusError, Result};

// Platform
pub use crate::platform::pal::{FsStats, Platform, Volume, detect_platform};
pub use crate::platform::trust::{TrustReport, TrustReset, UnixTrustReset};

// Inventory
pub use crate::inventory::{ApplicationInventory, ApplicationRecord, ProtectionRegistry};

// Reclaim
pub use crate::reclaim::{
    BackupLedger, BundleMover, CommitReport, FsMover, RestoreReport, RestoreResolver,
    SelectionResult, SmartRestore, select, space_to_free,
};

// Snapshot
pub use crate::snapshot::{SnapshotFacility, SnapshotStatus, SnapshotStrategy, TmutilFacility};

// Logging
pub use crate::logger::ActivityLog;
