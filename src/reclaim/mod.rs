//! Space reclamation: selection, relocation, restore.

pub mod ledger;
pub mod mover;
pub mod restore;
pub mod selector;
pub mod smart;

pub use ledger::{
    BackupFolder, BackupLedger, CommitReport, ItemOutcome, ItemReport, list_backup_folders,
};
pub use mover::{BundleMover, FsMover, MoveMethod};
pub use restore::{RestoreOutcome, RestoreReport, RestoreResolver, RestoreSkip};
pub use selector::{SelectionResult, parse_target_gb, select, space_to_free};
pub use smart::{SmartRestore, recently_modified};
