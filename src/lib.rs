#![forbid(unsafe_code)]

//! Free Up Space (fus): reclaim system-drive space by relocating large
//! application bundles to a removable drive, and bring them back later.
//!
//! The decision layer is plain library code:
//! 1. **Inventory** finds installed bundles and sizes them
//! 2. **Selection** picks the largest bundles that reach a free-space goal
//! 3. **Ledger** moves them into a timestamped backup folder
//! 4. **Restore** moves them back and resets their permissions
//!
//! A snapshot backup facility (Time Machine) can stand in for the removable
//! drive: bundles confirmed in the latest backup are deleted locally instead.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use free_up_space::prelude::*;
//! ```

pub mod prelude;

#[cfg(feature = "cli")]
pub mod cli;
pub mod core;
pub mod inventory;
pub mod logger;
pub mod platform;
pub mod reclaim;
pub mod snapshot;
