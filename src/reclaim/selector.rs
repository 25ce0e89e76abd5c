//! Largest-first selection of bundles to reach a free-space target.
//!
//! Greedy, not subset-sum optimal: the result is the shortest prefix of the
//! size-descending order whose total reaches the target. Overshoot is not
//! minimized.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::errors::{FusError, Result};
use crate::inventory::ApplicationRecord;

pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionResult {
    /// Chosen bundles, largest first. Equal sizes keep scan order.
    pub chosen: Vec<ApplicationRecord>,
    pub total_bytes: u64,
    pub target_bytes: u64,
    /// False when every record together still falls short of the target.
    pub target_reachable: bool,
}

impl SelectionResult {
    pub fn is_empty(&self) -> bool {
        self.chosen.is_empty()
    }

    /// Bytes still missing after moving everything chosen.
    pub fn shortfall_bytes(&self) -> u64 {
        self.target_bytes.saturating_sub(self.total_bytes)
    }
}

/// Pick the shortest size-descending prefix of `records` reaching `target_bytes`.
pub fn select(records: &[ApplicationRecord], target_bytes: u64) -> SelectionResult {
    let mut ordered: Vec<&ApplicationRecord> = records.iter().collect();
    // sort_by is stable, so ties stay in scan order.
    ordered.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

    let mut chosen = Vec::new();
    let mut total_bytes: u64 = 0;
    for record in ordered {
        if total_bytes >= target_bytes {
            break;
        }
        total_bytes = total_bytes.saturating_add(record.size_bytes);
        chosen.push(record.clone());
    }

    SelectionResult {
        chosen,
        total_bytes,
        target_bytes,
        target_reachable: total_bytes >= target_bytes,
    }
}

/// Amount to free so that `current_free` grows to `target_free`.
pub fn space_to_free(target_free: u64, current_free: u64) -> u64 {
    target_free.saturating_sub(current_free)
}

/// Convert a user-supplied gigabyte figure to bytes, rejecting nonsense.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn parse_target_gb(gb: f64) -> Result<u64> {
    if !gb.is_finite() {
        return Err(FusError::InvalidTarget {
            details: format!("{gb} is not a number of gigabytes"),
        });
    }
    if gb < 0.0 {
        return Err(FusError::InvalidTarget {
            details: format!("target must not be negative, got {gb} GB"),
        });
    }
    let bytes = gb * BYTES_PER_GB as f64;
    if bytes >= u64::MAX as f64 {
        return Err(FusError::InvalidTarget {
            details: format!("target {gb} GB is too large"),
        });
    }
    Ok(bytes.round() as u64)
}

#[allow(clippy::cast_precision_loss)]
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB as f64
}
