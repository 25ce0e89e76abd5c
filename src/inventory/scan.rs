//! Enumerate application bundles in a directory and size them.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{FusError, Result};
use crate::core::paths::{bundle_stem, has_bundle_extension};
use crate::inventory::bundle::{ApplicationRecord, ScanWarning, bundle_size};
use crate::inventory::protection::ProtectionRegistry;

/// A bundle left out of the scan because it is protected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectedBundle {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of one inventory pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InventoryScan {
    /// Sizable bundles in file-name order.
    pub records: Vec<ApplicationRecord>,
    pub warnings: Vec<ScanWarning>,
    pub protected: Vec<ProtectedBundle>,
}

impl InventoryScan {
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read-only enumerator of application bundles.
#[derive(Debug, Clone)]
pub struct ApplicationInventory {
    bundle_extension: String,
    protection: ProtectionRegistry,
}

impl ApplicationInventory {
    pub fn new(bundle_extension: impl Into<String>, protection: ProtectionRegistry) -> Self {
        Self {
            bundle_extension: bundle_extension.into(),
            protection,
        }
    }

    /// Inventory that ignores protection, for re-scanning backup folders.
    pub fn unprotected(bundle_extension: impl Into<String>) -> Self {
        Self::new(bundle_extension, ProtectionRegistry::empty())
    }

    pub fn bundle_extension(&self) -> &str {
        &self.bundle_extension
    }

    /// Scan the immediate children of `root`.
    ///
    /// Symlinked bundles are ignored. A bundle that cannot be read is skipped
    /// with a warning; a root that cannot be read is an error.
    pub fn scan(&self, root: &Path) -> Result<InventoryScan> {
        let entries = fs::read_dir(root).map_err(|err| FusError::io(root, err))?;

        let mut candidates: Vec<PathBuf> = Vec::new();
        let mut scan = InventoryScan::default();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    scan.warnings.push(ScanWarning {
                        path: root.to_path_buf(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            let path = entry.path();
            if !has_bundle_extension(&path, &self.bundle_extension) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                scan.warnings.push(ScanWarning {
                    path,
                    reason: "cannot determine file type".to_string(),
                });
                continue;
            };
            if file_type.is_dir() {
                candidates.push(path);
            }
        }

        candidates.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        for path in candidates {
            if let Some(reason) = self.protection.protection_reason(&path) {
                scan.protected.push(ProtectedBundle { path, reason });
                continue;
            }
            match bundle_size(&path) {
                Ok((size_bytes, warnings)) => {
                    scan.warnings.extend(warnings);
                    scan.records.push(ApplicationRecord {
                        name: bundle_stem(&path, &self.bundle_extension),
                        path,
                        size_bytes,
                    });
                }
                Err(err) => scan.warnings.push(ScanWarning {
                    path,
                    reason: err.to_string(),
                }),
            }
        }

        Ok(scan)
    }
}
