//! Application inventory: bundle discovery, sizing, protection, integrity.

pub mod bundle;
pub mod protection;
pub mod scan;

pub use bundle::{ApplicationRecord, ScanWarning};
pub use protection::ProtectionRegistry;
pub use scan::{ApplicationInventory, InventoryScan, ProtectedBundle};
