//! Activity logging: append-only JSONL with rotation and graceful degradation.

pub mod activity;
pub mod jsonl;

pub use activity::ActivityLog;
pub use jsonl::{EventType, LogEntry, Severity};
