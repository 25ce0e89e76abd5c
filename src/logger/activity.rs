//! Activity log handle passed to the relocation, restore and snapshot flows.

#![allow(missing_docs)]

use std::path::Path;

use crate::core::config::Config;
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Records what fus did to which bundle. A disabled log drops everything.
pub struct ActivityLog {
    writer: Option<JsonlWriter>,
    recorded: usize,
}

impl ActivityLog {
    pub fn open(path: &Path) -> Self {
        Self {
            writer: Some(JsonlWriter::open(JsonlConfig::new(path))),
            recorded: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::open(&config.paths.activity_log)
    }

    pub fn disabled() -> Self {
        Self {
            writer: None,
            recorded: 0,
        }
    }

    pub fn record(&mut self, entry: &LogEntry) {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_entry(entry);
            self.recorded += 1;
        }
    }

    /// Shorthand for a one-bundle event with a start path.
    pub fn bundle_event(&mut self, event: EventType, app: &str, path: &Path) {
        let severity = match event {
            EventType::AppMoveFailed | EventType::RestoreFailed | EventType::Error => {
                Severity::Error
            }
            _ => Severity::Info,
        };
        self.record(&LogEntry::new(event, severity).with_app(app).with_path(path));
    }

    /// Entries written through this handle.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog")
            .field("state", &self.writer.as_ref().map_or("disabled", JsonlWriter::state))
            .field("recorded", &self.recorded)
            .finish()
    }
}
