//! Backup history: the record of successful backups.

use super::JobKind;
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Job id; at most one entry per job
    pub id: String,
    pub kind: JobKind,
    /// Archive file name
    pub file: String,
    pub size: u64,
    pub destinations: Vec<String>,
    pub locked: bool,
    pub schedule: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Add destinations not yet present, keeping the original order.
    pub fn merge_destinations(&mut self, destinations: &[String]) -> bool {
        let mut changed = false;
        for dest in destinations {
            if !self.destinations.contains(dest) {
                self.destinations.push(dest.clone());
                changed = true;
            }
        }
        changed
    }
}

pub trait HistoryStore: Send {
    fn append(&mut self, entry: HistoryEntry) -> Result<()>;

    fn exists(&self, id: &str) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<HistoryEntry>>;

    /// Replace the entry with the same id.
    fn update(&mut self, entry: HistoryEntry) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

fn poisoned() -> EngineError {
    EngineError::InvalidState("history store lock poisoned".into())
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&mut self, entry: HistoryEntry) -> Result<()> {
        self.entries.lock().map_err(|_| poisoned())?.push(entry);
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .any(|e| e.id == id))
    }

    fn get(&self, id: &str) -> Result<Option<HistoryEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    fn update(&mut self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                *existing = entry;
                Ok(())
            }
            None => Err(EngineError::JobNotFound(entry.id)),
        }
    }
}
