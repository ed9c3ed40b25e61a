//! Versioned snapshot of the file walk, written atomically.

use super::{FileStatus, FileSystemEntry};
use crate::job::store::write_json_atomic;
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub processed_files: Vec<String>,
    pub processed_dirs: Vec<String>,
    pub dir_queue: Vec<String>,
    pub pending: Vec<FileSystemEntry>,
    pub large: Vec<FileSystemEntry>,
    pub retry: Vec<FileSystemEntry>,
    #[serde(default)]
    pub failed_files: Vec<String>,
    #[serde(default)]
    pub skipped_files: Vec<String>,
    pub total_size: u64,
    pub batch_size: usize,
    #[serde(default)]
    pub discovered_files: usize,
}

pub fn checkpoint_path(work_dir: &Path) -> PathBuf {
    work_dir.join(CHECKPOINT_FILE)
}

impl Checkpoint {
    pub fn capture(status: &FileStatus) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            processed_files: status.processed_files.clone(),
            processed_dirs: status.processed_dirs.clone(),
            dir_queue: status.dir_queue.iter().cloned().collect(),
            pending: status.pending.iter().cloned().collect(),
            large: status.large.iter().cloned().collect(),
            retry: status.retry.iter().cloned().collect(),
            failed_files: status.failed_files.clone(),
            skipped_files: status.skipped_files.clone(),
            total_size: status.total_size,
            batch_size: status.batch_size,
            discovered_files: status.discovered_files,
        }
    }

    pub fn save(&self, work_dir: &Path) -> Result<()> {
        write_json_atomic(&checkpoint_path(work_dir), self)
    }

    /// Load the checkpoint in `work_dir`, if one was written.
    pub fn load(work_dir: &Path) -> Result<Option<Self>> {
        let path = checkpoint_path(work_dir);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&data)?;
        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(EngineError::UnsupportedSchema {
                found: checkpoint.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        Ok(Some(checkpoint))
    }
}
