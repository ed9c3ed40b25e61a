//! Status sink for backup jobs.
//!
//! The orchestrator saves the full job after every step and loads it back on
//! the next call; nothing else carries state between calls.

use super::BackupJob;
use crate::utils::{EngineError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait JobStore: Send {
    fn save(&mut self, job: &BackupJob) -> Result<()>;

    fn load(&self, id: &str) -> Result<BackupJob>;

    /// Jobs that have not reached a terminal phase.
    fn list_active(&self) -> Result<Vec<BackupJob>>;
}

/// Keeps jobs in memory. Used by tests and one-shot runs.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, BackupJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn save(&mut self, job: &BackupJob) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| EngineError::InvalidState("job store lock poisoned".into()))?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<BackupJob> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| EngineError::InvalidState("job store lock poisoned".into()))?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    fn list_active(&self) -> Result<Vec<BackupJob>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| EngineError::InvalidState("job store lock poisoned".into()))?;
        Ok(jobs.values().filter(|j| !j.is_terminal()).cloned().collect())
    }
}

/// One JSON document per job under a status directory.
///
/// Writes go to a temporary file that is renamed over the old status, so an
/// interrupted save leaves the previous status intact.
pub struct JsonFileJobStore {
    dir: PathBuf,
}

impl JsonFileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(EngineError::JobNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl JobStore for JsonFileJobStore {
    fn save(&mut self, job: &BackupJob) -> Result<()> {
        let path = self.path_for(&job.id)?;
        write_json_atomic(&path, job)
    }

    fn load(&self, id: &str) -> Result<BackupJob> {
        let path = self.path_for(id)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::JobNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let job: BackupJob = serde_json::from_slice(&data)?;
        job.check_schema()?;
        Ok(job)
    }

    fn list_active(&self) -> Result<Vec<BackupJob>> {
        let mut active = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else { continue };
            match serde_json::from_slice::<BackupJob>(&data) {
                Ok(job) if !job.is_terminal() => active.push(job),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), "unreadable job status: {}", e),
            }
        }
        Ok(active)
    }
}
