//! Manifest written as the first entry of every archive.

use crate::job::{BackupJob, JobIssue, JobKind, TableSummary};
use crate::utils::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: u32 = 1;

/// Entry name of the manifest inside the archive.
pub const MANIFEST_NAME: &str = "backup-manifest.json";

/// Serialized as `backup-manifest.json` at the archive root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub job_id: String,
    pub kind: JobKind,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub tables: Vec<TableSummary>,
    #[serde(default)]
    pub failed_tables: Vec<String>,
    pub files: FileCounts,
    pub database_bytes: u64,
    pub file_bytes: u64,
    /// Recoverable issues met while producing this backup
    #[serde(default)]
    pub errors: Vec<JobIssue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCounts {
    pub backed_up: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl BackupManifest {
    pub fn for_job(job: &BackupJob) -> Self {
        Self {
            version: MANIFEST_VERSION,
            job_id: job.id.clone(),
            kind: job.kind,
            host: local_hostname(),
            created_at: job.created_at,
            duration_secs: (Utc::now() - job.created_at).num_milliseconds().max(0) as f64 / 1000.0,
            tables: job.summary.tables.clone(),
            failed_tables: job.summary.failed_tables.clone(),
            files: FileCounts {
                backed_up: job.metrics.files_backed_up,
                failed: job.metrics.files_failed,
                skipped: job.metrics.files_skipped,
            },
            database_bytes: job.metrics.database_bytes,
            file_bytes: job.metrics.file_bytes,
            errors: job.errors.clone(),
        }
    }

    /// Short id used in the archive name.
    pub fn short_id(&self) -> &str {
        self.job_id.get(..8).unwrap_or(&self.job_id)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use std::path::Path;

    #[test]
    fn test_manifest_reflects_job() {
        let mut job = BackupJob::new(&JobRequest::new(JobKind::Full), Path::new("/tmp"));
        job.summary.tables.push(TableSummary {
            name: "wp_posts".into(),
            rows: 12,
            file: "database/wp_posts.sql".into(),
        });
        job.metrics.files_backed_up = 3;
        job.metrics.files_skipped = 1;

        let manifest = BackupManifest::for_job(&job);
        assert_eq!(manifest.job_id, job.id);
        assert_eq!(manifest.short_id().len(), 8);
        assert_eq!(manifest.tables[0].rows, 12);
        assert_eq!(manifest.files.backed_up, 3);
        assert!(!manifest.host.is_empty());

        let json: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "full");
        assert_eq!(json["files"]["skipped"], 1);
    }
}
