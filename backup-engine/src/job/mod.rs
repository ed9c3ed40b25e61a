//! The `BackupJob` aggregate.
//!
//! A job is persisted after every step and is the only continuation token
//! between calls: everything an engine needs to resume lives in
//! [`BackupJob::engine_state`].

pub mod history;
pub mod store;

use crate::database::DatabaseStatus;
use crate::files::FileStatus;
use crate::orchestrator::FinalizeState;
use crate::storage::DestinationResult;
use crate::utils::{EngineError, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use history::{HistoryEntry, HistoryStore, MemoryHistoryStore};
pub use store::{JobStore, JsonFileJobStore, MemoryJobStore};

/// Current version of the persisted status schema.
pub const STATUS_SCHEMA_VERSION: u32 = 1;

/// Destination id that every successful archive implicitly satisfies.
pub const LOCAL_DESTINATION: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Database,
    Files,
    Full,
}

impl JobKind {
    pub fn includes_database(self) -> bool {
        matches!(self, JobKind::Database | JobKind::Full)
    }

    pub fn includes_files(self) -> bool {
        matches!(self, JobKind::Files | JobKind::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Database => "database",
            JobKind::Files => "files",
            JobKind::Full => "full",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" | "db" => Ok(JobKind::Database),
            "files" => Ok(JobKind::Files),
            "full" => Ok(JobKind::Full),
            other => Err(EngineError::Config(format!("unknown job kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Database,
    Files,
    Finalize,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled)
    }
}

/// One recorded problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobIssue {
    pub severity: Severity,
    /// What the issue is about: a table, a file path, a destination, a phase
    pub context: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobIssue {
    pub fn new(severity: Severity, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            context: context.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn describe(&self) -> String {
        if self.context.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", self.context, self.message)
        }
    }
}

/// Recoverable and critical issues collected by an engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueLog {
    #[serde(default)]
    pub errors: Vec<JobIssue>,
    #[serde(default)]
    pub critical_errors: Vec<JobIssue>,
}

impl IssueLog {
    pub fn recoverable(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.errors
            .push(JobIssue::new(Severity::Recoverable, context, message));
    }

    pub fn critical(&mut self, context: impl Into<String>, message: impl Into<String>) {
        self.critical_errors
            .push(JobIssue::new(Severity::Critical, context, message));
    }

    pub fn has_critical(&self) -> bool {
        !self.critical_errors.is_empty()
    }

    /// Move every issue into `target`, leaving this log empty.
    pub fn drain_into(&mut self, target: &mut IssueLog) {
        target.errors.append(&mut self.errors);
        target.critical_errors.append(&mut self.critical_errors);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub database_bytes: u64,
    pub file_bytes: u64,
    pub rows_exported: u64,
    pub tables_exported: usize,
    pub files_backed_up: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub elapsed_secs: f64,
    pub bytes_per_second: u64,
    pub memory_high_water: u64,
}

impl JobMetrics {
    pub fn observe_memory(&mut self, used: u64) {
        self.memory_high_water = self.memory_high_water.max(used);
    }
}

/// Rows exported for one table, kept after the database phase for the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub rows: u64,
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    #[serde(default)]
    pub tables: Vec<TableSummary>,
    #[serde(default)]
    pub failed_tables: Vec<String>,
}

/// Engine-owned state of the active phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Idle,
    Database(Box<DatabaseStatus>),
    Files(Box<FileStatus>),
    Finalize(FinalizeState),
}

/// Parameters for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    /// Extra destinations on top of the configured ones
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub locked: bool,
}

impl JobRequest {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            destinations: Vec::new(),
            schedule: None,
            locked: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub schema_version: u32,
    pub id: String,
    pub kind: JobKind,
    pub phase: JobPhase,
    pub progress: u8,
    pub message: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub errors: Vec<JobIssue>,
    #[serde(default)]
    pub critical_errors: Vec<JobIssue>,
    #[serde(default)]
    pub metrics: JobMetrics,
    #[serde(default)]
    pub summary: JobSummary,
    #[serde(default)]
    pub engine_state: EngineState,
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub result_archive_path: Option<PathBuf>,
    #[serde(default)]
    pub result_size: Option<u64>,
    #[serde(default)]
    pub uploaded_to: Vec<String>,
    #[serde(default)]
    pub primary_destination: Option<String>,
    #[serde(default)]
    pub destination_results: Vec<DestinationResult>,
    pub continuation_token: String,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    pub fn new(request: &JobRequest, work_root: &std::path::Path) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let phase = if request.kind.includes_database() {
            JobPhase::Database
        } else {
            JobPhase::Files
        };
        Self {
            schema_version: STATUS_SCHEMA_VERSION,
            work_dir: work_root.join(&id),
            id,
            kind: request.kind,
            phase,
            progress: 0,
            message: "Queued".to_string(),
            errors: Vec::new(),
            critical_errors: Vec::new(),
            metrics: JobMetrics::default(),
            summary: JobSummary::default(),
            engine_state: EngineState::Idle,
            destinations: request.destinations.clone(),
            result_archive_path: None,
            result_size: None,
            uploaded_to: Vec::new(),
            primary_destination: None,
            destination_results: Vec::new(),
            continuation_token: uuid::Uuid::new_v4().simple().to_string(),
            cancel_requested: false,
            schedule: request.schedule.clone(),
            locked: request.locked,
            created_at: now,
            last_update: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn has_critical(&self) -> bool {
        !self.critical_errors.is_empty()
    }

    /// Short id used in archive names and log lines.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    /// Merge an engine's issue log into the job, keeping at most `cap`
    /// recoverable issues (critical issues are never dropped).
    pub fn absorb_issues(&mut self, issues: &mut IssueLog, cap: usize) {
        let mut drained = IssueLog::default();
        issues.drain_into(&mut drained);
        let room = cap.saturating_sub(self.errors.len());
        let dropped = drained.errors.len().saturating_sub(room);
        self.errors.extend(drained.errors.into_iter().take(room));
        if dropped > 0 {
            tracing::debug!(job_id = %self.id, dropped, "recoverable issue log full");
        }
        self.critical_errors.extend(drained.critical_errors);
    }

    /// Move the job to `Failed`, exposing its first critical error as message.
    pub fn fail(&mut self) {
        self.phase = JobPhase::Failed;
        self.engine_state = EngineState::Idle;
        self.finished_at = Some(Utc::now());
        self.message = match self.critical_errors.first() {
            Some(issue) => format!("Backup failed: {}", issue.describe()),
            None => "Backup failed".to_string(),
        };
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
        self.metrics.elapsed_secs =
            (self.last_update - self.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    }

    /// Check that a loaded job can be handled by this build.
    pub fn check_schema(&self) -> Result<(), EngineError> {
        if self.schema_version > STATUS_SCHEMA_VERSION {
            return Err(EngineError::UnsupportedSchema {
                found: self.schema_version,
                supported: STATUS_SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_new_job_phase_follows_kind() {
        let root = Path::new("/tmp/work");
        let db = BackupJob::new(&JobRequest::new(JobKind::Database), root);
        assert_eq!(db.phase, JobPhase::Database);
        let files = BackupJob::new(&JobRequest::new(JobKind::Files), root);
        assert_eq!(files.phase, JobPhase::Files);
        let full = BackupJob::new(&JobRequest::new(JobKind::Full), root);
        assert_eq!(full.phase, JobPhase::Database);
        assert_eq!(full.work_dir, root.join(&full.id));
        assert_ne!(full.continuation_token, db.continuation_token);
    }

    #[test]
    fn test_fail_uses_first_critical_error() {
        let mut job = BackupJob::new(&JobRequest::new(JobKind::Full), Path::new("/tmp"));
        job.critical_errors
            .push(JobIssue::new(Severity::Critical, "wp_posts", "cannot read structure"));
        job.critical_errors
            .push(JobIssue::new(Severity::Critical, "archive", "disk full"));
        job.fail();
        assert_eq!(job.phase, JobPhase::Failed);
        assert_eq!(job.message, "Backup failed: wp_posts: cannot read structure");
        assert_eq!(job.critical_errors.len(), 2);
    }

    #[test]
    fn test_absorb_issues_caps_recoverable_only() {
        let mut job = BackupJob::new(&JobRequest::new(JobKind::Files), Path::new("/tmp"));
        let mut log = IssueLog::default();
        for i in 0..5 {
            log.recoverable(format!("file{i}"), "unreachable");
        }
        log.critical("files", "cannot create directory");
        job.absorb_issues(&mut log, 3);
        assert_eq!(job.errors.len(), 3);
        assert_eq!(job.critical_errors.len(), 1);
        assert!(log.errors.is_empty());
    }

    #[test]
    fn test_status_round_trips_through_json() {
        let job = BackupJob::new(&JobRequest::new(JobKind::Full), Path::new("/tmp"));
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"engine\":\"idle\""));
        let back: BackupJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert!(back.check_schema().is_ok());
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut job = BackupJob::new(&JobRequest::new(JobKind::Full), Path::new("/tmp"));
        job.schema_version = STATUS_SCHEMA_VERSION + 1;
        assert!(matches!(
            job.check_schema(),
            Err(EngineError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("db".parse::<JobKind>().unwrap(), JobKind::Database);
        assert_eq!("full".parse::<JobKind>().unwrap(), JobKind::Full);
        assert!("partial".parse::<JobKind>().is_err());
    }
}
