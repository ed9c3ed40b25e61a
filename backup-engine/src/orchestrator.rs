//! Backup orchestration.
//!
//! Drives a job through `Database -> Files -> Finalize` and into a terminal
//! phase. Every entry point loads the job from the [`JobStore`], performs at
//! most one bounded step and saves it back, so any call may be the last one a
//! process gets to make.

use crate::archive::{partial_archive_path, ArchiveBuilder, BackupManifest, DATABASE_DIR};
use crate::config::EngineConfig;
use crate::database::{DatabaseBackupEngine, DatabaseConnector};
use crate::files::{checkpoint, FileBackupEngine};
use crate::job::{
    BackupJob, EngineState, HistoryEntry, HistoryStore, IssueLog, JobPhase, JobRequest, JobStore,
    TableSummary,
};
use crate::memory::MemoryGuard;
use crate::progress::{
    advance_progress, format_bytes, format_duration, format_speed, job_progress, ProgressPhase,
    Throughput,
};
use crate::storage::{ConfiguredProviders, ProviderFactory, UploadDispatcher, UploadMetadata};
use crate::transfer::{Connector, DefaultConnector, TransferConnectionPool};
use crate::utils::{EngineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Finalize runs as three persisted steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeStage {
    #[default]
    Archive,
    Upload,
    Record,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeState {
    pub stage: FinalizeStage,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub archive_size: u64,
}

pub struct BackupOrchestrator {
    config: EngineConfig,
    jobs: Box<dyn JobStore>,
    history: Box<dyn HistoryStore>,
    memory: Arc<MemoryGuard>,
    connector: Option<Arc<dyn DatabaseConnector>>,
    database: Option<DatabaseBackupEngine>,
    pool: TransferConnectionPool,
    providers: Arc<dyn ProviderFactory>,
}

fn merge_destinations(configured: &[String], requested: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for dest in configured.iter().chain(requested) {
        let dest = dest.trim();
        if !dest.is_empty() && !merged.iter().any(|d| d == dest) {
            merged.push(dest.to_string());
        }
    }
    merged
}

fn remove_work_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "work directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), "cannot remove work directory: {}", e),
    }
}

fn phase_context(phase: JobPhase) -> &'static str {
    match phase {
        JobPhase::Database => "database",
        JobPhase::Files => "files",
        _ => "finalize",
    }
}

fn unexpected_state(phase: JobPhase, state: &EngineState) -> EngineError {
    let found = match state {
        EngineState::Idle => "idle",
        EngineState::Database(_) => "database",
        EngineState::Files(_) => "files",
        EngineState::Finalize(_) => "finalize",
    };
    EngineError::InvalidState(format!(
        "{} phase holds {found} engine state",
        phase_context(phase)
    ))
}

fn archive_entry_name(dir: &str, file: &Path) -> String {
    match file.file_name() {
        Some(name) => format!("{dir}/{}", name.to_string_lossy()),
        None => dir.to_string(),
    }
}

impl BackupOrchestrator {
    pub fn new(config: EngineConfig, jobs: Box<dyn JobStore>, history: Box<dyn HistoryStore>) -> Self {
        let memory = Arc::new(MemoryGuard::system(config.memory.clone()));
        let pool = TransferConnectionPool::new(Arc::new(DefaultConnector), &config.transfer);
        let providers = Arc::new(ConfiguredProviders::new(
            &config.storage,
            config.transfer.timeout(),
        ));
        Self {
            config,
            jobs,
            history,
            memory,
            connector: None,
            database: None,
            pool,
            providers,
        }
    }

    pub fn with_database(mut self, connector: Arc<dyn DatabaseConnector>) -> Self {
        info!(database = %connector.describe(), "database source configured");
        self.connector = Some(connector);
        self.database = None;
        self
    }

    pub fn with_transfer_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.pool.close_all();
        self.pool = TransferConnectionPool::new(connector, &self.config.transfer);
        self
    }

    pub fn with_storage(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryGuard>) -> Self {
        self.memory = memory;
        self.database = None;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &dyn HistoryStore {
        self.history.as_ref()
    }

    /// Budget used by [`drive`](Self::drive) when the caller has none.
    pub fn drive_budget(&self) -> Duration {
        Duration::from_secs(self.config.orchestrator.drive_budget_secs)
    }

    pub fn status(&self, id: &str) -> Result<BackupJob> {
        let job = self.jobs.load(id)?;
        job.check_schema()?;
        Ok(job)
    }

    /// Create and persist a new job. No engine work happens here.
    pub fn start(&mut self, request: JobRequest) -> Result<BackupJob> {
        if request.kind.includes_database() && self.connector.is_none() {
            return Err(EngineError::Config(
                "database backup requested but no database is configured".into(),
            ));
        }
        let mut job = BackupJob::new(&request, &self.config.paths.work_root);
        job.destinations = merge_destinations(&self.config.storage.destinations, &request.destinations);
        std::fs::create_dir_all(&job.work_dir)?;
        job.message = match job.phase {
            JobPhase::Database => "Waiting to export database".to_string(),
            _ => "Waiting to copy files".to_string(),
        };
        self.jobs.save(&job)?;
        info!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            destinations = ?job.destinations,
            "backup job created"
        );
        Ok(job)
    }

    /// Perform one bounded step of `id`. Terminal jobs are returned unchanged.
    pub fn advance(&mut self, id: &str) -> Result<BackupJob> {
        let mut job = self.status(id)?;
        if job.is_terminal() {
            return Ok(job);
        }

        if job.cancel_requested {
            self.terminate(&mut job, JobPhase::Cancelled);
        } else {
            let phase = job.phase;
            let result = match phase {
                JobPhase::Database => self.step_database(&mut job),
                JobPhase::Files => self.step_files(&mut job),
                JobPhase::Finalize => self.step_finalize(&mut job),
                _ => Ok(()),
            };
            if let Err(e) = result {
                self.abort(&mut job, phase_context(phase), &e);
            }
        }

        job.metrics.observe_memory(self.memory.used());
        job.touch();
        let mut throughput = Throughput::default();
        throughput.record(
            job.metrics.database_bytes + job.metrics.file_bytes,
            Duration::from_secs_f64(job.metrics.elapsed_secs),
        );
        job.metrics.bytes_per_second = throughput.bytes_per_second();
        self.jobs.save(&job)?;
        Ok(job)
    }

    /// Continuation entry point for an external trigger.
    ///
    /// Guarded by the job's token; a terminal job is returned as is so
    /// duplicate triggers are harmless.
    pub fn continue_job(&mut self, id: &str, token: &str) -> Result<BackupJob> {
        let job = self.status(id)?;
        if job.continuation_token != token {
            warn!(job_id = %id, "continuation rejected: token mismatch");
            return Err(EngineError::InvalidToken(id.to_string()));
        }
        if job.is_terminal() {
            return Ok(job);
        }
        self.advance(id)
    }

    /// Advance until the job is terminal or `budget` is spent.
    pub fn drive(&mut self, id: &str, budget: Duration) -> Result<BackupJob> {
        let started = Instant::now();
        loop {
            let job = self.advance(id)?;
            if job.is_terminal() || started.elapsed() >= budget {
                return Ok(job);
            }
        }
    }

    /// Stop the job now and clean up after it.
    pub fn cancel(&mut self, id: &str) -> Result<BackupJob> {
        let mut job = self.status(id)?;
        if job.is_terminal() {
            return Ok(job);
        }
        job.cancel_requested = true;
        self.terminate(&mut job, JobPhase::Cancelled);
        job.touch();
        self.jobs.save(&job)?;
        Ok(job)
    }

    /// Flag the job so that whichever process advances it next cancels it.
    pub fn request_cancel(&mut self, id: &str) -> Result<BackupJob> {
        let mut job = self.status(id)?;
        if job.is_terminal() {
            return Ok(job);
        }
        job.cancel_requested = true;
        job.message = "Cancellation requested".to_string();
        job.touch();
        self.jobs.save(&job)?;
        Ok(job)
    }

    /// Rebuild the file engine state of `id` from the checkpoint in its work
    /// directory, replacing whatever the persisted status holds.
    pub fn resume_files_from_checkpoint(&mut self, id: &str) -> Result<BackupJob> {
        let mut job = self.status(id)?;
        if job.phase != JobPhase::Files {
            return Err(EngineError::InvalidState(format!(
                "job {id} is not copying files"
            )));
        }
        let status = self.file_engine().restore(&job.work_dir)?;
        job.message = format!(
            "Resumed from checkpoint: {} files already copied",
            status.processed_files.len()
        );
        job.engine_state = EngineState::Files(Box::new(status));
        job.touch();
        self.jobs.save(&job)?;
        Ok(job)
    }

    /// Jobs that have not reached a terminal phase.
    pub fn active_jobs(&self) -> Result<Vec<BackupJob>> {
        self.jobs.list_active()
    }

    /// Active jobs whose last update is older than the stall threshold.
    pub fn stalled_jobs(&self) -> Result<Vec<BackupJob>> {
        let threshold = chrono::Duration::seconds(self.config.orchestrator.stall_after_secs as i64);
        let now = Utc::now();
        Ok(self
            .jobs
            .list_active()?
            .into_iter()
            .filter(|job| now - job.last_update >= threshold)
            .collect())
    }

    fn database_engine(&mut self) -> Result<&mut DatabaseBackupEngine> {
        if self.database.is_none() {
            let connector = self
                .connector
                .clone()
                .ok_or_else(|| EngineError::Config("no database is configured".into()))?;
            self.database = Some(DatabaseBackupEngine::new(
                connector,
                self.config.database.clone(),
                self.memory.clone(),
            ));
        }
        self.database
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("database engine unavailable".into()))
    }

    fn file_engine(&self) -> FileBackupEngine {
        FileBackupEngine::new(
            self.config.files.clone(),
            self.config.transfer.clone(),
            self.memory.clone(),
        )
        .exclude_local_path(&self.config.paths.work_root)
        .exclude_local_path(&self.config.paths.archive_dir)
    }

    fn step_database(&mut self, job: &mut BackupJob) -> Result<()> {
        let cap = self.config.orchestrator.max_recorded_errors;
        let mut status = match std::mem::take(&mut job.engine_state) {
            EngineState::Database(status) => *status,
            EngineState::Idle => {
                let export_dir = job.work_dir.join(DATABASE_DIR);
                let mut status = self.database_engine()?.start(&export_dir)?;
                job.absorb_issues(&mut status.issues, cap);
                info!(
                    job_id = %job.id,
                    tables = status.total_tables,
                    rows = status.total_rows,
                    "database export planned"
                );
                job.message = format!("Exporting database: 0/{} tables", status.total_tables);
                job.engine_state = EngineState::Database(Box::new(status));
                return Ok(());
            }
            other => return Err(unexpected_state(JobPhase::Database, &other)),
        };

        let outcome = self.database_engine()?.advance(&mut status);
        job.absorb_issues(&mut status.issues, cap);
        outcome?;

        job.metrics.database_bytes = status.bytes_written;
        job.metrics.rows_exported = status.processed_rows;
        job.metrics.tables_exported = status.completed.len();
        let estimate = job_progress(job.kind, ProgressPhase::Database, status.fraction());
        job.progress = advance_progress(job.progress, estimate);
        job.message = format!(
            "Exporting database: {}/{} tables",
            status.completed.len() + status.failed_tables.len(),
            status.total_tables
        );

        if !status.done {
            job.engine_state = EngineState::Database(Box::new(status));
            return Ok(());
        }

        job.summary.tables = status
            .completed
            .iter()
            .map(|t| TableSummary {
                name: t.name.clone(),
                rows: t.rows,
                file: archive_entry_name(DATABASE_DIR, &t.file),
            })
            .collect();
        job.summary.failed_tables = status.failed_tables.clone();
        info!(
            job_id = %job.id,
            tables = status.completed.len(),
            failed = status.failed_tables.len(),
            rows = status.processed_rows,
            size = %format_bytes(status.bytes_written),
            "database export finished"
        );

        // The connection is not needed past this phase.
        self.database = None;
        if job.kind.includes_files() {
            job.phase = JobPhase::Files;
            job.message = "Copying files".to_string();
        } else {
            self.enter_finalize(job);
        }
        Ok(())
    }

    fn step_files(&mut self, job: &mut BackupJob) -> Result<()> {
        let cap = self.config.orchestrator.max_recorded_errors;
        let engine = self.file_engine();
        let mut status = match std::mem::take(&mut job.engine_state) {
            EngineState::Files(status) => *status,
            EngineState::Idle => {
                let status = if checkpoint::checkpoint_path(&job.work_dir).exists() {
                    engine.restore(&job.work_dir)?
                } else {
                    engine.start(&job.work_dir)?
                };
                job.engine_state = EngineState::Files(Box::new(status));
                return Ok(());
            }
            other => return Err(unexpected_state(JobPhase::Files, &other)),
        };

        let outcome = engine.advance(&mut status, &mut self.pool);
        job.absorb_issues(&mut status.issues, cap);
        outcome?;

        job.metrics.file_bytes = status.total_size;
        job.metrics.files_backed_up = status.processed_files.len();
        job.metrics.files_failed = status.failed_files.len();
        job.metrics.files_skipped = status.skipped_files.len();
        let estimate = job_progress(job.kind, ProgressPhase::Files, status.fraction());
        job.progress = advance_progress(job.progress, estimate);
        job.message = format!(
            "Copying files: {} copied ({}), {} queued",
            status.processed_files.len(),
            format_bytes(status.total_size),
            status.pending.len() + status.large.len() + status.retry.len()
        );

        if !status.done {
            job.engine_state = EngineState::Files(Box::new(status));
            return Ok(());
        }

        self.pool.close_all();
        info!(
            job_id = %job.id,
            files = status.processed_files.len(),
            failed = status.failed_files.len(),
            skipped = status.skipped_files.len(),
            size = %format_bytes(status.total_size),
            "file backup finished"
        );
        self.enter_finalize(job);
        Ok(())
    }

    fn enter_finalize(&mut self, job: &mut BackupJob) {
        job.phase = JobPhase::Finalize;
        job.engine_state = EngineState::Finalize(FinalizeState::default());
        job.progress = advance_progress(
            job.progress,
            job_progress(job.kind, ProgressPhase::Finalize, 0.0),
        );
        job.message = "Building archive".to_string();
    }

    fn step_finalize(&mut self, job: &mut BackupJob) -> Result<()> {
        if job.has_critical() {
            warn!(
                job_id = %job.id,
                critical = job.critical_errors.len(),
                "refusing to finalize a backup with critical errors"
            );
            self.terminate(job, JobPhase::Failed);
            return Ok(());
        }

        let mut state = match std::mem::take(&mut job.engine_state) {
            EngineState::Finalize(state) => state,
            EngineState::Idle => FinalizeState::default(),
            other => return Err(unexpected_state(JobPhase::Finalize, &other)),
        };
        let outcome = self.finalize_stage(job, &mut state);
        if job.phase == JobPhase::Finalize {
            job.engine_state = EngineState::Finalize(state);
        }
        outcome
    }

    fn finalize_stage(&mut self, job: &mut BackupJob, state: &mut FinalizeState) -> Result<()> {
        match state.stage {
            FinalizeStage::Archive => {
                let manifest = BackupManifest::for_job(job);
                let builder = ArchiveBuilder::new(self.config.archive.clone(), self.memory.clone());
                let path = builder.build(&job.work_dir, &manifest, &self.config.paths.archive_dir)?;
                state.archive_path = Some(path.clone());
                state.archive_size = std::fs::metadata(&path)?.len();
                state.stage = FinalizeStage::Upload;
                job.message = format!("Archive built ({})", format_bytes(state.archive_size));
            }
            FinalizeStage::Upload => {
                let archive = state
                    .archive_path
                    .clone()
                    .ok_or_else(|| EngineError::InvalidState("upload stage without an archive".into()))?;
                let metadata = UploadMetadata {
                    job_id: job.id.clone(),
                    kind: job.kind,
                    size: state.archive_size,
                    created_at: job.created_at,
                };
                let report = UploadDispatcher::new(self.providers.as_ref(), &self.config.storage)
                    .upload(&archive, &job.destinations, &metadata);

                let mut issues = IssueLog::default();
                for failure in report.failures() {
                    issues.recoverable(
                        format!("upload {}", failure.destination),
                        failure.error.clone().unwrap_or_default(),
                    );
                }
                job.absorb_issues(&mut issues, self.config.orchestrator.max_recorded_errors);
                job.uploaded_to = report.uploaded_to;
                job.primary_destination = report.primary;
                job.destination_results = report.results;
                state.stage = FinalizeStage::Record;
                job.message = format!("Uploaded to {}", job.uploaded_to.join(", "));
            }
            FinalizeStage::Record => {
                let archive = state
                    .archive_path
                    .clone()
                    .ok_or_else(|| EngineError::InvalidState("record stage without an archive".into()))?;
                self.record_history(job, &archive, state.archive_size)?;
                self.complete(job, archive, state.archive_size);
            }
        }
        Ok(())
    }

    /// Append the history entry for `job`, or merge destinations into the
    /// existing one when the job was recorded before.
    fn record_history(&mut self, job: &BackupJob, archive: &Path, size: u64) -> Result<()> {
        if self.history.exists(&job.id)? {
            if let Some(mut existing) = self.history.get(&job.id)? {
                if existing.merge_destinations(&job.uploaded_to) {
                    info!(job_id = %job.id, destinations = ?existing.destinations, "history entry updated");
                    self.history.update(existing)?;
                }
            }
            return Ok(());
        }
        let file = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());
        self.history.append(HistoryEntry {
            id: job.id.clone(),
            kind: job.kind,
            file,
            size,
            destinations: job.uploaded_to.clone(),
            locked: job.locked,
            schedule: job.schedule.clone(),
            created_at: job.created_at,
        })
    }

    fn complete(&mut self, job: &mut BackupJob, archive: PathBuf, size: u64) {
        job.phase = JobPhase::Completed;
        job.progress = 100;
        job.engine_state = EngineState::Idle;
        job.finished_at = Some(Utc::now());
        let elapsed = job.metrics.elapsed_secs as u64;
        job.message = format!(
            "Backup completed: {} ({}) in {}, {}",
            archive.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            format_bytes(size),
            format_duration(elapsed),
            format_speed(job.metrics.bytes_per_second)
        );
        job.result_archive_path = Some(archive);
        job.result_size = Some(size);
        self.pool.close_all();
        self.database = None;
        remove_work_dir(&job.work_dir);
        info!(
            job_id = %job.id,
            size = %format_bytes(size),
            elapsed = %format_duration(elapsed),
            destinations = ?job.uploaded_to,
            errors = job.errors.len(),
            "backup completed"
        );
    }

    fn abort(&mut self, job: &mut BackupJob, context: &str, err: &EngineError) {
        error!(job_id = %job.id, context, "backup failed: {}", err);
        let mut issues = IssueLog::default();
        issues.critical(context, err.to_string());
        job.absorb_issues(&mut issues, self.config.orchestrator.max_recorded_errors);
        self.terminate(job, JobPhase::Failed);
    }

    /// Move to `Failed` or `Cancelled`, releasing every resource the job holds.
    fn terminate(&mut self, job: &mut BackupJob, phase: JobPhase) {
        if let EngineState::Finalize(state) = &job.engine_state {
            if let Some(path) = &state.archive_path {
                if let Err(e) = std::fs::remove_file(path) {
                    debug!(path = %path.display(), "archive not removed: {}", e);
                }
            }
        }
        let partial = partial_archive_path(
            &self.config.paths.archive_dir,
            &self.config.archive.name_prefix,
            job.id.get(..8).unwrap_or(&job.id),
        );
        if partial.exists() {
            if let Err(e) = std::fs::remove_file(&partial) {
                warn!(path = %partial.display(), "partial archive not removed: {}", e);
            }
        }
        match phase {
            JobPhase::Cancelled => {
                job.phase = JobPhase::Cancelled;
                job.engine_state = EngineState::Idle;
                job.finished_at = Some(Utc::now());
                job.message = "Backup cancelled".to_string();
                info!(job_id = %job.id, "backup cancelled");
            }
            _ => job.fail(),
        }
        self.pool.close_all();
        self.database = None;
        remove_work_dir(&job.work_dir);
    }
}
