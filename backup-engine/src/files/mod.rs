//! Resumable file tree backup.
//!
//! The walk is breadth-first over a FIFO directory queue. Each `advance`
//! drains retries and pending files first, then lists a bounded number of
//! directories to fill the current batch, fetches the batch and at most one
//! large file, re-tunes the batch size and checkpoints periodically.

pub mod checkpoint;
pub mod filter;

use crate::config::{FileSettings, TransferConfig};
use crate::job::IssueLog;
use crate::memory::{MemoryGuard, Pressure};
use crate::throttle::{next_batch_size, BatchBounds};
use crate::transfer::{remote_join, EntryKind, PooledConnection, TransferConnectionPool};
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use checkpoint::Checkpoint;
pub use filter::PathFilter;

/// Name of the directory inside the work dir that mirrors the source tree.
pub const FILES_DIR: &str = "files";

/// A discovered file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemEntry {
    /// Path on the source, as passed to the connection
    pub source_path: String,
    /// `/`-separated path below the site root
    pub relative_path: String,
    pub kind: EntryKind,
    pub size_estimate: u64,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub work_dir: PathBuf,
    pub files_dir: PathBuf,
    pub dir_queue: VecDeque<String>,
    pub pending: VecDeque<FileSystemEntry>,
    pub large: VecDeque<FileSystemEntry>,
    pub retry: VecDeque<FileSystemEntry>,
    pub processed_files: Vec<String>,
    pub processed_dirs: Vec<String>,
    pub failed_files: Vec<String>,
    pub skipped_files: Vec<String>,
    pub discovered_files: usize,
    /// Bytes fetched so far
    pub total_size: u64,
    pub batch_size: usize,
    pub bounds: BatchBounds,
    pub last_batch_clean: bool,
    #[serde(default)]
    pub connect_failures: u32,
    #[serde(default)]
    pub last_checkpoint: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issues: IssueLog,
    #[serde(default)]
    pub steps: u64,
    #[serde(default)]
    pub done: bool,
}

impl FileStatus {
    fn new(work_dir: &Path, settings: &FileSettings) -> Self {
        let bounds = BatchBounds::new(settings.min_batch_size, settings.max_batch_size);
        Self {
            work_dir: work_dir.to_path_buf(),
            files_dir: work_dir.join(FILES_DIR),
            dir_queue: VecDeque::new(),
            pending: VecDeque::new(),
            large: VecDeque::new(),
            retry: VecDeque::new(),
            processed_files: Vec::new(),
            processed_dirs: Vec::new(),
            failed_files: Vec::new(),
            skipped_files: Vec::new(),
            discovered_files: 0,
            total_size: 0,
            batch_size: bounds.clamp(settings.initial_batch_size),
            bounds,
            last_batch_clean: true,
            connect_failures: 0,
            last_checkpoint: None,
            issues: IssueLog::default(),
            steps: 0,
            done: false,
        }
    }

    fn from_checkpoint(work_dir: &Path, settings: &FileSettings, cp: Checkpoint) -> Self {
        let mut status = Self::new(work_dir, settings);
        status.processed_files = cp.processed_files;
        status.processed_dirs = cp.processed_dirs;
        status.dir_queue = cp.dir_queue.into();
        status.pending = cp.pending.into();
        status.large = cp.large.into();
        status.retry = cp.retry.into();
        status.failed_files = cp.failed_files;
        status.skipped_files = cp.skipped_files;
        status.total_size = cp.total_size;
        status.batch_size = status.bounds.clamp(cp.batch_size);
        status.discovered_files = cp.discovered_files;
        status.last_checkpoint = Some(cp.saved_at);
        status
    }

    pub fn queues_empty(&self) -> bool {
        self.dir_queue.is_empty()
            && self.pending.is_empty()
            && self.large.is_empty()
            && self.retry.is_empty()
    }

    /// Rough completion estimate: half directory walk, half file fetch.
    pub fn fraction(&self) -> f64 {
        if self.done {
            return 1.0;
        }
        let dirs_seen = self.processed_dirs.len() + self.dir_queue.len();
        let dirs = if dirs_seen == 0 {
            0.0
        } else {
            self.processed_dirs.len() as f64 / dirs_seen as f64
        };
        let finished = self.processed_files.len() + self.failed_files.len();
        let files = if self.discovered_files == 0 {
            0.0
        } else {
            finished as f64 / self.discovered_files as f64
        };
        ((dirs + files) / 2.0).clamp(0.0, 0.99)
    }

    fn shrink_queues(&mut self) {
        self.dir_queue.shrink_to_fit();
        self.pending.shrink_to_fit();
        self.large.shrink_to_fit();
        self.retry.shrink_to_fit();
    }
}

pub struct FileBackupEngine {
    settings: FileSettings,
    transfer: TransferConfig,
    memory: Arc<MemoryGuard>,
    filter: PathFilter,
}

/// Reject relative paths that could escape the files directory.
fn local_target(files_dir: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(EngineError::Transfer(format!(
            "refusing unsafe path {}",
            relative.display()
        )));
    }
    Ok(files_dir.join(relative))
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

impl FileBackupEngine {
    pub fn new(settings: FileSettings, transfer: TransferConfig, memory: Arc<MemoryGuard>) -> Self {
        let filter = PathFilter::new(&settings.exclude);
        Self {
            settings,
            transfer,
            memory,
            filter,
        }
    }

    /// Leave out a local directory (such as the engine's own work root) when
    /// it lives inside the site root.
    pub fn exclude_local_path(mut self, path: &Path) -> Self {
        self.filter.exclude_local_path(&self.transfer.root, path);
        self
    }

    fn source_root(&self) -> String {
        self.transfer.root.to_string_lossy().into_owned()
    }

    pub fn start(&self, work_dir: &Path) -> Result<FileStatus> {
        let mut status = FileStatus::new(work_dir, &self.settings);
        std::fs::create_dir_all(&status.files_dir).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create {}: {}", status.files_dir.display(), e),
            ))
        })?;

        for root in &self.settings.roots {
            let root = root.trim_matches('/').to_string();
            if self.filter.is_excluded(&root) {
                debug!(root = %root, "configured root is excluded");
                continue;
            }
            if !status.dir_queue.contains(&root) {
                status.dir_queue.push_back(root);
            }
        }
        status.done = status.queues_empty();
        info!(
            roots = status.dir_queue.len(),
            source = %self.source_root(),
            batch = status.batch_size,
            "file backup planned"
        );
        Ok(status)
    }

    /// Rebuild the status from the last checkpoint in `work_dir`.
    pub fn restore(&self, work_dir: &Path) -> Result<FileStatus> {
        let checkpoint = Checkpoint::load(work_dir)?.ok_or_else(|| {
            EngineError::InvalidState(format!("no checkpoint in {}", work_dir.display()))
        })?;
        let status = FileStatus::from_checkpoint(work_dir, &self.settings, checkpoint);
        std::fs::create_dir_all(&status.files_dir)?;
        info!(
            processed = status.processed_files.len(),
            dirs_left = status.dir_queue.len(),
            "file backup restored from checkpoint"
        );
        Ok(status)
    }

    /// Perform one bounded step.
    ///
    /// An error is job-fatal: the source stayed unreachable, or memory
    /// pressure persisted after relief.
    pub fn advance(&self, status: &mut FileStatus, pool: &mut TransferConnectionPool) -> Result<()> {
        if status.done {
            return Ok(());
        }
        status.steps += 1;
        let started = Instant::now();
        let budget = self.settings.step_budget();

        if self.memory.pressure() == Pressure::High {
            warn!(ratio = self.memory.ratio(), "memory pressure high, running relief");
            pool.close_all();
            status.shrink_queues();
            status.batch_size = status.bounds.clamp(status.batch_size / 2);
            self.memory.check_after_relief()?;
        }

        let Some(mut conn) = self.acquire(status, pool)? else {
            return Ok(());
        };

        let capacity = status.batch_size;
        let mut batch: Vec<FileSystemEntry> = Vec::with_capacity(capacity);

        if status.last_batch_clean {
            while batch.len() < capacity {
                let Some(entry) = status.retry.pop_front() else { break };
                batch.push(entry);
            }
        }
        while batch.len() < capacity {
            let Some(entry) = status.pending.pop_front() else { break };
            batch.push(entry);
        }

        let mut listed = 0;
        while batch.len() < capacity && listed < self.settings.dirs_per_step {
            let Some(dir) = status.dir_queue.pop_front() else { break };
            listed += 1;
            match self.scan_directory(&mut conn, &dir, status, &mut batch, capacity) {
                Ok(()) => status.processed_dirs.push(dir),
                Err(e) if !conn.is_alive() => {
                    warn!(dir = %dir, "connection lost while listing: {}", e);
                    status.dir_queue.push_front(dir);
                    conn = match self.reacquire(conn, status, pool)? {
                        Some(conn) => conn,
                        None => {
                            requeue(status, batch);
                            return Ok(());
                        }
                    };
                }
                Err(e) => {
                    warn!(dir = %dir, "directory listing failed, skipping: {}", e);
                    status.issues.recoverable(dir, format!("cannot list directory: {e}"));
                }
            }
        }

        let mut clean = true;
        let mut fetched_bytes = 0u64;
        let mut batch = VecDeque::from(batch);
        let large = status.large.pop_front();
        if let Some(entry) = large {
            batch.push_back(entry);
        }

        let mut conn = Some(conn);
        while let Some(entry) = batch.pop_front() {
            if started.elapsed() >= budget {
                debug!(left = batch.len() + 1, "step budget spent, deferring rest of batch");
                batch.push_front(entry);
                break;
            }
            let Some(active) = conn.as_mut() else {
                batch.push_front(entry);
                break;
            };
            match self.fetch(active, &entry, &status.files_dir) {
                Ok(bytes) => {
                    fetched_bytes += bytes;
                    status.total_size += bytes;
                    status.processed_files.push(entry.relative_path);
                }
                Err(e) => {
                    clean = false;
                    let alive = active.is_alive();
                    self.record_failure(status, entry, &e);
                    if !alive {
                        if let Some(dead) = conn.take() {
                            conn = self.reacquire(dead, status, pool)?;
                        }
                    }
                }
            }
        }
        for entry in batch.into_iter().rev() {
            if entry.size_estimate >= self.settings.large_threshold {
                status.large.push_front(entry);
            } else {
                status.pending.push_front(entry);
            }
        }
        if let Some(conn) = conn {
            pool.release(conn);
        }

        status.last_batch_clean = clean;
        let elapsed = started.elapsed();
        status.batch_size = next_batch_size(
            status.batch_size,
            status.bounds,
            self.memory.ratio(),
            self.memory.settings(),
            Duration::from_secs_f64(self.settings.target_batch_secs.max(0.001)),
            elapsed,
        );
        debug!(
            fetched_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            next_batch = status.batch_size,
            "file step finished"
        );

        if status.queues_empty() {
            status.done = true;
            self.checkpoint(status);
            info!(
                files = status.processed_files.len(),
                failed = status.failed_files.len(),
                skipped = status.skipped_files.len(),
                bytes = status.total_size,
                "file backup finished"
            );
        } else if self.checkpoint_due(status) {
            self.checkpoint(status);
        }
        Ok(())
    }

    /// Borrow a connection; repeated connect failures become job-fatal.
    fn acquire(
        &self,
        status: &mut FileStatus,
        pool: &mut TransferConnectionPool,
    ) -> Result<Option<PooledConnection>> {
        match pool.get(&self.transfer) {
            Ok(conn) => {
                status.connect_failures = 0;
                Ok(Some(conn))
            }
            Err(e) => {
                status.connect_failures += 1;
                if status.connect_failures > self.settings.max_retries {
                    return Err(EngineError::Connection(format!(
                        "{} source unreachable after {} attempts: {}",
                        self.transfer.protocol, status.connect_failures, e
                    )));
                }
                warn!(attempt = status.connect_failures, "cannot connect to source: {}", e);
                status
                    .issues
                    .recoverable(self.transfer.protocol.to_string(), format!("connect failed: {e}"));
                Ok(None)
            }
        }
    }

    fn reacquire(
        &self,
        dead: PooledConnection,
        status: &mut FileStatus,
        pool: &mut TransferConnectionPool,
    ) -> Result<Option<PooledConnection>> {
        pool.discard(dead);
        self.acquire(status, pool)
    }

    /// List one directory and classify what it contains.
    fn scan_directory(
        &self,
        conn: &mut PooledConnection,
        dir: &str,
        status: &mut FileStatus,
        batch: &mut Vec<FileSystemEntry>,
        capacity: usize,
    ) -> Result<()> {
        let source_dir = remote_join(&self.source_root(), dir);
        let entries = conn.list_dir(&source_dir)?;

        for entry in entries {
            let relative = remote_join(dir, &entry.name);
            if self.filter.is_excluded(&relative) {
                continue;
            }
            let item = FileSystemEntry {
                source_path: remote_join(&source_dir, &entry.name),
                relative_path: relative,
                kind: entry.kind,
                size_estimate: entry.size,
                retry_count: 0,
            };
            match entry.kind {
                EntryKind::Dir => status.dir_queue.push_back(item.relative_path),
                EntryKind::File => {
                    status.discovered_files += 1;
                    self.classify(item, status, batch, capacity);
                }
            }
        }
        Ok(())
    }

    fn classify(
        &self,
        item: FileSystemEntry,
        status: &mut FileStatus,
        batch: &mut Vec<FileSystemEntry>,
        capacity: usize,
    ) {
        let size = item.size_estimate;
        if size > self.settings.max_file_size {
            info!(file = %item.relative_path, size, "file above maximum size, skipped");
            status.skipped_files.push(item.relative_path);
        } else if size >= self.settings.large_threshold {
            status.large.push_back(item);
        } else if size < self.settings.medium_threshold && batch.len() < capacity {
            batch.push(item);
        } else {
            status.pending.push_back(item);
        }
    }

    /// Stream one file to `<files_dir>/<relative>` through a `.part` file.
    fn fetch(&self, conn: &mut PooledConnection, entry: &FileSystemEntry, files_dir: &Path) -> Result<u64> {
        let target = local_target(files_dir, &entry.relative_path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let part = part_path(&target);
        match conn.download(&entry.source_path, &part, self.transfer.chunk_size) {
            Ok(bytes) => {
                std::fs::rename(&part, &target)?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                Err(e)
            }
        }
    }

    fn record_failure(&self, status: &mut FileStatus, mut entry: FileSystemEntry, err: &EngineError) {
        entry.retry_count += 1;
        if entry.retry_count > self.settings.max_retries {
            warn!(file = %entry.relative_path, attempts = entry.retry_count, "giving up on file");
            status.issues.recoverable(
                entry.relative_path.clone(),
                format!("failed after {} attempts: {err}", entry.retry_count),
            );
            status.failed_files.push(entry.relative_path);
        } else {
            debug!(file = %entry.relative_path, attempt = entry.retry_count, "fetch failed, will retry: {}", err);
            status.retry.push_back(entry);
        }
    }

    fn checkpoint_due(&self, status: &FileStatus) -> bool {
        match status.last_checkpoint {
            None => true,
            Some(at) => {
                let age = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
                age >= self.settings.checkpoint_interval()
            }
        }
    }

    fn checkpoint(&self, status: &mut FileStatus) {
        match Checkpoint::capture(status).save(&status.work_dir) {
            Ok(()) => status.last_checkpoint = Some(Utc::now()),
            Err(e) => {
                warn!("checkpoint write failed: {}", e);
                status.issues.recoverable("checkpoint", e.to_string());
            }
        }
    }
}

fn requeue(status: &mut FileStatus, batch: Vec<FileSystemEntry>) {
    for entry in batch.into_iter().rev() {
        status.pending.push_front(entry);
    }
}
