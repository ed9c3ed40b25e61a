//! Interleaved, adaptively batched table export.
//!
//! Several tables are active at once; every `advance` performs exactly one
//! unit of work (the structure export or one data batch) per active table, so a
//! huge table can never starve the small ones of visible progress and the cost
//! of one call is bounded by one batch per active table.

use super::{
    sql, CompletedTable, DatabaseConnection, DatabaseConnector, DatabaseStatus, QueuedTable,
    TableExportState, TablePhase,
};
use crate::config::DatabaseSettings;
use crate::job::IssueLog;
use crate::memory::{MemoryGuard, Pressure};
use crate::throttle::{next_batch_size, BatchBounds};
use crate::utils::{EngineError, Result};
use std::collections::{BTreeSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of one unit of work on an active table.
enum Outcome {
    Continue,
    Completed,
    Abandoned,
}

pub struct DatabaseBackupEngine {
    connector: Arc<dyn DatabaseConnector>,
    conn: Option<Box<dyn DatabaseConnection>>,
    settings: DatabaseSettings,
    memory: Arc<MemoryGuard>,
}

/// Starting batch size for a table: base size scaled by a row-count tier.
pub fn initial_batch_size(rows: u64, settings: &DatabaseSettings) -> usize {
    let multiplier = match rows {
        r if r > 1_000_000 => 0.25,
        r if r > 100_000 => 0.5,
        r if r > 10_000 => 1.0,
        r if r > 1_000 => 2.0,
        _ => 4.0,
    };
    let bounds = BatchBounds::new(settings.min_batch_size, settings.max_batch_size);
    bounds.clamp((settings.base_batch_size as f64 * multiplier) as usize)
}

/// File name for a table export; anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn export_file_name(table: &str) -> String {
    let safe: String = table
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.sql")
}

/// Like [`export_file_name`], suffixed `-2`, `-3`, ... until it differs from
/// every name in `taken` (compared lowercased).
pub fn unique_export_file_name(table: &str, taken: &BTreeSet<String>) -> String {
    let base = export_file_name(table);
    if !taken.contains(&base.to_ascii_lowercase()) {
        return base;
    }
    let stem = base.trim_end_matches(".sql");
    let mut n = 2u32;
    loop {
        let candidate = format!("{stem}-{n}.sql");
        if !taken.contains(&candidate.to_ascii_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

impl DatabaseBackupEngine {
    pub fn new(
        connector: Arc<dyn DatabaseConnector>,
        settings: DatabaseSettings,
        memory: Arc<MemoryGuard>,
    ) -> Self {
        Self {
            connector,
            conn: None,
            settings,
            memory,
        }
    }

    fn bounds(&self) -> BatchBounds {
        BatchBounds::new(self.settings.min_batch_size, self.settings.max_batch_size)
    }

    /// Make sure a live connection is cached, reconnecting if needed.
    fn ensure_connection(&mut self) -> Result<&mut Box<dyn DatabaseConnection>> {
        let alive = match self.conn.as_mut() {
            Some(conn) => conn.ping(),
            None => false,
        };
        if !alive {
            if self.conn.take().is_some() {
                warn!(target_db = %self.connector.describe(), "database connection lost, reconnecting");
            }
            let attempts = self.settings.reconnect_attempts.max(1);
            let mut last_error = None;
            for attempt in 1..=attempts {
                match self.connector.connect() {
                    Ok(conn) => {
                        self.conn = Some(conn);
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, attempts, "database connect failed: {}", e);
                        last_error = Some(e);
                    }
                }
            }
            if let Some(e) = last_error {
                return Err(EngineError::Connection(format!(
                    "{} unreachable after {} attempts: {}",
                    self.connector.describe(),
                    attempts,
                    e
                )));
            }
        }
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::Connection("no database connection".into()))
    }

    /// Enumerate tables, estimate their size and build the smallest-first queue.
    ///
    /// An error is job-fatal; table-level problems are recorded in the
    /// returned status instead.
    pub fn start(&mut self, export_dir: &Path) -> Result<DatabaseStatus> {
        std::fs::create_dir_all(export_dir).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create {}: {}", export_dir.display(), e),
            ))
        })?;

        let bounds = self.bounds();
        let settings = self.settings.clone();
        let conn = self.ensure_connection()?;
        let tables = conn
            .list_tables()
            .map_err(|e| EngineError::Connection(format!("cannot list tables: {e}")))?;

        let mut issues = IssueLog::default();
        let mut failed_tables = Vec::new();
        let mut queue = Vec::with_capacity(tables.len());

        for name in tables {
            if settings.exclude_tables.iter().any(|t| t == &name) {
                debug!(table = %name, "table excluded");
                continue;
            }

            let stats = conn.table_stats(&name).unwrap_or_else(|e| {
                debug!(table = %name, "table metadata unavailable: {}", e);
                None
            });
            let rows = match stats.and_then(|s| s.rows) {
                Some(rows) => rows,
                None => match conn.count_rows(&name) {
                    Ok(rows) => rows,
                    Err(e) => {
                        issues.critical(name.clone(), format!("cannot count rows: {e}"));
                        failed_tables.push(name);
                        continue;
                    }
                },
            };
            let size_bytes = stats.and_then(|s| s.size_bytes).unwrap_or(0);

            queue.push(QueuedTable {
                batch_size: initial_batch_size(rows, &settings),
                name,
                total_rows: rows,
                size_bytes,
            });
        }

        queue.sort_by(|a, b| {
            (a.size_bytes, a.total_rows, &a.name).cmp(&(b.size_bytes, b.total_rows, &b.name))
        });

        let total_rows = queue.iter().map(|t| t.total_rows).sum();
        let total_tables = queue.len() + failed_tables.len();
        info!(
            tables = total_tables,
            rows = total_rows,
            fan_out = settings.fan_out(),
            "database export planned"
        );

        Ok(DatabaseStatus {
            export_dir: export_dir.to_path_buf(),
            queue: VecDeque::from(queue),
            active: Vec::new(),
            completed: Vec::new(),
            failed_tables,
            total_tables,
            total_rows,
            processed_rows: 0,
            bytes_written: 0,
            bounds,
            export_names: BTreeSet::new(),
            issues,
            steps: 0,
            done: total_tables == 0,
        })
    }

    /// Perform one unit of work for every active table.
    ///
    /// An error is job-fatal (connection cannot be re-established, or memory
    /// pressure persists after relief).
    pub fn advance(&mut self, status: &mut DatabaseStatus) -> Result<()> {
        if status.done {
            return Ok(());
        }
        status.steps += 1;

        self.relieve_memory(status)?;
        self.ensure_connection()?;

        let fan_out = self.settings.fan_out();
        while status.active.len() < fan_out {
            let Some(next) = status.queue.pop_front() else { break };
            let file_name = unique_export_file_name(&next.name, &status.export_names);
            status.export_names.insert(file_name.to_ascii_lowercase());
            debug!(table = %next.name, rows = next.total_rows, batch = next.batch_size, file = %file_name, "table activated");
            status.active.push(TableExportState {
                export_file_path: status.export_dir.join(file_name),
                name: next.name,
                total_rows: next.total_rows,
                processed_rows: 0,
                row_offset: 0,
                batch_size: next.batch_size,
                phase: TablePhase::ExportStructure,
                columns: Vec::new(),
                bytes_written: 0,
                retry_count: 0,
                exhausted: false,
            });
        }

        let mut i = 0;
        while i < status.active.len() {
            let outcome = match status.active[i].phase {
                TablePhase::ExportStructure => {
                    self.export_structure(&mut status.active[i], &mut status.issues)
                }
                TablePhase::ExportData => {
                    let before = (
                        status.active[i].processed_rows,
                        status.active[i].bytes_written,
                        status.active[i].total_rows,
                    );
                    let outcome = self.export_batch(
                        &mut status.active[i],
                        &mut status.issues,
                        status.bounds,
                    );
                    let table = &status.active[i];
                    status.processed_rows += table.processed_rows - before.0;
                    status.bytes_written += table.bytes_written.saturating_sub(before.1);
                    status.total_rows += table.total_rows.saturating_sub(before.2);
                    outcome
                }
            };

            match outcome {
                Outcome::Continue => i += 1,
                Outcome::Completed => {
                    let table = status.active.remove(i);
                    info!(table = %table.name, rows = table.processed_rows, "table exported");
                    status.completed.push(CompletedTable {
                        name: table.name,
                        rows: table.processed_rows,
                        bytes: table.bytes_written,
                        file: table.export_file_path,
                    });
                }
                Outcome::Abandoned => {
                    let table = status.active.remove(i);
                    warn!(table = %table.name, "table abandoned");
                    status.failed_tables.push(table.name);
                }
            }
        }

        if status.queue.is_empty() && status.active.is_empty() {
            status.done = true;
            info!(
                tables = status.completed.len(),
                failed = status.failed_tables.len(),
                rows = status.processed_rows,
                "database export finished"
            );
        }
        Ok(())
    }

    /// Shrink batches under memory pressure; fail if pressure persists.
    fn relieve_memory(&mut self, status: &mut DatabaseStatus) -> Result<()> {
        if self.memory.pressure() != Pressure::High {
            return Ok(());
        }
        warn!(ratio = self.memory.ratio(), "memory pressure high, shrinking table batches");
        for table in &mut status.active {
            table.batch_size = status.bounds.clamp(table.batch_size / 2);
        }
        for table in &mut status.queue {
            table.batch_size = status.bounds.clamp(table.batch_size / 2);
        }
        status.queue.shrink_to_fit();
        self.memory.check_after_relief()
    }

    fn export_structure(&mut self, table: &mut TableExportState, issues: &mut IssueLog) -> Outcome {
        let Some(conn) = self.conn.as_mut() else {
            return Outcome::Continue;
        };

        let structure = conn
            .create_statement(&table.name)
            .and_then(|create| conn.columns(&table.name).map(|cols| (create, cols)));
        let (create, columns) = match structure {
            Ok(parts) => parts,
            Err(e) => {
                if !conn.ping() && table.retry_count < self.settings.max_batch_retries {
                    table.retry_count += 1;
                    self.conn = None;
                    warn!(table = %table.name, "connection lost while reading structure, will retry");
                    return Outcome::Continue;
                }
                issues.critical(table.name.clone(), format!("cannot read table structure: {e}"));
                return Outcome::Abandoned;
            }
        };

        let quoted = conn.quote_identifier(&table.name);
        let mut text = sql::export_header(&table.name, table.total_rows);
        text.push_str(&sql::structure(&quoted, &create));

        if let Err(e) = write_new_file(&table.export_file_path, text.as_bytes()) {
            issues.critical(
                table.name.clone(),
                format!("cannot open export file {}: {e}", table.export_file_path.display()),
            );
            return Outcome::Abandoned;
        }

        table.bytes_written = text.len() as u64;
        table.columns = columns;
        table.phase = TablePhase::ExportData;
        table.retry_count = 0;

        // Even a table estimated empty gets one fetch to confirm it.
        Outcome::Continue
    }

    fn export_batch(
        &mut self,
        table: &mut TableExportState,
        issues: &mut IssueLog,
        bounds: BatchBounds,
    ) -> Outcome {
        if table.is_complete() {
            return Outcome::Completed;
        }
        let Some(conn) = self.conn.as_mut() else {
            return Outcome::Continue;
        };

        // The row estimate caps batches but never ends the table; past it,
        // full batches continue until one comes back short.
        let batch = table.batch_size.max(1) as u64;
        let remaining = table.total_rows.saturating_sub(table.row_offset);
        let limit = if remaining > 0 { batch.min(remaining) } else { batch };
        let started = Instant::now();

        let rows = match conn.fetch_rows(&table.name, table.row_offset, limit) {
            Ok(rows) => rows,
            Err(e) => {
                if !conn.ping() && table.retry_count < self.settings.max_batch_retries {
                    table.retry_count += 1;
                    self.conn = None;
                    warn!(
                        table = %table.name,
                        offset = table.row_offset,
                        attempt = table.retry_count,
                        "connection lost during fetch, batch will be retried"
                    );
                    return Outcome::Continue;
                }
                issues.recoverable(
                    table.name.clone(),
                    format!("batch at offset {} ({} rows) failed: {e}", table.row_offset, limit),
                );
                table.row_offset += limit;
                table.retry_count = 0;
                if table.row_offset >= table.total_rows {
                    // Cannot tell whether rows remain past a failed batch.
                    table.exhausted = true;
                }
                return if table.is_complete() {
                    Outcome::Completed
                } else {
                    Outcome::Continue
                };
            }
        };

        let quoted_table = conn.quote_identifier(&table.name);
        let quoted_columns: Vec<String> =
            table.columns.iter().map(|c| conn.quote_identifier(c)).collect();
        let mut text = String::new();
        sql::append_inserts(&mut text, &quoted_table, &quoted_columns, &rows);

        if let Err(e) = append_committed(&table.export_file_path, table.bytes_written, text.as_bytes()) {
            issues.critical(
                table.name.clone(),
                format!("cannot write export file {}: {e}", table.export_file_path.display()),
            );
            return Outcome::Abandoned;
        }

        let fetched = rows.len() as u64;
        table.bytes_written += text.len() as u64;
        table.processed_rows += fetched;
        table.retry_count = 0;
        table.row_offset += fetched;
        if fetched < limit {
            table.exhausted = true;
            if table.row_offset < table.total_rows {
                debug!(table = %table.name, offset = table.row_offset, "table shrank during export");
            }
        }
        if table.row_offset > table.total_rows {
            debug!(table = %table.name, rows = table.row_offset, estimate = table.total_rows, "table grew past its estimate");
            table.total_rows = table.row_offset;
        }

        table.batch_size = next_batch_size(
            table.batch_size,
            bounds,
            self.memory.ratio(),
            self.memory.settings(),
            Duration::from_secs_f64(self.settings.target_batch_secs.max(0.001)),
            started.elapsed(),
        );

        if table.is_complete() {
            Outcome::Completed
        } else {
            Outcome::Continue
        }
    }
}

fn write_new_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.flush()
}

/// Append `data` after the first `committed` bytes of `path`, discarding any
/// tail left by an interrupted batch.
fn append_committed(path: &Path, committed: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(committed)?;
    file.seek(SeekFrom::Start(committed))?;
    file.write_all(data)?;
    file.flush()
}
