//! Database export.
//!
//! The engine talks to the database only through [`DatabaseConnection`];
//! reconnecting is the engine's job, not the connection's.

pub mod engine;
pub mod sql;
pub mod sqlite;

use crate::job::IssueLog;
use crate::throttle::BatchBounds;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;

pub use engine::DatabaseBackupEngine;
pub use sqlite::SqliteConnector;

/// A single column value as fetched from the database.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Metadata estimate for a table; either field may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub rows: Option<u64>,
    pub size_bytes: Option<u64>,
}

/// Opens connections. Called again whenever a connection is found dead.
pub trait DatabaseConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>>;

    /// Human-readable target for log lines (never includes credentials).
    fn describe(&self) -> String;
}

/// Row-cursor access to one database.
pub trait DatabaseConnection: Send {
    /// Lightweight liveness probe.
    fn ping(&mut self) -> bool;

    fn list_tables(&mut self) -> Result<Vec<String>>;

    /// Cheap metadata estimate; `Ok(None)` when the backend has none.
    fn table_stats(&mut self, table: &str) -> Result<Option<TableStats>>;

    fn count_rows(&mut self, table: &str) -> Result<u64>;

    fn create_statement(&mut self, table: &str) -> Result<String>;

    fn columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// Fetch up to `limit` rows starting at `offset`, in a stable order.
    fn fetch_rows(&mut self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>>;

    fn quote_identifier(&self, name: &str) -> String {
        sql::quote_identifier(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePhase {
    ExportStructure,
    ExportData,
}

/// A table waiting for a slot in the active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTable {
    pub name: String,
    pub total_rows: u64,
    pub size_bytes: u64,
    pub batch_size: usize,
}

/// Export state of one active table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExportState {
    pub name: String,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub row_offset: u64,
    pub batch_size: usize,
    pub phase: TablePhase,
    pub export_file_path: PathBuf,
    #[serde(default)]
    pub columns: Vec<String>,
    /// Length of the export file after the last committed batch
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default)]
    pub retry_count: u32,
    /// A fetch came back short: every row of the table has been read
    #[serde(default)]
    pub exhausted: bool,
}

impl TableExportState {
    /// `total_rows` is an estimate; only a short fetch ends the table.
    pub fn is_complete(&self) -> bool {
        self.phase == TablePhase::ExportData && self.exhausted
    }

    /// Fraction of this table already exported.
    pub fn fraction(&self) -> f64 {
        match self.phase {
            TablePhase::ExportStructure => 0.0,
            TablePhase::ExportData if self.exhausted || self.total_rows == 0 => 1.0,
            TablePhase::ExportData => {
                (self.row_offset.min(self.total_rows) as f64) / self.total_rows as f64
            }
        }
    }
}

/// A table whose export finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTable {
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
    pub file: PathBuf,
}

/// Database phase status, persisted inside the job between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub export_dir: PathBuf,
    pub queue: VecDeque<QueuedTable>,
    pub active: Vec<TableExportState>,
    pub completed: Vec<CompletedTable>,
    pub failed_tables: Vec<String>,
    pub total_tables: usize,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub bytes_written: u64,
    pub bounds: BatchBounds,
    /// Export file names handed out so far, lowercased
    #[serde(default)]
    pub export_names: BTreeSet<String>,
    #[serde(default)]
    pub issues: IssueLog,
    #[serde(default)]
    pub steps: u64,
    #[serde(default)]
    pub done: bool,
}

impl DatabaseStatus {
    /// Completed tables plus partial progress of active ones, over all tables.
    pub fn fraction(&self) -> f64 {
        if self.total_tables == 0 {
            return 1.0;
        }
        let finished = (self.completed.len() + self.failed_tables.len()) as f64;
        let partial: f64 = self.active.iter().map(TableExportState::fraction).sum();
        ((finished + partial) / self.total_tables as f64).clamp(0.0, 1.0)
    }
}
