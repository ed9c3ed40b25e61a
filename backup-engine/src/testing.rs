//! Fakes shared by the unit tests.

use crate::config::{Protocol, TransferConfig};
use crate::database::{DatabaseConnection, DatabaseConnector, SqlValue, TableStats};
use crate::memory::MemoryProbe;
use crate::storage::{ProviderFactory, StorageProvider, UploadMetadata};
use crate::transfer::{stream_to_file, Connector, EntryKind, RemoteConnection, RemoteEntry};
use crate::utils::{EngineError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Returns scripted readings in order, then repeats the last one.
#[derive(Clone)]
pub struct ScriptedProbe {
    state: Arc<Mutex<(VecDeque<u64>, u64)>>,
    reads: Arc<Mutex<u64>>,
}

impl ScriptedProbe {
    pub fn new(values: Vec<u64>) -> Self {
        let last = values.last().copied().unwrap_or(0);
        Self {
            state: Arc::new(Mutex::new((values.into(), last))),
            reads: Arc::new(Mutex::new(0)),
        }
    }

    pub fn constant(value: u64) -> Self {
        Self::new(vec![value])
    }

    /// Replace the script with a single constant reading.
    pub fn set(&self, value: u64) {
        let mut state = self.state.lock().unwrap();
        state.0.clear();
        state.1 = value;
    }

    pub fn reads(&self) -> u64 {
        *self.reads.lock().unwrap()
    }
}

impl MemoryProbe for ScriptedProbe {
    fn used_bytes(&self) -> u64 {
        *self.reads.lock().unwrap() += 1;
        let mut state = self.state.lock().unwrap();
        match state.0.pop_front() {
            Some(value) => {
                state.1 = value;
                value
            }
            None => state.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DbState {
    tables: BTreeMap<String, u64>,
    estimates: HashMap<String, u64>,
    broken_structure: HashSet<String>,
    failing_fetches: HashSet<(String, u64)>,
    unreachable: bool,
    generation: u64,
    connects: u64,
}

/// In-memory database whose table `t` with `n` rows holds `(i, 'row{i}')`
/// for `i` in `0..n`.
#[derive(Clone, Default)]
pub struct ScriptedDatabase {
    state: Arc<Mutex<DbState>>,
}

impl ScriptedDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(self, name: &str, rows: u64) -> Self {
        self.state.lock().unwrap().tables.insert(name.to_string(), rows);
        self
    }

    /// Report `rows` from `table_stats` whatever the table really holds.
    pub fn estimate(self, name: &str, rows: u64) -> Self {
        self.state.lock().unwrap().estimates.insert(name.to_string(), rows);
        self
    }

    pub fn fail_structure(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .broken_structure
            .insert(name.to_string());
        self
    }

    pub fn fail_fetch_at(self, name: &str, offset: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_fetches
            .insert((name.to_string(), offset));
        self
    }

    pub fn unreachable(self) -> Self {
        self.state.lock().unwrap().unreachable = true;
        self
    }

    /// Kill every open connection; new ones still succeed.
    pub fn kill_connections(&self) {
        self.state.lock().unwrap().generation += 1;
    }

    pub fn connects(&self) -> u64 {
        self.state.lock().unwrap().connects
    }
}

impl DatabaseConnector for ScriptedDatabase {
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(EngineError::Connection("connection refused".into()));
        }
        state.connects += 1;
        Ok(Box::new(ScriptedConnection {
            state: self.state.clone(),
            generation: state.generation,
        }))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

struct ScriptedConnection {
    state: Arc<Mutex<DbState>>,
    generation: u64,
}

impl ScriptedConnection {
    fn rows_of(&self, table: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.generation != self.generation {
            return Err(EngineError::Connection("server has gone away".into()));
        }
        state
            .tables
            .get(table)
            .copied()
            .ok_or_else(|| EngineError::Query(format!("no such table: {table}")))
    }
}

impl DatabaseConnection for ScriptedConnection {
    fn ping(&mut self) -> bool {
        self.state.lock().unwrap().generation == self.generation
    }

    fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().tables.keys().cloned().collect())
    }

    fn table_stats(&mut self, table: &str) -> Result<Option<TableStats>> {
        let rows = self.rows_of(table)?;
        let rows = self
            .state
            .lock()
            .unwrap()
            .estimates
            .get(table)
            .copied()
            .unwrap_or(rows);
        Ok(Some(TableStats {
            rows: Some(rows),
            size_bytes: Some(rows * 100),
        }))
    }

    fn count_rows(&mut self, table: &str) -> Result<u64> {
        self.rows_of(table)
    }

    fn create_statement(&mut self, table: &str) -> Result<String> {
        self.rows_of(table)?;
        if self.state.lock().unwrap().broken_structure.contains(table) {
            return Err(EngineError::Query(format!("SHOW CREATE TABLE {table} denied")));
        }
        Ok(format!("CREATE TABLE \"{table}\" (id INTEGER, v TEXT)"))
    }

    fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        self.rows_of(table)?;
        Ok(vec!["id".into(), "v".into()])
    }

    fn fetch_rows(&mut self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>> {
        let total = self.rows_of(table)?;
        if self
            .state
            .lock()
            .unwrap()
            .failing_fetches
            .contains(&(table.to_string(), offset))
        {
            return Err(EngineError::Query(format!("fetch {table} at {offset} failed")));
        }
        let end = offset.saturating_add(limit).min(total);
        Ok((offset..end)
            .map(|i| vec![SqlValue::Integer(i as i64), SqlValue::Text(format!("row{i}"))])
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Remote file tree
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TreeState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    failing_downloads: HashMap<String, u32>,
    failing_lists: HashSet<String>,
    download_attempts: HashMap<String, u32>,
    refuse: bool,
    generation: u64,
}

fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map(|i| if i == 0 { "/" } else { &trimmed[..i] })
}

/// An in-memory remote file tree reachable through the transfer pool.
#[derive(Clone, Default)]
pub struct MemoryTree {
    state: Arc<Mutex<TreeState>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.files.insert(path.to_string(), data.to_vec());
            let mut current = parent_of(path);
            while let Some(dir) = current {
                state.dirs.insert(dir.to_string());
                current = if dir == "/" { None } else { parent_of(dir) };
            }
        }
        self
    }

    /// Fail the next `times` downloads of `path`.
    pub fn fail_download(self, path: &str, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_downloads
            .insert(path.to_string(), times);
        self
    }

    pub fn fail_list(self, dir: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_lists
            .insert(dir.to_string());
        self
    }

    pub fn refuse_connections(self) -> Self {
        self.state.lock().unwrap().refuse = true;
        self
    }

    pub fn kill_connections(&self) {
        self.state.lock().unwrap().generation += 1;
    }

    pub fn download_attempts(&self, path: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .download_attempts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn connector(&self) -> MemoryTreeConnector {
        MemoryTreeConnector { tree: self.clone() }
    }
}

pub struct MemoryTreeConnector {
    tree: MemoryTree,
}

impl Connector for MemoryTreeConnector {
    fn connect(&self, config: &TransferConfig) -> Result<Box<dyn RemoteConnection>> {
        let state = self.tree.state.lock().unwrap();
        if state.refuse {
            return Err(EngineError::Transfer("connection refused".into()));
        }
        Ok(Box::new(MemoryTreeConnection {
            tree: self.tree.clone(),
            protocol: config.protocol,
            generation: state.generation,
        }))
    }
}

struct MemoryTreeConnection {
    tree: MemoryTree,
    protocol: Protocol,
    generation: u64,
}

impl MemoryTreeConnection {
    fn check(&self) -> Result<()> {
        if self.tree.state.lock().unwrap().generation != self.generation {
            return Err(EngineError::Transfer("connection reset".into()));
        }
        Ok(())
    }
}

impl RemoteConnection for MemoryTreeConnection {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn is_alive(&mut self) -> bool {
        self.check().is_ok()
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.check()?;
        let state = self.tree.state.lock().unwrap();
        let dir = if path == "/" { "/" } else { path.trim_end_matches('/') };
        if state.failing_lists.contains(dir) {
            return Err(EngineError::Transfer(format!("550 {dir}: permission denied")));
        }
        if !state.dirs.contains(dir) {
            return Err(EngineError::Transfer(format!("550 {dir}: no such directory")));
        }
        let name_of = |p: &str| p.rsplit('/').next().unwrap_or(p).to_string();
        let mut entries: Vec<RemoteEntry> = state
            .dirs
            .iter()
            .filter(|d| d.as_str() != dir && parent_of(d) == Some(dir))
            .map(|d| RemoteEntry {
                name: name_of(d),
                kind: EntryKind::Dir,
                size: 0,
            })
            .chain(
                state
                    .files
                    .iter()
                    .filter(|(f, _)| parent_of(f) == Some(dir))
                    .map(|(f, data)| RemoteEntry {
                        name: name_of(f),
                        kind: EntryKind::File,
                        size: data.len() as u64,
                    }),
            )
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        self.check()?;
        let state = self.tree.state.lock().unwrap();
        state
            .files
            .get(path)
            .map(|d| d.len() as u64)
            .ok_or_else(|| EngineError::Transfer(format!("550 {path}: not found")))
    }

    fn download(&mut self, remote: &str, local: &Path, chunk_size: usize) -> Result<u64> {
        self.check()?;
        let data = {
            let mut state = self.tree.state.lock().unwrap();
            *state.download_attempts.entry(remote.to_string()).or_default() += 1;
            if let Some(left) = state.failing_downloads.get_mut(remote) {
                if *left > 0 {
                    *left -= 1;
                    return Err(EngineError::Transfer(format!("426 {remote}: transfer aborted")));
                }
            }
            state
                .files
                .get(remote)
                .cloned()
                .ok_or_else(|| EngineError::Transfer(format!("550 {remote}: not found")))?
        };
        stream_to_file(&mut data.as_slice(), local, chunk_size)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StorageState {
    known: Vec<String>,
    failing: HashSet<String>,
    chunked: HashSet<String>,
    uploads: Vec<(String, String, u64)>,
    chunked_uploads: Vec<String>,
    deletes: Vec<String>,
}

/// Provider factory that records uploads instead of sending them anywhere.
#[derive(Clone, Default)]
pub struct RecordingStorage {
    state: Arc<Mutex<StorageState>>,
}

impl RecordingStorage {
    pub fn new(ids: &[&str]) -> Self {
        let storage = Self::default();
        storage.state.lock().unwrap().known = ids.iter().map(|s| s.to_string()).collect();
        storage
    }

    pub fn failing(self, id: &str) -> Self {
        self.state.lock().unwrap().failing.insert(id.to_string());
        self
    }

    pub fn chunked(self, id: &str) -> Self {
        self.state.lock().unwrap().chunked.insert(id.to_string());
        self
    }

    /// `(destination, name, size)` per successful upload.
    pub fn uploads(&self) -> Vec<(String, String, u64)> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn chunked_uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().chunked_uploads.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }
}

impl ProviderFactory for RecordingStorage {
    fn create(&self, id: &str) -> Result<Box<dyn StorageProvider>> {
        if !self.state.lock().unwrap().known.iter().any(|k| k == id) {
            return Err(EngineError::Storage(format!("unknown destination: {id}")));
        }
        Ok(Box::new(RecordingProvider {
            id: id.to_string(),
            storage: self.clone(),
        }))
    }
}

struct RecordingProvider {
    id: String,
    storage: RecordingStorage,
}

impl StorageProvider for RecordingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn upload(&mut self, local: &Path, name: &str, _metadata: &UploadMetadata) -> Result<String> {
        let mut state = self.storage.state.lock().unwrap();
        if state.failing.contains(&self.id) {
            return Err(EngineError::Storage(format!("{}: quota exceeded", self.id)));
        }
        let size = std::fs::metadata(local)?.len();
        state.uploads.push((self.id.clone(), name.to_string(), size));
        Ok(format!("{}://{}", self.id, name))
    }

    fn supports_chunked(&self) -> bool {
        self.storage.state.lock().unwrap().chunked.contains(&self.id)
    }

    fn upload_chunked(
        &mut self,
        local: &Path,
        name: &str,
        metadata: &UploadMetadata,
        _chunk_size: usize,
    ) -> Result<String> {
        self.storage
            .state
            .lock()
            .unwrap()
            .chunked_uploads
            .push(self.id.clone());
        self.upload(local, name, metadata)
    }

    fn delete(&mut self, reference: &str) -> Result<()> {
        self.storage
            .state
            .lock()
            .unwrap()
            .deletes
            .push(reference.to_string());
        Ok(())
    }
}
