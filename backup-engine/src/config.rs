//! Configuration management for the backup engine.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! [`EngineConfig::default`]) yields a working configuration.

use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub files: FileSettings,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Parent of every job's scratch directory
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// Where finished archives are kept (the implicit `local` destination)
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Status files for the JSON job store
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,
}

/// Speed preset used to derive the database fan-out when it is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl Speed {
    pub fn concurrent_tables(self) -> usize {
        match self {
            Speed::Slow => 1,
            Speed::Normal => 2,
            Speed::Fast => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub speed: Speed,

    /// Explicit fan-out; overrides `speed` when set
    #[serde(default)]
    pub concurrent_tables: Option<usize>,

    #[serde(default = "default_db_base_batch")]
    pub base_batch_size: usize,

    #[serde(default = "default_db_min_batch")]
    pub min_batch_size: usize,

    #[serde(default = "default_db_max_batch")]
    pub max_batch_size: usize,

    /// Target wall-clock seconds for one data batch
    #[serde(default = "default_db_target_batch_secs")]
    pub target_batch_secs: f64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,

    /// Tables to leave out entirely
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl DatabaseSettings {
    pub fn fan_out(&self) -> usize {
        self.concurrent_tables
            .unwrap_or_else(|| self.speed.concurrent_tables())
            .max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSettings {
    /// Source roots, relative to the transfer root
    #[serde(default = "default_roots")]
    pub roots: Vec<String>,

    /// User exclusions: relative-path prefixes or bare names
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default = "default_file_initial_batch")]
    pub initial_batch_size: usize,

    #[serde(default = "default_file_min_batch")]
    pub min_batch_size: usize,

    #[serde(default = "default_file_max_batch")]
    pub max_batch_size: usize,

    #[serde(default = "default_file_target_batch_secs")]
    pub target_batch_secs: f64,

    /// Files below this size are "small"
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: u64,

    /// Files at or above this size are "large" and fetched one per step
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u64,

    /// Files above this size are skipped
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_dirs_per_step")]
    pub dirs_per_step: usize,

    /// Seconds between checkpoints
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Wall-clock budget of one advance call
    #[serde(default = "default_step_budget_secs")]
    pub step_budget_secs: u64,
}

impl FileSettings {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn step_budget(&self) -> Duration {
        Duration::from_secs(self.step_budget_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Local,
    Ftp,
    Sftp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Local => write!(f, "local"),
            Protocol::Ftp => write!(f, "ftp"),
            Protocol::Sftp => write!(f, "sftp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Private key for SFTP public-key authentication
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Root of the site on the source side
    #[serde(default = "default_site_root")]
    pub root: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_connection_ttl_secs")]
    pub connection_ttl_secs: u64,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl TransferConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.protocol {
            Protocol::Ftp => 21,
            Protocol::Sftp => 22,
            Protocol::Local => 0,
        })
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Use `tar` + `zstd` from PATH when both are present
    #[serde(default = "default_true")]
    pub prefer_external: bool,

    #[serde(default = "default_archive_batch_bytes")]
    pub batch_bytes: u64,

    #[serde(default = "default_very_large_bytes")]
    pub very_large_bytes: u64,

    /// Memory reserved while streaming one very large file: tar copy buffer,
    /// compressor context and window. The file itself is never held in memory.
    #[serde(default = "default_stream_reserve_bytes")]
    pub stream_reserve_bytes: u64,

    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    #[serde(default = "default_archive_prefix")]
    pub name_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Destination ids, in upload order (`local` is implicit)
    #[serde(default)]
    pub destinations: Vec<String>,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,

    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Directory {
        id: String,
        path: PathBuf,
    },
    Sftp {
        id: String,
        host: String,
        #[serde(default)]
        port: Option<u16>,
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        private_key: Option<PathBuf>,
        remote_dir: String,
    },
}

impl ProviderConfig {
    pub fn id(&self) -> &str {
        match self {
            ProviderConfig::Directory { id, .. } | ProviderConfig::Sftp { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Process memory ceiling; `None` derives it from RLIMIT_AS or falls back to 256 MiB
    #[serde(default)]
    pub limit_mb: Option<u64>,

    /// Ratio above which batches are halved and relief runs
    #[serde(default = "default_high_water")]
    pub high_water: f64,

    /// Ratio below which batches may grow
    #[serde(default = "default_low_water")]
    pub low_water: f64,

    /// Ratio that still holds after relief fails the step
    #[serde(default = "default_critical_water")]
    pub critical_water: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Seconds without an update after which a running job counts as stalled
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,

    /// Budget for `drive` when the caller does not supply one
    #[serde(default = "default_drive_budget_secs")]
    pub drive_budget_secs: u64,

    #[serde(default = "default_max_recorded_errors")]
    pub max_recorded_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_work_root() -> PathBuf {
    PathBuf::from("/var/lib/site-backup/work")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/lib/site-backup/archives")
}

fn default_status_dir() -> PathBuf {
    PathBuf::from("/var/lib/site-backup/status")
}

fn default_site_root() -> PathBuf {
    PathBuf::from("/var/www/html")
}

fn default_db_base_batch() -> usize {
    1000
}

fn default_db_min_batch() -> usize {
    100
}

fn default_db_max_batch() -> usize {
    10_000
}

fn default_db_target_batch_secs() -> f64 {
    2.0
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_max_batch_retries() -> u32 {
    2
}

fn default_roots() -> Vec<String> {
    vec![String::new()]
}

fn default_file_initial_batch() -> usize {
    50
}

fn default_file_min_batch() -> usize {
    10
}

fn default_file_max_batch() -> usize {
    500
}

fn default_file_target_batch_secs() -> f64 {
    5.0
}

fn default_medium_threshold() -> u64 {
    MIB
}

fn default_large_threshold() -> u64 {
    20 * MIB
}

fn default_max_file_size() -> u64 {
    2048 * MIB
}

fn default_max_retries() -> u32 {
    3
}

fn default_dirs_per_step() -> usize {
    20
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_step_budget_secs() -> u64 {
    20
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_connection_ttl_secs() -> u64 {
    120
}

fn default_pool_size() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_archive_batch_bytes() -> u64 {
    50 * MIB
}

fn default_very_large_bytes() -> u64 {
    100 * MIB
}

fn default_stream_reserve_bytes() -> u64 {
    16 * MIB
}

fn default_compression_level() -> i32 {
    3
}

fn default_archive_prefix() -> String {
    "site-backup".to_string()
}

fn default_chunk_threshold() -> u64 {
    100 * MIB
}

fn default_upload_chunk_size() -> usize {
    8 * 1024 * 1024
}

fn default_high_water() -> f64 {
    0.80
}

fn default_low_water() -> f64 {
    0.50
}

fn default_critical_water() -> f64 {
    0.95
}

fn default_stall_after_secs() -> u64 {
    90
}

fn default_drive_budget_secs() -> u64 {
    25
}

fn default_max_recorded_errors() -> usize {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            archive_dir: default_archive_dir(),
            status_dir: default_status_dir(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            speed: Speed::default(),
            concurrent_tables: None,
            base_batch_size: default_db_base_batch(),
            min_batch_size: default_db_min_batch(),
            max_batch_size: default_db_max_batch(),
            target_batch_secs: default_db_target_batch_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            max_batch_retries: default_max_batch_retries(),
            exclude_tables: Vec::new(),
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            exclude: Vec::new(),
            initial_batch_size: default_file_initial_batch(),
            min_batch_size: default_file_min_batch(),
            max_batch_size: default_file_max_batch(),
            target_batch_secs: default_file_target_batch_secs(),
            medium_threshold: default_medium_threshold(),
            large_threshold: default_large_threshold(),
            max_file_size: default_max_file_size(),
            max_retries: default_max_retries(),
            dirs_per_step: default_dirs_per_step(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            step_budget_secs: default_step_budget_secs(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            host: String::new(),
            port: None,
            username: String::new(),
            password: String::new(),
            private_key: None,
            root: default_site_root(),
            chunk_size: default_chunk_size(),
            connection_ttl_secs: default_connection_ttl_secs(),
            pool_size: default_pool_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            prefer_external: true,
            batch_bytes: default_archive_batch_bytes(),
            very_large_bytes: default_very_large_bytes(),
            stream_reserve_bytes: default_stream_reserve_bytes(),
            compression_level: default_compression_level(),
            name_prefix: default_archive_prefix(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            providers: Vec::new(),
            chunk_threshold: default_chunk_threshold(),
            upload_chunk_size: default_upload_chunk_size(),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            limit_mb: None,
            high_water: default_high_water(),
            low_water: default_low_water(),
            critical_water: default_critical_water(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stall_after_secs: default_stall_after_secs(),
            drive_budget_secs: default_drive_budget_secs(),
            max_recorded_errors: default_max_recorded_errors(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engines cannot honour.
    pub fn validate(&self) -> Result<()> {
        let db = &self.database;
        if db.min_batch_size == 0 || db.min_batch_size > db.max_batch_size {
            return Err(EngineError::Config(format!(
                "database batch bounds invalid: [{}, {}]",
                db.min_batch_size, db.max_batch_size
            )));
        }
        let files = &self.files;
        if files.min_batch_size == 0 || files.min_batch_size > files.max_batch_size {
            return Err(EngineError::Config(format!(
                "file batch bounds invalid: [{}, {}]",
                files.min_batch_size, files.max_batch_size
            )));
        }
        if files.medium_threshold > files.large_threshold {
            return Err(EngineError::Config(
                "medium_threshold must not exceed large_threshold".into(),
            ));
        }
        if self.transfer.chunk_size == 0 || self.storage.upload_chunk_size == 0 {
            return Err(EngineError::Config("chunk sizes must be positive".into()));
        }
        let mem = &self.memory;
        if !(0.0 < mem.low_water && mem.low_water < mem.high_water && mem.high_water <= mem.critical_water)
        {
            return Err(EngineError::Config(format!(
                "memory watermarks must satisfy 0 < low < high <= critical (got {}, {}, {})",
                mem.low_water, mem.high_water, mem.critical_water
            )));
        }
        Ok(())
    }
}
