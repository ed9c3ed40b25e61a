//! Site Backup Engine Library
//!
//! Resumable, memory-aware backups of a site's database and file tree: each
//! call does a bounded amount of work, persists the job and can be resumed by
//! any later call.

pub mod archive;
pub mod config;
pub mod database;
pub mod files;
pub mod job;
pub mod memory;
pub mod orchestrator;
pub mod progress;
pub mod storage;
pub mod throttle;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::EngineConfig;
pub use job::{BackupJob, JobKind, JobPhase, JobRequest};
pub use orchestrator::BackupOrchestrator;
pub use utils::errors::{EngineError, Severity};
pub use utils::Result;
