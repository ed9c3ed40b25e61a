//! Error types for the backup engine.
//!
//! Every failure is classified as either recoverable (the unit of work is
//! skipped and processing continues) or critical (the resulting archive would
//! be meaningless and the job must end in `Failed`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database query error: {0}")]
    Query(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Resource exhausted: {used} bytes in use, limit {limit} bytes")]
    ResourceExhausted { used: u64, limit: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid continuation token for job {0}")]
    InvalidToken(String),

    #[error("Unsupported status schema version {found} (expected <= {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// The two tiers of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Recoverable,
    Critical,
}

impl EngineError {
    /// Default severity of this error when it escapes a job-level operation.
    /// Engines may downgrade a failure to recoverable when it only affects a
    /// single row batch, file or directory.
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Query(_) | EngineError::Transfer(_) | EngineError::Storage(_) => {
                Severity::Recoverable
            }
            _ => Severity::Critical,
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, EngineError::ResourceExhausted { .. })
    }
}

impl From<suppaftp::FtpError> for EngineError {
    fn from(err: suppaftp::FtpError) -> Self {
        EngineError::Transfer(format!("FTP: {err}"))
    }
}

impl From<walkdir::Error> for EngineError {
    fn from(err: walkdir::Error) -> Self {
        EngineError::Io(err.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(EngineError::Query("x".into()).severity(), Severity::Recoverable);
        assert_eq!(EngineError::Transfer("x".into()).severity(), Severity::Recoverable);
        assert_eq!(EngineError::Connection("x".into()).severity(), Severity::Critical);
        assert_eq!(EngineError::Archive("x".into()).severity(), Severity::Critical);
        assert_eq!(
            EngineError::ResourceExhausted { used: 2, limit: 1 }.severity(),
            Severity::Critical
        );
    }

    #[test]
    fn test_resource_exhausted_message() {
        let err = EngineError::ResourceExhausted { used: 300, limit: 256 };
        assert!(err.is_resource_exhausted());
        assert_eq!(
            err.to_string(),
            "Resource exhausted: 300 bytes in use, limit 256 bytes"
        );
    }
}
