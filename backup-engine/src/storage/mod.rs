//! Replication of finished archives to storage destinations.
//!
//! `local` is the archive directory itself and always counts as satisfied.
//! Every other destination id is resolved through a [`ProviderFactory`];
//! a failing destination is recorded and never aborts the others.

pub mod directory;
pub mod sftp;

use crate::config::{ProviderConfig, StorageSettings};
use crate::job::{JobKind, LOCAL_DESTINATION};
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub use directory::DirectoryProvider;
pub use sftp::SftpProvider;

/// Metadata passed along with an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub job_id: String,
    pub kind: JobKind,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// A remote storage backend.
pub trait StorageProvider: Send {
    fn id(&self) -> &str;

    fn initialize(&mut self) -> Result<()>;

    /// Upload `local` as `name`; returns a reference usable with [`delete`](Self::delete).
    fn upload(&mut self, local: &Path, name: &str, metadata: &UploadMetadata) -> Result<String>;

    fn supports_chunked(&self) -> bool {
        false
    }

    fn upload_chunked(
        &mut self,
        local: &Path,
        name: &str,
        metadata: &UploadMetadata,
        _chunk_size: usize,
    ) -> Result<String> {
        self.upload(local, name, metadata)
    }

    fn delete(&mut self, reference: &str) -> Result<()>;
}

/// Resolves destination ids to providers.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, id: &str) -> Result<Box<dyn StorageProvider>>;
}

/// Factory over the `[[storage.providers]]` configuration.
pub struct ConfiguredProviders {
    providers: Vec<ProviderConfig>,
    timeout: Duration,
}

impl ConfiguredProviders {
    pub fn new(settings: &StorageSettings, timeout: Duration) -> Self {
        Self {
            providers: settings.providers.clone(),
            timeout,
        }
    }
}

impl ProviderFactory for ConfiguredProviders {
    fn create(&self, id: &str) -> Result<Box<dyn StorageProvider>> {
        let config = self
            .providers
            .iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| EngineError::Storage(format!("unknown destination: {id}")))?;
        let provider: Box<dyn StorageProvider> = match config {
            ProviderConfig::Directory { id, path } => Box::new(DirectoryProvider::new(id, path)),
            ProviderConfig::Sftp { .. } => Box::new(SftpProvider::from_config(config, self.timeout)?),
        };
        Ok(provider)
    }
}

/// Outcome of one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationResult {
    pub destination: String,
    pub success: bool,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub chunked: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub results: Vec<DestinationResult>,
    /// Destinations holding the archive, `local` first
    pub uploaded_to: Vec<String>,
    /// First successful non-local destination
    pub primary: Option<String>,
}

impl UploadReport {
    pub fn failures(&self) -> impl Iterator<Item = &DestinationResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

pub struct UploadDispatcher<'a> {
    factory: &'a dyn ProviderFactory,
    chunk_threshold: u64,
    chunk_size: usize,
}

impl<'a> UploadDispatcher<'a> {
    pub fn new(factory: &'a dyn ProviderFactory, settings: &StorageSettings) -> Self {
        Self {
            factory,
            chunk_threshold: settings.chunk_threshold,
            chunk_size: settings.upload_chunk_size,
        }
    }

    /// Send `archive` to each destination in order.
    pub fn upload(&self, archive: &Path, destinations: &[String], metadata: &UploadMetadata) -> UploadReport {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.tar.zst", metadata.job_id));

        let mut report = UploadReport {
            results: vec![DestinationResult {
                destination: LOCAL_DESTINATION.to_string(),
                success: true,
                reference: Some(archive.display().to_string()),
                error: None,
                chunked: false,
                at: Utc::now(),
            }],
            uploaded_to: vec![LOCAL_DESTINATION.to_string()],
            primary: None,
        };

        let mut seen: Vec<&str> = Vec::new();
        for dest in destinations {
            let dest = dest.trim();
            if dest.is_empty() || dest == LOCAL_DESTINATION || seen.contains(&dest) {
                continue;
            }
            seen.push(dest);

            match self.upload_one(dest, archive, &name, metadata) {
                Ok((reference, chunked)) => {
                    info!(destination = dest, reference = %reference, chunked, "archive uploaded");
                    report.uploaded_to.push(dest.to_string());
                    report.primary.get_or_insert_with(|| dest.to_string());
                    report.results.push(DestinationResult {
                        destination: dest.to_string(),
                        success: true,
                        reference: Some(reference),
                        error: None,
                        chunked,
                        at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(destination = dest, "upload failed: {}", e);
                    report.results.push(DestinationResult {
                        destination: dest.to_string(),
                        success: false,
                        reference: None,
                        error: Some(e.to_string()),
                        chunked: false,
                        at: Utc::now(),
                    });
                }
            }
        }
        report
    }

    fn upload_one(
        &self,
        dest: &str,
        archive: &Path,
        name: &str,
        metadata: &UploadMetadata,
    ) -> Result<(String, bool)> {
        let mut provider = self.factory.create(dest)?;
        provider.initialize()?;
        let size = std::fs::metadata(archive)?.len();
        if size > self.chunk_threshold && provider.supports_chunked() {
            let reference = provider.upload_chunked(archive, name, metadata, self.chunk_size)?;
            Ok((reference, true))
        } else {
            Ok((provider.upload(archive, name, metadata)?, false))
        }
    }

    /// Remove a previously uploaded archive from `dest`.
    pub fn delete(&self, dest: &str, reference: &str) -> Result<()> {
        let mut provider = self.factory.create(dest)?;
        provider.initialize()?;
        provider.delete(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStorage;
    use tempfile::TempDir;

    fn metadata() -> UploadMetadata {
        UploadMetadata {
            job_id: "job-1".into(),
            kind: JobKind::Full,
            size: 0,
            created_at: Utc::now(),
        }
    }

    fn archive(dir: &TempDir, size: usize) -> std::path::PathBuf {
        let path = dir.path().join("site-backup-full-x.tar.zst");
        std::fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    fn settings(threshold: u64) -> StorageSettings {
        StorageSettings {
            chunk_threshold: threshold,
            ..StorageSettings::default()
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_local_only() {
        let dir = TempDir::new().unwrap();
        let storage = RecordingStorage::new(&[]);
        let report = UploadDispatcher::new(&storage, &settings(1_000))
            .upload(&archive(&dir, 10), &[], &metadata());
        assert_eq!(report.uploaded_to, vec!["local"]);
        assert_eq!(report.primary, None);
        assert_eq!(report.results.len(), 1);
    }

    #[test]
    fn test_failures_are_isolated_and_primary_is_first_success() {
        let dir = TempDir::new().unwrap();
        let storage = RecordingStorage::new(&["nas", "s3", "backup-box"]).failing("nas");
        let report = UploadDispatcher::new(&storage, &settings(1_000)).upload(
            &archive(&dir, 10),
            &ids(&["local", "nas", "s3", "ghost", "backup-box", "s3"]),
            &metadata(),
        );

        assert_eq!(report.uploaded_to, vec!["local", "s3", "backup-box"]);
        assert_eq!(report.primary.as_deref(), Some("s3"));
        let failed: Vec<&str> = report.failures().map(|r| r.destination.as_str()).collect();
        assert_eq!(failed, vec!["nas", "ghost"]);
        assert_eq!(storage.uploads().len(), 2);
    }

    #[test]
    fn test_chunked_upload_above_threshold() {
        let dir = TempDir::new().unwrap();
        let storage = RecordingStorage::new(&["nas", "plain"]).chunked("nas");
        let path = archive(&dir, 5_000);
        let report = UploadDispatcher::new(&storage, &settings(1_000))
            .upload(&path, &ids(&["nas", "plain"]), &metadata());

        assert_eq!(storage.chunked_uploads(), vec!["nas"]);
        assert!(report.results[1].chunked);
        assert!(!report.results[2].chunked);
    }

    #[test]
    fn test_delete_goes_through_provider() {
        let storage = RecordingStorage::new(&["nas"]);
        let dispatcher = UploadDispatcher::new(&storage, &settings(1_000));
        dispatcher.delete("nas", "nas://old.tar.zst").unwrap();
        assert_eq!(storage.deletes(), vec!["nas://old.tar.zst"]);
        assert!(dispatcher.delete("ghost", "x").is_err());
    }

    #[test]
    fn test_configured_providers_resolve_directory() {
        let dir = TempDir::new().unwrap();
        let settings = StorageSettings {
            providers: vec![ProviderConfig::Directory {
                id: "mirror".into(),
                path: dir.path().join("mirror"),
            }],
            ..StorageSettings::default()
        };
        let factory = ConfiguredProviders::new(&settings, Duration::from_secs(5));
        assert_eq!(factory.create("mirror").unwrap().id(), "mirror");
        assert!(factory.create("nope").is_err());
    }
}
