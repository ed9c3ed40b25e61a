//! Destination reached over SFTP.

use super::{StorageProvider, UploadMetadata};
use crate::config::ProviderConfig;
use crate::transfer::sftp::{open_session, SshTarget};
use crate::utils::{EngineError, Result};
use ssh2::{RenameFlags, Session, Sftp};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_CHUNK: usize = 256 * 1024;

pub struct SftpProvider {
    id: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    private_key: Option<PathBuf>,
    remote_dir: String,
    timeout: Duration,
    connection: Option<(Session, Sftp)>,
}

impl SftpProvider {
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        match config {
            ProviderConfig::Sftp {
                id,
                host,
                port,
                username,
                password,
                private_key,
                remote_dir,
            } => Ok(Self {
                id: id.clone(),
                host: host.clone(),
                port: port.unwrap_or(22),
                username: username.clone(),
                password: password.clone(),
                private_key: private_key.clone(),
                remote_dir: remote_dir.trim_end_matches('/').to_string(),
                timeout,
                connection: None,
            }),
            other => Err(EngineError::Config(format!(
                "provider {} is not an sftp destination",
                other.id()
            ))),
        }
    }

    fn sftp(&self) -> Result<&Sftp> {
        self.connection
            .as_ref()
            .map(|(_, sftp)| sftp)
            .ok_or_else(|| EngineError::Storage(format!("{}: not initialized", self.id)))
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir, name)
    }

    fn put(&self, local: &Path, name: &str, chunk_size: usize) -> Result<String> {
        let sftp = self.sftp()?;
        let final_path = self.remote_path(name);
        let part_path = format!("{final_path}.part");

        let mut source = File::open(local)?;
        let mut remote = sftp.create(Path::new(&part_path))?;
        let mut buffer = vec![0u8; chunk_size.max(4096)];
        loop {
            let read = source.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            remote.write_all(&buffer[..read])?;
        }
        drop(remote);

        sftp.rename(
            Path::new(&part_path),
            Path::new(&final_path),
            Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC),
        )?;
        Ok(final_path)
    }
}

impl StorageProvider for SftpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let session = open_session(&SshTarget {
            host: &self.host,
            port: self.port,
            username: &self.username,
            password: &self.password,
            private_key: self.private_key.as_deref(),
            timeout: self.timeout,
        })?;
        let sftp = session.sftp()?;
        let dir = Path::new(&self.remote_dir);
        if sftp.stat(dir).is_err() {
            debug!(destination = %self.id, dir = %self.remote_dir, "creating remote directory");
            sftp.mkdir(dir, 0o755)?;
        }
        self.connection = Some((session, sftp));
        Ok(())
    }

    fn upload(&mut self, local: &Path, name: &str, _metadata: &UploadMetadata) -> Result<String> {
        self.put(local, name, DEFAULT_CHUNK)
    }

    fn supports_chunked(&self) -> bool {
        true
    }

    fn upload_chunked(
        &mut self,
        local: &Path,
        name: &str,
        _metadata: &UploadMetadata,
        chunk_size: usize,
    ) -> Result<String> {
        self.put(local, name, chunk_size)
    }

    fn delete(&mut self, reference: &str) -> Result<()> {
        let prefix = format!("{}/", self.remote_dir);
        if !reference.starts_with(&prefix) {
            return Err(EngineError::Storage(format!(
                "{}: {reference} is not inside {}",
                self.id, self.remote_dir
            )));
        }
        self.sftp()?.unlink(Path::new(reference))?;
        Ok(())
    }
}

impl Drop for SftpProvider {
    fn drop(&mut self) {
        if let Some((session, _)) = self.connection.take() {
            let _ = session.disconnect(None, "upload finished", None);
        }
    }
}
