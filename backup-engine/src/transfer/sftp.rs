//! SFTP source over `ssh2`.

use super::{stream_to_file, EntryKind, RemoteConnection, RemoteEntry};
use crate::config::{Protocol, TransferConfig};
use crate::utils::{EngineError, Result};
use ssh2::{Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Credentials and address for an SSH session.
pub struct SshTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
    pub private_key: Option<&'a Path>,
    pub timeout: Duration,
}

/// Connect, handshake and authenticate.
///
/// With a private key the password, if any, is used as its passphrase.
pub fn open_session(target: &SshTarget<'_>) -> Result<Session> {
    let addr = (target.host, target.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| EngineError::Transfer(format!("cannot resolve {}", target.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, target.timeout)?;
    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(target.timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake()?;

    match target.private_key {
        Some(key) => {
            let passphrase = (!target.password.is_empty()).then_some(target.password);
            session.userauth_pubkey_file(target.username, None, key, passphrase)?;
        }
        None => session.userauth_password(target.username, target.password)?,
    }
    if !session.authenticated() {
        return Err(EngineError::Transfer(format!(
            "SSH authentication failed for {}@{}",
            target.username, target.host
        )));
    }
    Ok(session)
}

pub struct SftpConnection {
    sftp: Sftp,
    session: Session,
}

impl SftpConnection {
    pub fn connect(config: &TransferConfig) -> Result<Self> {
        let session = open_session(&SshTarget {
            host: &config.host,
            port: config.port(),
            username: &config.username,
            password: &config.password,
            private_key: config.private_key.as_deref(),
            timeout: config.timeout(),
        })?;
        let sftp = session.sftp()?;
        debug!(host = %config.host, "SFTP session established");
        Ok(Self { sftp, session })
    }
}

impl RemoteConnection for SftpConnection {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    fn is_alive(&mut self) -> bool {
        self.sftp.stat(Path::new(".")).is_ok()
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for (entry_path, stat) in self.sftp.readdir(Path::new(path))? {
            let Some(name) = entry_path.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }
            // Symlinks and special files are neither; they are not backed up.
            if stat.is_dir() {
                entries.push(RemoteEntry {
                    name,
                    kind: EntryKind::Dir,
                    size: 0,
                });
            } else if stat.is_file() {
                entries.push(RemoteEntry {
                    name,
                    kind: EntryKind::File,
                    size: stat.size.unwrap_or(0),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        Ok(self.sftp.stat(Path::new(path))?.size.unwrap_or(0))
    }

    fn download(&mut self, remote: &str, local: &Path, chunk_size: usize) -> Result<u64> {
        let mut source = self.sftp.open(Path::new(remote))?;
        stream_to_file(&mut source, local, chunk_size)
    }

    fn close(&mut self) {
        let _ = self.session.disconnect(None, "backup finished", None);
    }
}
