//! FTP source over `suppaftp`.

use super::{stream_to_file, EntryKind, RemoteConnection, RemoteEntry};
use crate::config::{Protocol, TransferConfig};
use crate::utils::{EngineError, Result};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::str::FromStr;
use suppaftp::list::File as ListedFile;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tracing::debug;

pub struct FtpConnection {
    stream: FtpStream,
}

impl FtpConnection {
    pub fn connect(config: &TransferConfig) -> Result<Self> {
        let addr = (config.host.as_str(), config.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EngineError::Transfer(format!("cannot resolve {}", config.host)))?;
        let mut stream = FtpStream::connect_timeout(addr, config.timeout())?;
        stream.login(&config.username, &config.password)?;
        stream.transfer_type(FileType::Binary)?;
        debug!(host = %config.host, "FTP session established");
        Ok(Self { stream })
    }
}

/// Normalise a LIST response; UNIX and DOS formats are both accepted.
pub fn parse_listing(lines: &[String]) -> Vec<RemoteEntry> {
    lines
        .iter()
        .filter_map(|line| match ListedFile::from_str(line) {
            Ok(file) => Some(file),
            Err(_) => {
                debug!(line = %line, "unparseable FTP listing line");
                None
            }
        })
        .filter(|file| file.name() != "." && file.name() != ".." && !file.is_symlink())
        .map(|file| RemoteEntry {
            name: file.name().to_string(),
            kind: if file.is_directory() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: if file.is_directory() { 0 } else { file.size() as u64 },
        })
        .collect()
}

impl RemoteConnection for FtpConnection {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    fn is_alive(&mut self) -> bool {
        self.stream.noop().is_ok()
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let lines = self.stream.list(Some(path))?;
        Ok(parse_listing(&lines))
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        Ok(self.stream.size(path)? as u64)
    }

    fn download(&mut self, remote: &str, local: &Path, chunk_size: usize) -> Result<u64> {
        let mut reader = self.stream.retr_as_stream(remote)?;
        let written = stream_to_file(&mut reader, local, chunk_size)?;
        self.stream.finalize_retr_stream(reader)?;
        Ok(written)
    }

    fn test(&mut self) -> Result<()> {
        self.stream.pwd()?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.quit();
    }
}
