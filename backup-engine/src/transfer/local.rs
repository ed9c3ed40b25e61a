//! Local filesystem source.

use super::{stream_to_file, EntryKind, RemoteConnection, RemoteEntry};
use crate::config::Protocol;
use crate::utils::Result;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LocalConnection;

impl LocalConnection {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteConnection for LocalConnection {
    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Follow symlinks to their target; broken ones are skipped.
            let Ok(metadata) = std::fs::metadata(entry.path()) else {
                continue;
            };
            let is_symlink = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            if metadata.is_dir() {
                // Directory symlinks are not followed to avoid cycles.
                if !is_symlink {
                    entries.push(RemoteEntry {
                        name,
                        kind: EntryKind::Dir,
                        size: 0,
                    });
                }
            } else if metadata.is_file() {
                entries.push(RemoteEntry {
                    name,
                    kind: EntryKind::File,
                    size: metadata.len(),
                });
            } else {
                // FIFOs, sockets and device nodes would block or never end.
                debug!(path = %entry.path().display(), "skipping special file");
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn download(&mut self, remote: &str, local: &Path, chunk_size: usize) -> Result<u64> {
        let mut source = std::fs::File::open(remote)?;
        stream_to_file(&mut source, local, chunk_size)
    }

    fn test(&mut self) -> Result<()> {
        std::fs::metadata(".")?;
        Ok(())
    }
}
