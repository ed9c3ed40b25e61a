//! Destination that is another mounted directory.

use super::{StorageProvider, UploadMetadata};
use crate::utils::{EngineError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 1024 * 1024;

pub struct DirectoryProvider {
    id: String,
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(id: &str, root: &Path) -> Self {
        Self {
            id: id.to_string(),
            root: root.to_path_buf(),
        }
    }

    fn copy(&self, local: &Path, name: &str, chunk_size: usize) -> Result<String> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(EngineError::Storage(format!("invalid archive name: {name}")));
        }
        let target = self.root.join(name);
        let part = self.root.join(format!("{name}.part"));

        let result = (|| -> std::io::Result<()> {
            let mut source = File::open(local)?;
            let mut dest = File::create(&part)?;
            let mut buffer = vec![0u8; chunk_size.max(4096)];
            loop {
                let read = source.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                dest.write_all(&buffer[..read])?;
            }
            dest.sync_all()?;
            std::fs::rename(&part, &target)
        })();

        match result {
            Ok(()) => Ok(target.display().to_string()),
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                Err(EngineError::Storage(format!("{}: copy to {} failed: {e}", self.id, target.display())))
            }
        }
    }
}

impl StorageProvider for DirectoryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            EngineError::Storage(format!("{}: cannot create {}: {e}", self.id, self.root.display()))
        })
    }

    fn upload(&mut self, local: &Path, name: &str, _metadata: &UploadMetadata) -> Result<String> {
        self.copy(local, name, COPY_CHUNK)
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
        self.copy(local, name, chunk_size)
    }

    fn delete(&mut self, reference: &str) -> Result<()> {
        let path = Path::new(reference);
        if path.parent() != Some(self.root.as_path()) {
            return Err(EngineError::Storage(format!(
                "{}: {reference} is not inside {}",
                self.id,
                self.root.display()
            )));
        }
        std::fs::remove_file(path)
            .map_err(|e| EngineError::Storage(format!("{}: cannot delete {reference}: {e}", self.id)))
    }
}
