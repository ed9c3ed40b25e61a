//! Packs a job work directory into one `.tar.zst` archive.
//!
//! The external `tar` + `zstd` pair is used when both are on `PATH`; otherwise
//! the archive is streamed in-process through `tar::Builder` over a zstd
//! encoder. In-process, files are appended smallest-first in batches capped
//! by byte size, with the compressor flushed between batches, and files above
//! the very-large threshold are appended on their own after a headroom check.

pub mod manifest;

use crate::config::ArchiveSettings;
use crate::files::FILES_DIR;
use crate::memory::MemoryGuard;
use crate::utils::{EngineError, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use manifest::{BackupManifest, FileCounts, MANIFEST_NAME};

/// Directory inside the work dir holding table exports.
pub const DATABASE_DIR: &str = "database";

/// A file to be placed in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    /// `/`-separated name inside the archive
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveBatch {
    Grouped(Vec<ArchiveFile>),
    Solo(ArchiveFile),
}

/// Archive file name: `<prefix>-<kind>-<UTC timestamp>-<short id>.tar.zst`.
pub fn archive_name(prefix: &str, kind: &str, short_id: &str) -> String {
    format!(
        "{}-{}-{}-{}.tar.zst",
        prefix,
        kind,
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        short_id
    )
}

/// Where the archive of job `short_id` is written before it is renamed into
/// place. The name does not depend on time, so a retried build reuses it.
pub fn partial_archive_path(dest_dir: &Path, prefix: &str, short_id: &str) -> PathBuf {
    dest_dir.join(format!("{prefix}-{short_id}.tar.zst.part"))
}

/// Every regular file under `database/` and `files/`, in walk order.
pub fn collect_entries(work_dir: &Path) -> Result<Vec<ArchiveFile>> {
    let mut entries = Vec::new();
    for top in [DATABASE_DIR, FILES_DIR] {
        let root = work_dir.join(top);
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "part") {
                continue;
            }
            let relative = path.strip_prefix(work_dir).map_err(|e| {
                EngineError::Archive(format!("{} outside work dir: {e}", path.display()))
            })?;
            entries.push(ArchiveFile {
                name: relative.to_string_lossy().replace('\\', "/"),
                size: entry.metadata()?.len(),
                path: path.to_path_buf(),
            });
        }
    }
    Ok(entries)
}

/// Sort by size and group into batches of at most `batch_bytes`; files of
/// `very_large_bytes` or more always get a batch of their own.
pub fn plan_batches(mut files: Vec<ArchiveFile>, batch_bytes: u64, very_large_bytes: u64) -> Vec<ArchiveBatch> {
    files.sort_by(|a, b| (a.size, &a.name).cmp(&(b.size, &b.name)));

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;
    for file in files {
        if file.size >= very_large_bytes {
            if !current.is_empty() {
                batches.push(ArchiveBatch::Grouped(std::mem::take(&mut current)));
                current_bytes = 0;
            }
            batches.push(ArchiveBatch::Solo(file));
            continue;
        }
        if !current.is_empty() && current_bytes + file.size > batch_bytes {
            batches.push(ArchiveBatch::Grouped(std::mem::take(&mut current)));
            current_bytes = 0;
        }
        current_bytes += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        batches.push(ArchiveBatch::Grouped(current));
    }
    batches
}

pub struct ArchiveBuilder {
    settings: ArchiveSettings,
    memory: Arc<MemoryGuard>,
}

/// Paths of `tar` and `zstd` when both are installed.
fn external_tools() -> Option<(PathBuf, PathBuf)> {
    let tar = which::which("tar").ok()?;
    let zstd = which::which("zstd").ok()?;
    Some((tar, zstd))
}

impl ArchiveBuilder {
    pub fn new(settings: ArchiveSettings, memory: Arc<MemoryGuard>) -> Self {
        Self { settings, memory }
    }

    /// Build the archive for `work_dir` into `dest_dir` and return its path.
    ///
    /// The archive is written to [`partial_archive_path`] and renamed once
    /// complete. Any failure is job-fatal; the partial archive is removed.
    pub fn build(&self, work_dir: &Path, manifest: &BackupManifest, dest_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dest_dir).map_err(|e| {
            EngineError::Archive(format!("cannot create {}: {e}", dest_dir.display()))
        })?;
        let partial = partial_archive_path(dest_dir, &self.settings.name_prefix, manifest.short_id());
        let archive_path = dest_dir.join(archive_name(
            &self.settings.name_prefix,
            manifest.kind.as_str(),
            manifest.short_id(),
        ));

        let manifest_bytes = manifest.to_json()?;
        std::fs::write(work_dir.join(MANIFEST_NAME), &manifest_bytes)?;

        let mut written = false;
        if self.settings.prefer_external {
            if let Some((tar, zstd)) = external_tools() {
                match self.build_external(&tar, &zstd, work_dir, &partial) {
                    Ok(()) => written = true,
                    Err(e) => {
                        warn!("external tar failed, falling back to in-process archiving: {}", e);
                        let _ = std::fs::remove_file(&partial);
                    }
                }
            } else {
                debug!("tar or zstd not on PATH, archiving in-process");
            }
        }

        if !written {
            if let Err(e) = self.build_in_process(work_dir, &manifest_bytes, &partial) {
                let _ = std::fs::remove_file(&partial);
                return Err(match e {
                    EngineError::ResourceExhausted { .. } | EngineError::Archive(_) => e,
                    other => EngineError::Archive(format!(
                        "writing {} failed: {other}",
                        archive_path.display()
                    )),
                });
            }
        }

        if let Err(e) = std::fs::rename(&partial, &archive_path) {
            let _ = std::fs::remove_file(&partial);
            return Err(EngineError::Archive(format!(
                "cannot move archive to {}: {e}",
                archive_path.display()
            )));
        }
        self.finished(archive_path)
    }

    fn finished(&self, archive_path: PathBuf) -> Result<PathBuf> {
        let size = std::fs::metadata(&archive_path)?.len();
        info!(archive = %archive_path.display(), size, "archive written");
        Ok(archive_path)
    }

    fn build_external(&self, tar: &Path, zstd: &Path, work_dir: &Path, archive_path: &Path) -> Result<()> {
        let mut command = Command::new(tar);
        command
            .arg(format!("--use-compress-program={}", zstd.display()))
            .arg("--exclude=*.part")
            .arg("-cf")
            .arg(archive_path)
            .arg("-C")
            .arg(work_dir)
            .arg(MANIFEST_NAME);
        for top in [DATABASE_DIR, FILES_DIR] {
            if work_dir.join(top).is_dir() {
                command.arg(top);
            }
        }

        let output = command
            .output()
            .map_err(|e| EngineError::Archive(format!("cannot run {}: {e}", tar.display())))?;
        if !output.status.success() {
            return Err(EngineError::Archive(format!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn build_in_process(&self, work_dir: &Path, manifest: &[u8], archive_path: &Path) -> Result<()> {
        let file = File::create(archive_path)?;
        let encoder =
            zstd::stream::write::Encoder::new(BufWriter::new(file), self.settings.compression_level)?;
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST_NAME, manifest)?;

        let entries = collect_entries(work_dir)?;
        let batches = plan_batches(entries, self.settings.batch_bytes, self.settings.very_large_bytes);
        for batch in batches {
            match batch {
                ArchiveBatch::Grouped(files) => {
                    for file in &files {
                        builder.append_path_with_name(&file.path, &file.name)?;
                    }
                    builder.get_mut().flush()?;
                }
                ArchiveBatch::Solo(file) => {
                    builder.get_mut().flush()?;
                    self.memory
                        .ensure_headroom(file.size.min(self.settings.stream_reserve_bytes))?;
                    debug!(file = %file.name, size = file.size, "appending very large file on its own");
                    builder.append_path_with_name(&file.path, &file.name)?;
                    builder.get_mut().flush()?;
                }
            }
        }

        let encoder = builder.into_inner()?;
        let writer = encoder.finish()?;
        let file = writer
            .into_inner()
            .map_err(|e| EngineError::Archive(format!("flush failed: {}", e.error())))?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySettings;
    use crate::job::{BackupJob, JobKind, JobRequest};
    use crate::testing::ScriptedProbe;
    use std::io::Read;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn file(name: &str, size: u64) -> ArchiveFile {
        ArchiveFile {
            path: PathBuf::from(name),
            name: name.to_string(),
            size,
        }
    }

    fn settings() -> ArchiveSettings {
        ArchiveSettings {
            prefer_external: false,
            batch_bytes: 100,
            very_large_bytes: 1_000,
            ..ArchiveSettings::default()
        }
    }

    fn guard(probe: ScriptedProbe, limit_mb: u64) -> Arc<MemoryGuard> {
        Arc::new(MemoryGuard::new(
            Box::new(probe),
            MemorySettings {
                limit_mb: Some(limit_mb),
                ..MemorySettings::default()
            },
        ))
    }

    fn work_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("database")).unwrap();
        std::fs::create_dir_all(root.join("files/wp-content")).unwrap();
        std::fs::write(root.join("database/wp_posts.sql"), b"INSERT INTO x VALUES (1);\n").unwrap();
        std::fs::write(root.join("files/index.php"), b"<?php").unwrap();
        std::fs::write(root.join("files/wp-content/video.mp4"), vec![3u8; 4_000]).unwrap();
        std::fs::write(root.join("files/wp-content/half.bin.part"), b"partial").unwrap();
        std::fs::write(root.join("checkpoint.json"), b"{}").unwrap();
        dir
    }

    fn manifest() -> BackupManifest {
        let job = BackupJob::new(&JobRequest::new(JobKind::Full), Path::new("/tmp"));
        BackupManifest::for_job(&job)
    }

    fn entry_names(archive: &Path) -> Vec<String> {
        let decoder = zstd::stream::read::Decoder::new(File::open(archive).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.header().entry_type().is_file())
            .map(|e| e.path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_plan_batches_groups_by_size() {
        let batches = plan_batches(
            vec![file("c", 60), file("a", 10), file("huge", 5_000), file("b", 50)],
            100,
            1_000,
        );
        assert_eq!(
            batches,
            vec![
                ArchiveBatch::Grouped(vec![file("a", 10), file("b", 50)]),
                ArchiveBatch::Grouped(vec![file("c", 60)]),
                ArchiveBatch::Solo(file("huge", 5_000)),
            ]
        );
    }

    #[test]
    fn test_file_above_cap_is_never_grouped() {
        let batches = plan_batches(vec![file("a", 10), file("big", 1_000)], 10_000, 1_000);
        assert!(matches!(&batches[1], ArchiveBatch::Solo(f) if f.name == "big"));
    }

    #[test]
    fn test_archive_name_format() {
        let name = archive_name("site-backup", "full", "1a2b3c4d");
        assert!(name.starts_with("site-backup-full-"));
        assert!(name.ends_with("-1a2b3c4d.tar.zst"));
    }

    #[test]
    fn test_in_process_archive_layout() {
        let work = work_dir();
        let dest = TempDir::new().unwrap();
        let probe = ScriptedProbe::constant(10 * MIB);
        let builder = ArchiveBuilder::new(settings(), guard(probe.clone(), 256));

        let path = builder.build(work.path(), &manifest(), dest.path()).unwrap();
        let names = entry_names(&path);
        assert_eq!(names[0], MANIFEST_NAME);
        assert_eq!(names.len(), 4);
        assert!(names.contains(&"database/wp_posts.sql".to_string()));
        assert!(names.contains(&"files/wp-content/video.mp4".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".part") || n == "checkpoint.json"));
        // The very large video went through the headroom check.
        assert!(probe.reads() >= 1);
    }

    #[test]
    fn test_manifest_entry_is_readable() {
        let work = work_dir();
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(settings(), guard(ScriptedProbe::constant(MIB), 256));
        let expected = manifest();
        let path = builder.build(work.path(), &expected, dest.path()).unwrap();

        let decoder = zstd::stream::read::Decoder::new(File::open(path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let mut first = archive.entries().unwrap().next().unwrap().unwrap();
        let mut json = String::new();
        first.read_to_string(&mut json).unwrap();
        let parsed: BackupManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id, expected.job_id);
    }

    #[test]
    fn test_failure_removes_partial_archive() {
        let work = work_dir();
        let dest = TempDir::new().unwrap();
        // 1 MiB ceiling almost used up: the 4 000 byte solo file does not fit.
        let builder = ArchiveBuilder::new(settings(), guard(ScriptedProbe::constant(MIB - 100), 1));

        let err = builder.build(work.path(), &manifest(), dest.path()).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_larger_than_ceiling_is_streamed() {
        let work = work_dir();
        let big = work.path().join("files/big.iso");
        File::create(&big).unwrap().set_len(96 * MIB).unwrap();
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(
            ArchiveSettings {
                prefer_external: false,
                very_large_bytes: 32 * MIB,
                ..ArchiveSettings::default()
            },
            guard(ScriptedProbe::constant(16 * MIB), 64),
        );

        let path = builder.build(work.path(), &manifest(), dest.path()).unwrap();
        assert!(entry_names(&path).contains(&"files/big.iso".to_string()));
    }

    #[test]
    fn test_retry_reuses_partial_archive_name() {
        let work = work_dir();
        let dest = TempDir::new().unwrap();
        let manifest = manifest();
        let stale = partial_archive_path(dest.path(), "site-backup", manifest.short_id());
        std::fs::write(&stale, b"left behind by a killed build").unwrap();

        let builder = ArchiveBuilder::new(settings(), guard(ScriptedProbe::constant(MIB), 256));
        let path = builder.build(work.path(), &manifest, dest.path()).unwrap();

        assert!(!stale.exists());
        let names: Vec<_> = std::fs::read_dir(dest.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(names, vec![path]);
    }

    #[test]
    fn test_external_tools_produce_same_entries() {
        if external_tools().is_none() {
            return;
        }
        let work = work_dir();
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(
            ArchiveSettings {
                prefer_external: true,
                ..settings()
            },
            guard(ScriptedProbe::constant(MIB), 256),
        );
        let path = builder.build(work.path(), &manifest(), dest.path()).unwrap();
        let mut names = entry_names(&path);
        assert_eq!(names[0], MANIFEST_NAME);
        names.sort();
        assert_eq!(
            names,
            vec![
                MANIFEST_NAME.to_string(),
                "database/wp_posts.sql".to_string(),
                "files/index.php".to_string(),
                "files/wp-content/video.mp4".to_string(),
            ]
        );
    }
}
