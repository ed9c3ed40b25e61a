//! SQLite-backed job and history stores shared by the CLI, the continuation
//! endpoint and the stall watcher.

use crate::db::connection::DbPool;
use backup_engine::job::{BackupJob, HistoryEntry, HistoryStore, JobStore};
use backup_engine::{EngineError, Result};
use rusqlite::{params, OptionalExtension};

fn conn_error(err: r2d2::Error) -> EngineError {
    EngineError::Connection(format!("runner database: {err}"))
}

pub struct SqliteJobStore {
    pool: DbPool,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recent jobs first, terminal ones included.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<BackupJob>> {
        let conn = self.pool.get().map_err(conn_error)?;
        let mut stmt =
            conn.prepare("SELECT status_json FROM backup_jobs ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut jobs = Vec::new();
        for raw in rows {
            jobs.push(serde_json::from_str(&raw?)?);
        }
        Ok(jobs)
    }
}

impl JobStore for SqliteJobStore {
    fn save(&mut self, job: &BackupJob) -> Result<()> {
        let conn = self.pool.get().map_err(conn_error)?;
        let status = serde_json::to_string(job)?;
        let phase = serde_json::to_value(job.phase)?;
        conn.execute(
            "INSERT INTO backup_jobs (id, kind, phase, progress, status_json, created_at, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
               phase = excluded.phase,
               progress = excluded.progress,
               status_json = excluded.status_json,
               last_update = excluded.last_update",
            params![
                job.id,
                job.kind.as_str(),
                phase.as_str().unwrap_or_default(),
                job.progress,
                status,
                job.created_at.to_rfc3339(),
                job.last_update.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<BackupJob> {
        let conn = self.pool.get().map_err(conn_error)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT status_json FROM backup_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        let job: BackupJob = serde_json::from_str(&raw)?;
        job.check_schema()?;
        Ok(job)
    }

    fn list_active(&self) -> Result<Vec<BackupJob>> {
        let conn = self.pool.get().map_err(conn_error)?;
        let mut stmt = conn.prepare(
            "SELECT status_json FROM backup_jobs
             WHERE phase IN ('database','files','finalize')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut jobs = Vec::new();
        for raw in rows {
            match serde_json::from_str::<BackupJob>(&raw?) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping unreadable job status: {}", e),
            }
        }
        Ok(jobs)
    }
}

pub struct SqliteHistoryStore {
    pool: DbPool,
}

impl SqliteHistoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<(HistoryEntry, String)> {
    let kind: String = row.get(1)?;
    let created_at: String = row.get(7)?;
    let kind = kind.parse().unwrap_or(backup_engine::JobKind::Full);
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map(|d| d.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());
    Ok((
        HistoryEntry {
            id: row.get(0)?,
            kind,
            file: row.get(2)?,
            size: row.get::<_, i64>(3)? as u64,
            destinations: Vec::new(),
            locked: row.get::<_, i64>(5)? != 0,
            schedule: row.get(6)?,
            created_at,
        },
        row.get(4)?,
    ))
}

impl HistoryStore for SqliteHistoryStore {
    fn append(&mut self, entry: HistoryEntry) -> Result<()> {
        let conn = self.pool.get().map_err(conn_error)?;
        conn.execute(
            "INSERT INTO backup_history (id, kind, file, size, destinations, locked, schedule, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.kind.as_str(),
                entry.file,
                entry.size as i64,
                serde_json::to_string(&entry.destinations)?,
                entry.locked as i64,
                entry.schedule,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get().map_err(conn_error)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM backup_history WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get(&self, id: &str) -> Result<Option<HistoryEntry>> {
        let conn = self.pool.get().map_err(conn_error)?;
        let found = conn
            .query_row(
                "SELECT id, kind, file, size, destinations, locked, schedule, created_at
                 FROM backup_history WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?;
        match found {
            Some((mut entry, destinations)) => {
                entry.destinations = serde_json::from_str(&destinations)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn update(&mut self, entry: HistoryEntry) -> Result<()> {
        let conn = self.pool.get().map_err(conn_error)?;
        let changed = conn.execute(
            "UPDATE backup_history
             SET file = ?2, size = ?3, destinations = ?4, locked = ?5, schedule = ?6
             WHERE id = ?1",
            params![
                entry.id,
                entry.file,
                entry.size as i64,
                serde_json::to_string(&entry.destinations)?,
                entry.locked as i64,
                entry.schedule,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::JobNotFound(entry.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use backup_engine::{JobKind, JobPhase, JobRequest};
    use chrono::Utc;
    use tempfile::TempDir;

    fn pool(dir: &TempDir) -> DbPool {
        let pool = create_pool(&dir.path().join("runner.db").to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();
        pool
    }

    #[test]
    fn test_job_save_load_and_active_filter() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteJobStore::new(pool(&dir));

        let mut job = BackupJob::new(&JobRequest::new(JobKind::Files), dir.path());
        store.save(&job).unwrap();
        assert_eq!(store.list_active().unwrap().len(), 1);

        job.progress = 40;
        job.message = "halfway".into();
        store.save(&job).unwrap();
        let loaded = store.load(&job.id).unwrap();
        assert_eq!(loaded.progress, 40);
        assert_eq!(loaded.message, "halfway");

        job.phase = JobPhase::Completed;
        store.save(&job).unwrap();
        assert!(store.list_active().unwrap().is_empty());
        assert_eq!(store.list_recent(10).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SqliteJobStore::new(pool(&dir));
        assert!(matches!(store.load("nope"), Err(EngineError::JobNotFound(_))));
    }

    #[test]
    fn test_history_roundtrip_and_update() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteHistoryStore::new(pool(&dir));
        let entry = HistoryEntry {
            id: "job-1".into(),
            kind: JobKind::Database,
            file: "job-1.tar.zst".into(),
            size: 512,
            destinations: vec!["local".into()],
            locked: false,
            schedule: Some("nightly".into()),
            created_at: Utc::now(),
        };

        assert!(!store.exists("job-1").unwrap());
        store.append(entry.clone()).unwrap();
        assert!(store.exists("job-1").unwrap());

        let mut stored = store.get("job-1").unwrap().unwrap();
        assert_eq!(stored.kind, JobKind::Database);
        assert_eq!(stored.schedule.as_deref(), Some("nightly"));
        stored.merge_destinations(&["nas".into()]);
        store.update(stored).unwrap();
        assert_eq!(
            store.get("job-1").unwrap().unwrap().destinations,
            vec!["local", "nas"]
        );

        let mut ghost = entry;
        ghost.id = "job-2".into();
        assert!(store.update(ghost).is_err());
    }
}
