use crate::db::connection::DbPool;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_jobs (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('database','files','full')),
  phase TEXT NOT NULL CHECK(phase IN ('database','files','finalize','completed','failed','cancelled')),
  progress INTEGER NOT NULL DEFAULT 0,
  status_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  last_update TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_history (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('database','files','full')),
  file TEXT NOT NULL,
  size INTEGER NOT NULL DEFAULT 0,
  destinations TEXT NOT NULL DEFAULT '[]',
  locked INTEGER NOT NULL DEFAULT 0,
  schedule TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_jobs_phase ON backup_jobs(phase);
CREATE INDEX IF NOT EXISTS idx_backup_history_created ON backup_history(created_at DESC);
"#;

fn has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(columns.iter().any(|c| c == column))
}

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    if !has_column(&conn, "backup_jobs", "progress")? {
        conn.execute_batch(
            "ALTER TABLE backup_jobs ADD COLUMN progress INTEGER NOT NULL DEFAULT 0",
        )?;
    }
    if !has_column(&conn, "backup_history", "schedule")? {
        conn.execute_batch("ALTER TABLE backup_history ADD COLUMN schedule TEXT")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
