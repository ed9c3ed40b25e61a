//! SQLite implementation of the database collaborator.

use super::{sql, DatabaseConnection, DatabaseConnector, SqlValue, TableStats};
use crate::utils::{EngineError, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConnector for SqliteConnector {
    fn connect(&self) -> Result<Box<dyn DatabaseConnection>> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            EngineError::Connection(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    fn without_rowid(&self, table: &str) -> Result<bool> {
        let sql: Option<String> = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(sql
            .map(|s| s.to_ascii_uppercase().contains("WITHOUT ROWID"))
            .unwrap_or(false))
    }
}

fn to_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

impl DatabaseConnection for SqliteConnection {
    fn ping(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn list_tables(&mut self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn table_stats(&mut self, table: &str) -> Result<Option<TableStats>> {
        // sqlite_stat1 only exists after ANALYZE; dbstat only when compiled in.
        let rows: Option<u64> = self
            .conn
            .query_row(
                "SELECT stat FROM sqlite_stat1 WHERE tbl = ?1 ORDER BY idx IS NOT NULL LIMIT 1",
                params![table],
                |row| row.get::<_, String>(0),
            )
            .ok()
            .and_then(|stat| stat.split_whitespace().next()?.parse().ok());
        let size_bytes: Option<u64> = self
            .conn
            .query_row(
                "SELECT SUM(pgsize) FROM dbstat WHERE name = ?1",
                params![table],
                |row| row.get::<_, Option<i64>>(0),
            )
            .ok()
            .flatten()
            .map(|s| s.max(0) as u64);

        if rows.is_none() && size_bytes.is_none() {
            return Ok(None);
        }
        Ok(Some(TableStats { rows, size_bytes }))
    }

    fn count_rows(&mut self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", sql::quote_identifier(table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| EngineError::Query(format!("count {table}: {e}")))?;
        Ok(count.max(0) as u64)
    }

    fn create_statement(&mut self, table: &str) -> Result<String> {
        let sql: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        sql.flatten()
            .ok_or_else(|| EngineError::Query(format!("no CREATE statement for table {table}")))
    }

    fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({})", sql::quote_identifier(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let columns: Vec<String> = rows.collect::<std::result::Result<_, _>>()?;
        if columns.is_empty() {
            return Err(EngineError::Query(format!("table {table} has no columns")));
        }
        Ok(columns)
    }

    fn fetch_rows(&mut self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>> {
        let order = if self.without_rowid(table)? {
            ""
        } else {
            " ORDER BY rowid"
        };
        let sql = format!(
            "SELECT * FROM {}{} LIMIT ?1 OFFSET ?2",
            sql::quote_identifier(table),
            order
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| EngineError::Query(format!("prepare fetch {table}: {e}")))?;
        let width = stmt.column_count();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let mut rows = stmt
            .query(params![limit, offset])
            .map_err(|e| EngineError::Query(format!("fetch {table}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| EngineError::Query(format!("fetch {table}: {e}")))?
        {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(to_value(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("site.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE wp_options (id INTEGER PRIMARY KEY, name TEXT, value BLOB);
             INSERT INTO wp_options (name, value) VALUES ('siteurl', X'0102');
             INSERT INTO wp_options (name, value) VALUES ('blogname', NULL);
             INSERT INTO wp_options (name, value) VALUES ('o''brien', NULL);
             CREATE TABLE empty_table (id INTEGER);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_introspection() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(seed(&dir));
        let mut conn = connector.connect().unwrap();

        assert!(conn.ping());
        assert_eq!(conn.list_tables().unwrap(), vec!["empty_table", "wp_options"]);
        assert_eq!(conn.count_rows("wp_options").unwrap(), 3);
        assert_eq!(conn.count_rows("empty_table").unwrap(), 0);
        assert_eq!(conn.columns("wp_options").unwrap(), vec!["id", "name", "value"]);
        assert!(conn
            .create_statement("wp_options")
            .unwrap()
            .starts_with("CREATE TABLE wp_options"));
    }

    #[test]
    fn test_paged_fetch_is_ordered() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(seed(&dir));
        let mut conn = connector.connect().unwrap();

        let first = conn.fetch_rows("wp_options", 0, 2).unwrap();
        let second = conn.fetch_rows("wp_options", 2, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0][0], SqlValue::Integer(1));
        assert_eq!(first[0][2], SqlValue::Blob(vec![1, 2]));
        assert_eq!(second[0][1], SqlValue::Text("o'brien".into()));
    }

    #[test]
    fn test_missing_table_errors() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(seed(&dir));
        let mut conn = connector.connect().unwrap();
        assert!(conn.create_statement("nope").is_err());
        assert!(conn.columns("nope").is_err());
    }

    #[test]
    fn test_connect_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(dir.path().join("absent.db"));
        assert!(matches!(connector.connect(), Err(EngineError::Connection(_))));
    }
}
