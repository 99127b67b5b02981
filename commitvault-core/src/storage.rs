use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the vault database.
///
/// Cloning is cheap; all clones talk to the same connection. Every write runs
/// inside a single immediate SQLite transaction, so a failed operation leaves
/// no partial rows behind and writers from other processes queue on the file
/// lock instead of failing.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        debug!("Opened vault database at {:?}", db_path.as_ref());
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a read against the current committed state.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside a transaction, committing only if it returns `Ok`.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS blobs (
            hash TEXT PRIMARY KEY,
            content BLOB NOT NULL,
            size INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commits (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            repository_id TEXT NOT NULL,
            author TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            merge_request_id TEXT,
            FOREIGN KEY (repository_id) REFERENCES repositories(id)
        );

        CREATE TABLE IF NOT EXISTS commit_parents (
            commit_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            parent_id TEXT NOT NULL,
            PRIMARY KEY (commit_id, position),
            FOREIGN KEY (commit_id) REFERENCES commits(id),
            FOREIGN KEY (parent_id) REFERENCES commits(id)
        );

        CREATE TABLE IF NOT EXISTS file_changes (
            commit_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            path TEXT NOT NULL,
            kind TEXT NOT NULL,
            new_hash TEXT,
            previous_hash TEXT,
            PRIMARY KEY (commit_id, position),
            FOREIGN KEY (commit_id) REFERENCES commits(id)
        );

        CREATE TABLE IF NOT EXISTS branches (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            name TEXT NOT NULL,
            head TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (repository_id, name),
            FOREIGN KEY (repository_id) REFERENCES repositories(id),
            FOREIGN KEY (head) REFERENCES commits(id)
        );

        CREATE TABLE IF NOT EXISTS merge_requests (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            creator TEXT NOT NULL,
            source_branch TEXT NOT NULL,
            target_branch TEXT NOT NULL,
            status TEXT NOT NULL,
            merge_commit TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            resolved_by TEXT,
            resolved_at TEXT,
            FOREIGN KEY (repository_id) REFERENCES repositories(id)
        );

        CREATE TABLE IF NOT EXISTS reviews (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            merge_request_id TEXT NOT NULL,
            reviewer TEXT NOT NULL,
            decision TEXT NOT NULL,
            comment TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY (merge_request_id) REFERENCES merge_requests(id)
        );

        CREATE INDEX IF NOT EXISTS idx_commits_repository ON commits(repository_id);
        CREATE INDEX IF NOT EXISTS idx_commit_parents_parent ON commit_parents(parent_id);
        CREATE INDEX IF NOT EXISTS idx_merge_requests_repository ON merge_requests(repository_id);
        CREATE INDEX IF NOT EXISTS idx_reviews_merge_request ON reviews(merge_request_id);
        "#,
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;

    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v != SCHEMA_VERSION => {
            return Err(Error::CorruptedData {
                table: "schema_version",
                reason: format!("expected version {}, found {}", SCHEMA_VERSION, v),
            });
        }
        Some(_) => {}
    }

    Ok(())
}

/// Timestamps are stored with nanosecond precision so they round-trip exactly;
/// commit fingerprints depend on this.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

pub(crate) fn optional_timestamp_column(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Maps an unrecognised enum label read from a column into a conversion error.
pub(crate) fn invalid_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {}: {}", what, value).into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_storage_initialization() {
        let storage = Storage::in_memory().unwrap();
        let version: i32 = storage
            .read(|conn| Ok(conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");

        {
            let storage = Storage::new(&path).unwrap();
            storage
                .write(|tx| {
                    tx.execute(
                        "INSERT INTO repositories (id, created_at) VALUES ('r', '2024-01-01T00:00:00Z')",
                        [],
                    )?;
                    Ok(())
                })
                .unwrap();
        }

        let storage = Storage::new(&path).unwrap();
        let count: i64 = storage
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM repositories", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let storage = Storage::in_memory().unwrap();
        let result: Result<()> = storage.write(|tx| {
            tx.execute(
                "INSERT INTO repositories (id, created_at) VALUES ('r', '2024-01-01T00:00:00Z')",
                [],
            )?;
            Err(Error::RepositoryNotFound("forced".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM repositories", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_second_handle_waits_for_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");
        let first = Storage::new(&path).unwrap();
        let second = Storage::new(&path).unwrap();

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            first.write(|tx| {
                tx.execute(
                    "INSERT INTO repositories (id, created_at) VALUES ('a', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
        });

        locked_rx.recv().unwrap();
        second
            .write(|tx| {
                tx.execute(
                    "INSERT INTO repositories (id, created_at) VALUES ('b', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        holder.join().unwrap().unwrap();

        let count: i64 = second
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM repositories", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let formatted = format_timestamp(&now);
        assert_eq!(parse_timestamp(0, &formatted).unwrap(), now);
    }
}
