//! SQLite-backed store for pipeline state: organizations, accounts,
//! opportunities, calendar events, calls and sync checkpoints.
//!
//! The database lives at `~/.dealsync/dealsync.db` unless the config names
//! another path. A single connection sits behind a non-poisoning mutex; every
//! method takes the lock for one statement or one short transaction, so no
//! caller ever holds it across a network await.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};

pub mod types;
pub use types::*;

pub mod accounts;
pub mod calls;
pub mod events;
pub mod opportunities;
pub mod sync_state;

pub struct PipelineDb {
    conn: Mutex<Connection>,
}

impl PipelineDb {
    /// Lock the underlying connection for ad-hoc queries.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` inside one SQLite transaction; an `Err` rolls it back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => {
                conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the configured or default path.
    pub fn open(configured: Option<&str>) -> Result<Self, DbError> {
        Self::open_at(Self::resolve_path(configured)?)
    }

    /// The configured path, or `~/.dealsync/dealsync.db`.
    pub fn resolve_path(configured: Option<&str>) -> Result<PathBuf, DbError> {
        match configured {
            Some(p) if !p.trim().is_empty() => Ok(PathBuf::from(p)),
            _ => Self::default_path(),
        }
    }

    /// Open a database at an explicit path and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a database at an explicit path in read-only mode.
    pub fn open_readonly_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `~/.dealsync/dealsync.db`
    fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".dealsync").join("dealsync.db"))
    }
}

// -----------------------------------------------------------------------------
// Fixtures
// -----------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let db = test_db();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM sync_state", [], |row| row.get(0))
            .expect("sync_state should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO organizations (id, name, domain) VALUES ('o1', 'Org', NULL)",
                [],
            )?;
            Err(DbError::Migration("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM organizations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        drop(PipelineDb::open_at(path.clone()).expect("first open"));
        PipelineDb::open_at(path).expect("second open");
    }
}
