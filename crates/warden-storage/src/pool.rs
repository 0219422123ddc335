//! Connection to the activity database.
//!
//! Activity writes are small and strictly sequential, so one mutex-guarded
//! connection serves every sink clone.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{Result, StorageError};
use crate::schema::run_migrations;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 2000;";

#[derive(Clone)]
pub struct ConnectionPool {
    conn: Arc<Mutex<Connection>>,
}

impl ConnectionPool {
    /// Opens (or creates) the database file, then migrates it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::prepare(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMAS)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection for one repository call.
    pub fn get(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_database_is_migrated() {
        let pool = ConnectionPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM activity", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn clones_share_one_connection() {
        let pool = ConnectionPool::in_memory().unwrap();
        let other = pool.clone();

        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO activity (created_at, stage, client, target, action, reason)
                 VALUES ('2026-01-01T00:00:00Z', 'connection', 'c', 't', 'block', 'policy_check')",
                [],
            )
            .unwrap();

        let rows: i64 = other
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM activity", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
