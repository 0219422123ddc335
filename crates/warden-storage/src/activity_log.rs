//! SQLite-backed activity log.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use tracing::{debug, info, warn};
use warden_core::{ActivityEvent, ActivityLog};

use crate::error::{Result, StorageError};
use crate::pool::ConnectionPool;
use crate::repository::ActivityRepo;

/// Persists activity events to the `activity` table.
#[derive(Clone)]
pub struct SqliteActivityLog {
    pool: ConnectionPool,
}

impl SqliteActivityLog {
    /// Opens `activity.db` in the platform data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Opens the database at `path`, creating missing parent directories.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        info!("Activity database at {:?}", path);
        Ok(Self {
            pool: ConnectionPool::open(&path)?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            pool: ConnectionPool::in_memory()?,
        })
    }

    pub fn default_db_path() -> Result<PathBuf> {
        ProjectDirs::from("org", "warden", "Warden")
            .map(|dirs| dirs.data_dir().join("activity.db"))
            .ok_or(StorageError::NoDataDir("the activity database"))
    }

    /// Appends an event, returning its row id.
    pub fn append(&self, event: &ActivityEvent) -> Result<i64> {
        let conn = self.pool.get()?;
        ActivityRepo::insert(&conn, event)
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: i64) -> Result<Vec<ActivityEvent>> {
        let conn = self.pool.get()?;
        ActivityRepo::recent(&conn, limit)
    }

    /// Most recent events for one client, newest first.
    pub fn recent_for_client(&self, client: &str, limit: i64) -> Result<Vec<ActivityEvent>> {
        let conn = self.pool.get()?;
        ActivityRepo::recent_for_client(&conn, client, limit)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        ActivityRepo::count(&conn)
    }

    pub fn count_by_action(&self, action: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        ActivityRepo::count_by_action(&conn, action)
    }

    /// Deletes events older than `before`. Returns the number removed.
    pub fn delete_older_than(&self, before: DateTime<Utc>) -> Result<i64> {
        let conn = self.pool.get()?;
        ActivityRepo::delete_older_than(&conn, before)
    }

    /// Keeps only the events recorded within `retention` of now.
    pub fn prune(&self, retention: Duration) -> Result<i64> {
        let removed = self.delete_older_than(Utc::now() - retention)?;
        if removed > 0 {
            debug!("Pruned {} activity events", removed);
        }
        Ok(removed)
    }
}

impl ActivityLog for SqliteActivityLog {
    fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.append(&event) {
            warn!("Failed to persist activity event: {}", e);
        }
    }
}
