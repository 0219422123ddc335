//! Activity repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;
use warden_core::{ActivityEvent, Reason, Stage};

use crate::error::Result;

/// Repository for activity rows.
pub struct ActivityRepo;

impl ActivityRepo {
    /// Insert an event.
    pub fn insert(conn: &Connection, event: &ActivityEvent) -> Result<i64> {
        conn.execute(
            "INSERT INTO activity (created_at, stage, client, target, action, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.at.to_rfc3339(),
                event.stage.as_str(),
                event.client,
                event.target,
                event.action,
                event.reason.as_str(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Most recent events, newest first.
    pub fn recent(conn: &Connection, limit: i64) -> Result<Vec<ActivityEvent>> {
        let mut stmt = conn.prepare(
            "SELECT created_at, stage, client, target, action, reason
             FROM activity ORDER BY id DESC LIMIT ?1",
        )?;

        let events = stmt
            .query_map([limit], read_row)?
            .filter_map(|r| r.ok())
            .flatten()
            .collect();

        Ok(events)
    }

    /// Most recent events for one client, newest first.
    pub fn recent_for_client(
        conn: &Connection,
        client: &str,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>> {
        let mut stmt = conn.prepare(
            "SELECT created_at, stage, client, target, action, reason
             FROM activity WHERE client = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let events = stmt
            .query_map(params![client, limit], read_row)?
            .filter_map(|r| r.ok())
            .flatten()
            .collect();

        Ok(events)
    }

    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM activity", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_by_action(conn: &Connection, action: &str) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM activity WHERE action = ?1",
            [action],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete events older than a given time.
    pub fn delete_older_than(conn: &Connection, before: DateTime<Utc>) -> Result<i64> {
        let deleted = conn.execute(
            "DELETE FROM activity WHERE created_at < ?1",
            [before.to_rfc3339()],
        )?;
        Ok(deleted as i64)
    }
}

/// Maps a row; rows with codes this build does not know are skipped.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Option<ActivityEvent>> {
    let stage: String = row.get(1)?;
    let reason: String = row.get(5)?;
    let (Some(stage), Some(reason)) = (Stage::parse(&stage), Reason::parse(&reason)) else {
        debug!("Skipping activity row with stage {:?} reason {:?}", stage, reason);
        return Ok(None);
    };

    Ok(Some(ActivityEvent {
        at: parse_datetime(&row.get::<_, String>(0)?),
        stage,
        client: row.get(2)?,
        target: row.get(3)?,
        action: row.get(4)?,
        reason,
    }))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
