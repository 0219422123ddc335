//! Activity database schema.
//!
//! Migrations are applied in order; the applied version lives in
//! `schema_version`.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::Result;

/// `(version, description, statements)`, ascending by version.
const MIGRATIONS: &[(i32, &str, &str)] = &[
    (
        1,
        "activity table",
        "CREATE TABLE IF NOT EXISTS activity (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            stage TEXT NOT NULL,
            client TEXT NOT NULL,
            target TEXT NOT NULL,
            action TEXT NOT NULL,
            reason TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_created_at ON activity (created_at);",
    ),
    (
        2,
        "activity lookup indexes",
        "CREATE INDEX IF NOT EXISTS idx_activity_action ON activity (action);
        CREATE INDEX IF NOT EXISTS idx_activity_client ON activity (client, created_at);",
    ),
];

pub fn schema_version() -> i32 {
    MIGRATIONS.last().map(|(version, _, _)| *version).unwrap_or(0)
}

/// Brings the database up to [`schema_version`].
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;
    let applied = applied_version(conn)?;

    for (version, description, statements) in MIGRATIONS {
        if *version <= applied {
            continue;
        }
        info!("Applying activity migration v{}: {}", version, description);
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(statements)?;
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
    }

    Ok(())
}

fn applied_version(conn: &Connection) -> Result<i32> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}
