//! Embedded schema migrations.
//!
//! Each numbered SQL file is compiled in with `include_str!` and applied at
//! most once, inside its own transaction, with `schema_version` recording
//! what ran. A database stamped by a newer build is refused.

use rusqlite::Connection;

use crate::db::DbError;

struct SchemaStep {
    version: i32,
    sql: &'static str,
}

const STEPS: &[SchemaStep] = &[SchemaStep {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn latest_known() -> i32 {
    STEPS.last().map(|s| s.version).unwrap_or(0)
}

/// Highest applied version, 0 for a fresh database.
fn applied_version(conn: &Connection) -> Result<i32, DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// Hot copy to `<db>.pre-migration.bak` before upgrading a populated file.
fn snapshot_before_upgrade(conn: &Connection) -> Result<(), DbError> {
    let path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;
    if path.is_empty() {
        return Ok(());
    }

    let target = format!("{}.pre-migration.bak", path);
    let mut copy = Connection::open(&target)?;
    rusqlite::backup::Backup::new(conn, &mut copy)?.step(-1)?;
    log::info!("Migrations: snapshot written to {}", target);
    Ok(())
}

/// Apply pending steps. Returns how many ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, DbError> {
    let current = applied_version(conn)?;
    if current > latest_known() {
        return Err(DbError::Migration(format!(
            "database schema v{} is newer than this build of dealsync (v{})",
            current,
            latest_known()
        )));
    }

    let pending: Vec<&SchemaStep> = STEPS.iter().filter(|s| s.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot_before_upgrade(conn)?;
    }

    for step in &pending {
        let batch = format!(
            "BEGIN IMMEDIATE;\n{}\nINSERT INTO schema_version (version) VALUES ({});\nCOMMIT;",
            step.sql, step.version
        );
        if let Err(e) = conn.execute_batch(&batch) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(DbError::Migration(format!("v{} failed: {}", step.version, e)));
        }
        log::info!("Migrations: applied v{}", step.version);
    }

    Ok(pending.len())
}
