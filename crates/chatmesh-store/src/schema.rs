//! Schema versions, tracked in SQLite's `user_version` pragma.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Upgrade steps in order; step `i` takes the schema to version `i + 1`.
const STEPS: &[&str] = &[
    // v1: one JSON body per document name ("users", "rooms")
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        name       TEXT PRIMARY KEY NOT NULL,
        body       TEXT NOT NULL,
        updated_at TEXT NOT NULL            -- RFC-3339
    );
    "#,
];

pub(crate) fn latest_version() -> u32 {
    STEPS.len() as u32
}

/// Apply every step newer than the stored version.
pub(crate) fn upgrade(conn: &Connection) -> Result<u32> {
    let stored: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = latest_version();
    if stored >= target {
        return Ok(stored);
    }

    for (version, sql) in STEPS.iter().enumerate().skip(stored as usize) {
        let version = version as u32 + 1;
        tracing::info!(version, "upgrading document schema");
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Migration(format!("v{version}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(target)
}
