//! Connection setup and schema migrations.

use rusqlite::Connection;
use tracing;

use super::{StoreError, StoreResult};
use crate::config::DurabilityMode;

/// Highest schema version this build understands.
pub const LATEST_VERSION: i64 = 3;

/// Ordered migration steps. Step N may only run against a store at N-1.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("../../resources/migrations/001_initial.sql")),
    (2, include_str!("../../resources/migrations/002_patient_profile.sql")),
    (3, include_str!("../../resources/migrations/003_visit_type.sql")),
];

/// Apply the per-connection pragmas: write-ahead journaling, configured
/// synchronous level, foreign keys, busy timeout.
pub fn configure_pragmas(conn: &Connection, durability: DurabilityMode) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous={};
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
        durability.synchronous_pragma()
    ))?;
    Ok(())
}

/// Bring the store up to [`LATEST_VERSION`], one step per transaction.
///
/// Each step's DDL and its `schema_version` row commit together, so a crash
/// mid-step leaves the store at the previous version, safe to retry on the
/// next launch. A store recorded at a version newer than this build is
/// refused before any write.
pub fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current = current_version(conn);
    if current > LATEST_VERSION {
        return Err(StoreError::IncompatibleSchema {
            found: current,
            supported: LATEST_VERSION,
        });
    }

    for &(version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        tracing::info!("applying schema migration v{version}");
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| StoreError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| StoreError::MigrationFailed {
            version,
            reason: e.to_string(),
        })?;
        tx.commit().map_err(|e| StoreError::MigrationFailed {
            version,
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

/// Current schema version (0 if no schema exists yet).
pub fn current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .map(|v| v.unwrap_or(0))
    .unwrap_or(0)
}

/// Count tables in the store (for verification).
pub fn count_tables(conn: &Connection) -> StoreResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}
