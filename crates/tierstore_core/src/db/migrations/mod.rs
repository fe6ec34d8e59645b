//! Versioned layout of the SQLite store's own tables.
//!
//! # Invariants
//! - Step `n` of [`LAYOUT_STEPS`] upgrades layout `n` to layout `n + 1`.
//! - The layout version lives in `PRAGMA user_version` and is written in the
//!   same transaction as the steps.
//! - A store with a newer layout than this build knows is left untouched.
//! - Model changes are not layout changes; they go through `db::mapping`.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, TransactionBehavior};

const LAYOUT_STEPS: &[&str] = &[include_str!("0001_init.sql")];

/// Layout version written by this build.
pub fn layout_version() -> u32 {
    LAYOUT_STEPS.len() as u32
}

pub fn stored_layout_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Brings `conn` up to [`layout_version`] and returns the version it had.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the store was written by a newer build.
/// - SQLite failures; the upgrade is rolled back as a whole.
pub fn upgrade_layout(conn: &mut Connection) -> DbResult<u32> {
    let found = stored_layout_version(conn)?;
    let target = layout_version();
    if found > target {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: found,
            latest_supported: target,
        });
    }
    if found == target {
        return Ok(found);
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for step in &LAYOUT_STEPS[found as usize..] {
        tx.execute_batch(step)?;
    }
    tx.pragma_update(None, "user_version", target)?;
    tx.commit()?;
    info!(
        "event=layout_upgrade module=db status=ok from={} to={}",
        found, target
    );
    Ok(found)
}
