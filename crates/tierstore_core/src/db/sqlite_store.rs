//! SQLite-backed persistent store.
//!
//! # Responsibility
//! - Keep records as JSON payloads in the `records` table.
//! - Keep the model a store was written with in `store_metadata`.
//!
//! # Invariants
//! - Each `apply` runs in one transaction.
//! - Stored payloads must decode; undecodable rows are reported, not skipped.

use super::mapping::{reconcile, Reconciliation};
use super::migrations::upgrade_layout;
use super::{DbError, DbResult, PersistentStore, StoreKind, StoreOpenError};
use crate::config::StoreOptions;
use crate::model::changes::ChangeSet;
use crate::model::record::{ManagedRecord, RecordId};
use crate::model::schema::ModelSchema;
use crate::model::value::AttributeValue;
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const MODEL_METADATA_KEY: &str = "model";

/// Store over a SQLite connection, file-backed or in-memory.
pub struct SqliteStore {
    conn: Connection,
    kind: StoreKind,
}

impl SqliteStore {
    /// Opens a SQLite database file.
    pub fn open(
        path: impl AsRef<Path>,
        schema: &ModelSchema,
        options: &StoreOptions,
    ) -> Result<Self, StoreOpenError> {
        let conn = Connection::open(path)?;
        Self::bootstrap(conn, StoreKind::Sqlite, schema, options)
    }

    /// Opens a SQLite database living in process memory.
    pub fn open_in_memory(schema: &ModelSchema, options: &StoreOptions) -> Result<Self, StoreOpenError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, StoreKind::InMemory, schema, options)
    }

    fn bootstrap(
        mut conn: Connection,
        kind: StoreKind,
        schema: &ModelSchema,
        options: &StoreOptions,
    ) -> Result<Self, StoreOpenError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        if kind == StoreKind::Sqlite {
            let applied: String = conn.pragma_update_and_check(
                None,
                "journal_mode",
                options.journal_mode.as_pragma(),
                |row| row.get(0),
            )?;
            info!(
                "event=store_pragma module=db status=ok journal_mode={}",
                applied
            );
        }
        upgrade_layout(&mut conn)?;

        let mut store = Self { conn, kind };
        store.reconcile_model(schema, options)?;
        Ok(store)
    }

    fn reconcile_model(
        &mut self,
        schema: &ModelSchema,
        options: &StoreOptions,
    ) -> Result<(), StoreOpenError> {
        let stored = self.stored_model()?;
        match reconcile(stored.as_ref(), schema, options)? {
            Reconciliation::Unchanged => Ok(()),
            Reconciliation::Fresh => {
                write_model(&self.conn, schema)?;
                Ok(())
            }
            Reconciliation::Migrate(mapping) => {
                let records = self.all_records()?;
                let total = records.len();
                let mut migrated = Vec::with_capacity(total);
                for record in records {
                    if let Some(record) = mapping.migrate(record)? {
                        migrated.push(record);
                    }
                }

                let tx = self.conn.transaction()?;
                tx.execute("DELETE FROM records;", [])?;
                for record in &migrated {
                    insert_record(&tx, record)?;
                }
                write_model(&tx, schema)?;
                tx.commit()?;

                info!(
                    "event=model_migrate module=db status=ok from_version={} to_version={} records_in={} records_out={}",
                    mapping.source_version(),
                    mapping.destination_version(),
                    total,
                    migrated.len()
                );
                Ok(())
            }
        }
    }

    fn stored_model(&self) -> DbResult<Option<ModelSchema>> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = ?1;",
                [MODEL_METADATA_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn all_records(&self) -> DbResult<Vec<ManagedRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, entity, payload FROM records ORDER BY id ASC;")?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }
}

impl PersistentStore for SqliteStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn fetch_entity(&self, entity: &str) -> DbResult<Vec<ManagedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity, payload
             FROM records
             WHERE entity = ?1
             ORDER BY id ASC;",
        )?;
        let mut rows = stmt.query([entity])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }

    fn fetch_record(&self, id: RecordId) -> DbResult<Option<ManagedRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, entity, payload FROM records WHERE id = ?1;")?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_record_row(row)?));
        }
        Ok(None)
    }

    fn apply(&mut self, changes: &ChangeSet) -> DbResult<()> {
        let tx = self.conn.transaction()?;

        for record in changes.inserted() {
            insert_record(&tx, record)?;
        }

        for record in changes.updated() {
            let changed = tx.execute(
                "UPDATE records
                 SET
                    payload = ?2,
                    updated_at = (strftime('%s', 'now') * 1000)
                 WHERE id = ?1;",
                params![record.id.to_string(), serde_json::to_string(&record.values)?],
            )?;
            if changed == 0 {
                return Err(DbError::MissingRecord(record.id));
            }
        }

        for (id, _) in changes.deleted() {
            tx.execute("DELETE FROM records WHERE id = ?1;", [id.to_string()])?;
        }

        tx.commit()?;
        Ok(())
    }

    fn record_count(&self) -> DbResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records;", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|_| DbError::InvalidData(format!("negative count {count}")))
    }
}

fn insert_record(conn: &Connection, record: &ManagedRecord) -> DbResult<()> {
    conn.execute(
        "INSERT INTO records (id, entity, payload) VALUES (?1, ?2, ?3);",
        params![
            record.id.to_string(),
            record.entity.as_str(),
            serde_json::to_string(&record.values)?,
        ],
    )?;
    Ok(())
}

fn write_model(conn: &Connection, schema: &ModelSchema) -> DbResult<()> {
    conn.execute(
        "INSERT INTO store_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![MODEL_METADATA_KEY, schema.to_json_string()],
    )?;
    Ok(())
}

fn parse_record_row(row: &Row<'_>) -> DbResult<ManagedRecord> {
    let id_text: String = row.get("id")?;
    let id = Uuid::parse_str(&id_text)
        .map_err(|_| DbError::InvalidData(format!("invalid uuid value `{id_text}` in records.id")))?;
    let payload: String = row.get("payload")?;
    let values: BTreeMap<String, AttributeValue> = serde_json::from_str(&payload)
        .map_err(|err| DbError::InvalidData(format!("undecodable payload for record {id}: {err}")))?;

    Ok(ManagedRecord {
        id,
        entity: row.get("entity")?,
        values,
    })
}
