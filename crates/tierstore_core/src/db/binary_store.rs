//! Flat binary snapshot store.
//!
//! The whole record set lives in memory and is rewritten to disk on every
//! apply: write to `<file>.tmp`, then rename over the store file.

use super::mapping::{reconcile, Reconciliation};
use super::{DbError, DbResult, PersistentStore, StoreKind, StoreOpenError};
use crate::config::StoreOptions;
use crate::model::changes::ChangeSet;
use crate::model::record::{ManagedRecord, RecordId};
use crate::model::schema::ModelSchema;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    /// JSON text; schema defaults are free-form JSON which bincode cannot decode.
    model_json: String,
    records: Vec<ManagedRecord>,
}

/// Store persisting a bincode snapshot file.
pub struct BinaryStore {
    path: PathBuf,
    model_json: String,
    records: BTreeMap<RecordId, ManagedRecord>,
}

impl BinaryStore {
    pub fn open(
        path: impl AsRef<Path>,
        schema: &ModelSchema,
        options: &StoreOptions,
    ) -> Result<Self, StoreOpenError> {
        let path = path.as_ref().to_path_buf();
        let model_json = schema.to_json_string();

        if !path.exists() {
            let store = Self {
                path,
                model_json,
                records: BTreeMap::new(),
            };
            store.write_snapshot(&store.records)?;
            return Ok(store);
        }

        let bytes = std::fs::read(&path).map_err(DbError::from)?;
        let snapshot: Snapshot = bincode::deserialize(&bytes).map_err(DbError::from)?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(DbError::UnsupportedSchemaVersion {
                db_version: snapshot.format_version,
                latest_supported: SNAPSHOT_FORMAT_VERSION,
            }
            .into());
        }
        let stored: ModelSchema =
            serde_json::from_str(&snapshot.model_json).map_err(DbError::from)?;

        let mut store = Self {
            path,
            model_json,
            records: BTreeMap::new(),
        };
        match reconcile(Some(&stored), schema, options)? {
            Reconciliation::Fresh | Reconciliation::Unchanged => {
                store.records = snapshot
                    .records
                    .into_iter()
                    .map(|record| (record.id, record))
                    .collect();
            }
            Reconciliation::Migrate(mapping) => {
                let total = snapshot.records.len();
                for record in snapshot.records {
                    if let Some(record) = mapping.migrate(record)? {
                        store.records.insert(record.id, record);
                    }
                }
                store.write_snapshot(&store.records)?;
                info!(
                    "event=model_migrate module=db status=ok from_version={} to_version={} records_in={} records_out={}",
                    mapping.source_version(),
                    mapping.destination_version(),
                    total,
                    store.records.len()
                );
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_snapshot(&self, records: &BTreeMap<RecordId, ManagedRecord>) -> DbResult<()> {
        let snapshot = Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            model_json: self.model_json.clone(),
            records: records.values().cloned().collect(),
        };
        let bytes = bincode::serialize(&snapshot)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl PersistentStore for BinaryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Binary
    }

    fn fetch_entity(&self, entity: &str) -> DbResult<Vec<ManagedRecord>> {
        Ok(self
            .records
            .values()
            .filter(|record| record.entity == entity)
            .cloned()
            .collect())
    }

    fn fetch_record(&self, id: RecordId) -> DbResult<Option<ManagedRecord>> {
        Ok(self.records.get(&id).cloned())
    }

    fn apply(&mut self, changes: &ChangeSet) -> DbResult<()> {
        let mut next = self.records.clone();
        for record in changes.inserted() {
            next.insert(record.id, record.clone());
        }
        for record in changes.updated() {
            let Some(slot) = next.get_mut(&record.id) else {
                return Err(DbError::MissingRecord(record.id));
            };
            *slot = record.clone();
        }
        for (id, _) in changes.deleted() {
            next.remove(&id);
        }

        self.write_snapshot(&next)?;
        self.records = next;
        Ok(())
    }

    fn record_count(&self) -> DbResult<usize> {
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::BinaryStore;
    use crate::config::StoreOptions;
    use crate::db::{DbError, PersistentStore};
    use crate::model::changes::ChangeSet;
    use crate::model::record::ManagedRecord;
    use crate::model::schema::{AttributeDescription, EntityDescription, ModelSchema};
    use crate::model::value::AttributeKind;

    fn schema() -> ModelSchema {
        ModelSchema::new("Test").with_entity(
            EntityDescription::new("Note")
                .with_attribute(AttributeDescription::new("title", AttributeKind::Text)),
        )
    }

    #[test]
    fn apply_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test.binary");
        let schema = schema();

        let mut store = BinaryStore::open(&path, &schema, &StoreOptions::default()).unwrap();
        let mut record = ManagedRecord::new("Note");
        record.set("title", "A");
        let mut changes = ChangeSet::new();
        changes.stage_insert(record.clone());
        store.apply(&changes).unwrap();
        drop(store);

        let reopened = BinaryStore::open(&path, &schema, &StoreOptions::default()).unwrap();
        assert_eq!(reopened.fetch_record(record.id).unwrap(), Some(record));
        assert!(!dir.path().join("Test.binary.tmp").exists());
    }

    #[test]
    fn update_of_unknown_record_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store =
            BinaryStore::open(dir.path().join("Test.binary"), &schema(), &StoreOptions::default())
                .unwrap();

        let mut changes = ChangeSet::new();
        changes.stage_insert(ManagedRecord::new("Note"));
        changes.stage_update(ManagedRecord::new("Note"));
        let err = store.apply(&changes).unwrap_err();
        assert!(matches!(err, DbError::MissingRecord(_)));
        assert_eq!(store.record_count().unwrap(), 0);
    }
}
