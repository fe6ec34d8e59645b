//! Explicit pending-change tracking for one staging area.
//!
//! # Responsibility
//! - Track inserted, updated and deleted records by id.
//! - Fold a child's changes into a parent's pending set.
//! - Overlay pending changes on top of lower-level query results.
//!
//! # Invariants
//! - An id appears in at most one of `inserted`, `updated`, `deleted`.
//! - Deleting a record inserted in the same change set cancels the insert.
//! - Updating a record inserted in the same change set rewrites the insert.

use crate::model::record::{ManagedRecord, RecordId};
use std::collections::BTreeMap;

/// Per-record state known to one change set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    /// The change set holds the current version of the record.
    Present(&'a ManagedRecord),
    /// The change set hides the record.
    Deleted,
    /// The change set knows nothing; ask the next level.
    Unknown,
}

/// Counts of staged changes, reported by saves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ChangeSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Pending mutations of one staging area.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    inserted: BTreeMap<RecordId, ManagedRecord>,
    updated: BTreeMap<RecordId, ManagedRecord>,
    deleted: BTreeMap<RecordId, String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            inserted: self.inserted.len(),
            updated: self.updated.len(),
            deleted: self.deleted.len(),
        }
    }

    pub fn inserted(&self) -> impl Iterator<Item = &ManagedRecord> {
        self.inserted.values()
    }

    pub fn updated(&self) -> impl Iterator<Item = &ManagedRecord> {
        self.updated.values()
    }

    /// Yields `(id, entity)` pairs of deleted records.
    pub fn deleted(&self) -> impl Iterator<Item = (RecordId, &str)> {
        self.deleted.iter().map(|(id, entity)| (*id, entity.as_str()))
    }

    /// Records whose values will be written: inserts and updates.
    pub fn written(&self) -> impl Iterator<Item = &ManagedRecord> {
        self.inserted.values().chain(self.updated.values())
    }

    pub fn lookup(&self, id: RecordId) -> Lookup<'_> {
        if self.deleted.contains_key(&id) {
            return Lookup::Deleted;
        }
        if let Some(record) = self.inserted.get(&id).or_else(|| self.updated.get(&id)) {
            return Lookup::Present(record);
        }
        Lookup::Unknown
    }

    pub fn stage_insert(&mut self, record: ManagedRecord) {
        self.inserted.insert(record.id, record);
    }

    /// Stages a new version of an existing record.
    ///
    /// Callers check visibility first; this only keeps the invariants.
    pub fn stage_update(&mut self, record: ManagedRecord) {
        if let Some(slot) = self.inserted.get_mut(&record.id) {
            *slot = record;
            return;
        }
        self.deleted.remove(&record.id);
        self.updated.insert(record.id, record);
    }

    /// Stages removal of a record.
    pub fn stage_delete(&mut self, id: RecordId, entity: impl Into<String>) {
        if self.inserted.remove(&id).is_some() {
            return;
        }
        self.updated.remove(&id);
        self.deleted.insert(id, entity.into());
    }

    /// Moves every change into `parent`, leaving `self` empty.
    pub fn merge_into(&mut self, parent: &mut ChangeSet) -> ChangeSummary {
        let summary = self.summary();
        for (_, record) in std::mem::take(&mut self.inserted) {
            parent.stage_insert(record);
        }
        for (_, record) in std::mem::take(&mut self.updated) {
            parent.stage_update(record);
        }
        for (id, entity) in std::mem::take(&mut self.deleted) {
            parent.stage_delete(id, entity);
        }
        summary
    }

    /// Drops changes that no longer apply upstream.
    pub fn discard(&mut self, id: RecordId) {
        self.inserted.remove(&id);
        self.updated.remove(&id);
        self.deleted.remove(&id);
    }

    /// Copies the changes that touch `entity`.
    pub fn for_entity(&self, entity: &str) -> ChangeSet {
        let records = |map: &BTreeMap<RecordId, ManagedRecord>| {
            map.iter()
                .filter(|(_, record)| record.entity == entity)
                .map(|(id, record)| (*id, record.clone()))
                .collect()
        };
        ChangeSet {
            inserted: records(&self.inserted),
            updated: records(&self.updated),
            deleted: self
                .deleted
                .iter()
                .filter(|(_, deleted_entity)| deleted_entity.as_str() == entity)
                .map(|(id, deleted_entity)| (*id, deleted_entity.clone()))
                .collect(),
        }
    }

    /// Applies this change set on top of `base`, restricted to `entity`.
    pub fn overlay(&self, entity: &str, base: &mut BTreeMap<RecordId, ManagedRecord>) {
        for (id, deleted_entity) in &self.deleted {
            if deleted_entity == entity {
                base.remove(id);
            }
        }
        for record in self.written() {
            if record.entity == entity {
                base.insert(record.id, record.clone());
            }
        }
    }
}
