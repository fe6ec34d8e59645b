//! Arena of staging areas indexed by generational handles.
//!
//! # Responsibility
//! - Hold every staging area with its pending changes and parent handle.
//! - Resolve reads through the parent chain down to the store.
//! - Fold a child's changes into its parent, and flush the root to the store.
//!
//! # Invariants
//! - A staging area has a coordinator iff it has no parent.
//! - Released slots bump their generation; stale handles are rejected.
//! - The nearest staging area that knows a record decides its visibility.
//! - While a root flush is in flight its snapshot stays visible beneath the
//!   root's newer changes; a failed flush folds it back underneath them.

use super::coordinator::{CoordinatorError, StoreCoordinator};
use super::{ContextError, FetchError, SaveError, SaveOutcome};
use crate::model::changes::{ChangeSet, ChangeSummary, Lookup};
use crate::model::fetch::FetchRequest;
use crate::model::record::{ManagedRecord, RecordId};
use crate::model::schema::ModelSchema;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Handle to one staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId {
    index: u32,
    generation: u32,
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct StagingArea {
    label: String,
    parent: Option<ContextId>,
    coordinator: Option<Arc<StoreCoordinator>>,
    changes: ChangeSet,
    flushing: Option<Arc<ChangeSet>>,
}

impl StagingArea {
    fn new(
        label: String,
        parent: Option<ContextId>,
        coordinator: Option<Arc<StoreCoordinator>>,
    ) -> Self {
        Self {
            label,
            parent,
            coordinator,
            changes: ChangeSet::new(),
            flushing: None,
        }
    }

    fn lookup(&self, record_id: RecordId) -> Lookup<'_> {
        match self.changes.lookup(record_id) {
            Lookup::Unknown => self
                .flushing
                .as_ref()
                .map_or(Lookup::Unknown, |flushing| flushing.lookup(record_id)),
            known => known,
        }
    }
}

/// Snapshot of a root's changes taken by [`ContextArena::begin_flush`].
pub struct PendingFlush {
    id: ContextId,
    coordinator: Arc<StoreCoordinator>,
    changes: Arc<ChangeSet>,
}

impl PendingFlush {
    pub fn summary(&self) -> ChangeSummary {
        self.changes.summary()
    }

    /// Writes the snapshot to the store. Call without holding the arena.
    pub fn write(&self) -> Result<(), CoordinatorError> {
        self.coordinator.apply(&self.changes)
    }
}

/// Store contents plus the pending layers visible from one context, captured
/// by [`ContextArena::plan_fetch`].
pub struct FetchPlan {
    coordinator: Arc<StoreCoordinator>,
    layers: Vec<ChangeSet>,
}

impl FetchPlan {
    /// Reads the store and overlays the captured layers, root first.
    pub fn execute(&self, request: &FetchRequest) -> Result<Vec<ManagedRecord>, FetchError> {
        let mut visible: BTreeMap<RecordId, ManagedRecord> = self
            .coordinator
            .fetch_entity(&request.entity)?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        for layer in &self.layers {
            layer.overlay(&request.entity, &mut visible);
        }
        Ok(request.apply(visible.into_values().collect())?)
    }
}

struct Slot {
    generation: u32,
    area: Option<StagingArea>,
}

/// Owner of all staging areas of one store manager.
#[derive(Default)]
pub struct ContextArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ContextArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the root staging area, the only one linked to the store.
    pub fn create_root(
        &mut self,
        label: impl Into<String>,
        coordinator: Arc<StoreCoordinator>,
    ) -> ContextId {
        self.allocate(StagingArea::new(label.into(), None, Some(coordinator)))
    }

    pub fn create_child(
        &mut self,
        label: impl Into<String>,
        parent: ContextId,
    ) -> Result<ContextId, ContextError> {
        self.area(parent)?;
        Ok(self.allocate(StagingArea::new(label.into(), Some(parent), None)))
    }

    /// Drops a staging area and its pending changes.
    ///
    /// Returns `false` for stale handles.
    pub fn release(&mut self, id: ContextId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.area.is_none() {
            return false;
        }
        slot.area = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        true
    }

    pub fn is_live(&self, id: ContextId) -> bool {
        self.area(id).is_ok()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.area.is_some()).count()
    }

    pub fn label(&self, id: ContextId) -> Result<&str, ContextError> {
        Ok(self.area(id)?.label.as_str())
    }

    pub fn parent(&self, id: ContextId) -> Result<Option<ContextId>, ContextError> {
        Ok(self.area(id)?.parent)
    }

    /// Returns the coordinator of `id` itself; only roots have one.
    pub fn coordinator(&self, id: ContextId) -> Result<Option<&Arc<StoreCoordinator>>, ContextError> {
        Ok(self.area(id)?.coordinator.as_ref())
    }

    /// Counts a root snapshot that is still being written as pending.
    pub fn has_changes(&self, id: ContextId) -> Result<bool, ContextError> {
        let area = self.area(id)?;
        Ok(area.changes.has_changes() || area.flushing.is_some())
    }

    pub fn pending_summary(&self, id: ContextId) -> Result<ChangeSummary, ContextError> {
        Ok(self.area(id)?.changes.summary())
    }

    /// Allocates a record with schema defaults, staged as an insert in `id`.
    pub fn insert(&mut self, id: ContextId, entity: &str) -> Result<ManagedRecord, ContextError> {
        let schema = Arc::clone(self.root_coordinator(id)?.schema());
        let Some(description) = schema.entity(entity) else {
            return Err(ContextError::UnknownEntity(entity.to_string()));
        };
        let record = ManagedRecord::with_defaults(description);
        self.area_mut(id)?.changes.stage_insert(record.clone());
        Ok(record)
    }

    /// Stages a new version of a record visible from `id`.
    pub fn update(&mut self, id: ContextId, record: ManagedRecord) -> Result<(), ContextError> {
        match self.resolve(id, record.id)? {
            Some(current) if current.entity == record.entity => {
                self.area_mut(id)?.changes.stage_update(record);
                Ok(())
            }
            _ => Err(ContextError::RecordNotFound(record.id)),
        }
    }

    /// Stages removal of a record visible from `id`.
    pub fn delete(&mut self, id: ContextId, record_id: RecordId) -> Result<(), ContextError> {
        let Some(current) = self.resolve(id, record_id)? else {
            return Err(ContextError::RecordNotFound(record_id));
        };
        self.area_mut(id)?
            .changes
            .stage_delete(record_id, current.entity);
        Ok(())
    }

    /// Returns the version of `record_id` visible from `id`.
    pub fn resolve(
        &self,
        id: ContextId,
        record_id: RecordId,
    ) -> Result<Option<ManagedRecord>, ContextError> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let area = self.area(current)?;
            match area.lookup(record_id) {
                Lookup::Present(record) => return Ok(Some(record.clone())),
                Lookup::Deleted => return Ok(None),
                Lookup::Unknown => {}
            }
            if let Some(coordinator) = &area.coordinator {
                return Ok(coordinator.fetch_record(record_id)?);
            }
            cursor = area.parent;
        }
        Err(ContextError::UnknownContext(id))
    }

    /// Executes `request` against the view of `id`: store contents overlaid
    /// with every pending change from the root down to `id`.
    pub fn fetch(
        &self,
        id: ContextId,
        request: &FetchRequest,
    ) -> Result<Vec<ManagedRecord>, FetchError> {
        self.plan_fetch(id, request)?.execute(request)
    }

    /// Captures the pending changes of `request.entity` from the root down
    /// to `id`, so the store scan can run after the arena is released.
    pub fn plan_fetch(
        &self,
        id: ContextId,
        request: &FetchRequest,
    ) -> Result<FetchPlan, FetchError> {
        let chain = self.chain(id)?;
        let coordinator = Arc::clone(self.root_coordinator(id)?);
        if coordinator.schema().entity(&request.entity).is_none() {
            return Err(FetchError::UnknownEntity(request.entity.clone()));
        }

        let mut layers = Vec::new();
        for context in chain.iter().rev() {
            let area = self.area(*context)?;
            if let Some(flushing) = &area.flushing {
                layers.push(flushing.for_entity(&request.entity));
            }
            layers.push(area.changes.for_entity(&request.entity));
        }
        Ok(FetchPlan {
            coordinator,
            layers,
        })
    }

    /// Moves the pending changes of `id` into its parent.
    ///
    /// All checks run before anything moves; on error nothing changes.
    pub fn merge_into_parent(&mut self, id: ContextId) -> Result<SaveOutcome, SaveError> {
        let area = self.area(id)?;
        let Some(parent) = area.parent else {
            return self.flush_root(id);
        };
        if !area.changes.has_changes() {
            return Ok(SaveOutcome::Skipped);
        }

        let schema = Arc::clone(self.root_coordinator(id)?.schema());
        validate_written(&area.changes, &schema)?;

        for record in area.changes.updated() {
            if self.resolve(parent, record.id)?.is_none() {
                return Err(SaveError::Conflict(record.id));
            }
        }
        let mut gone_upstream = Vec::new();
        for (record_id, _) in area.changes.deleted() {
            if self.resolve(parent, record_id)?.is_none() {
                gone_upstream.push(record_id);
            }
        }

        let mut changes = std::mem::take(&mut self.area_mut(id)?.changes);
        for record_id in gone_upstream {
            changes.discard(record_id);
        }
        let summary = changes.merge_into(&mut self.area_mut(parent)?.changes);
        Ok(SaveOutcome::Staged(summary))
    }

    /// Writes the pending changes of root `id` to the store while holding
    /// the arena. Contexts sharing the arena across threads use
    /// [`ContextArena::begin_flush`] and [`ContextArena::finish_flush`].
    pub fn flush_root(&mut self, id: ContextId) -> Result<SaveOutcome, SaveError> {
        if self.area(id)?.coordinator.is_none() {
            return self.merge_into_parent(id);
        }
        let Some(flush) = self.begin_flush(id)? else {
            return Ok(SaveOutcome::Skipped);
        };
        let written = flush.write();
        self.finish_flush(flush, written)
    }

    /// Validates the pending changes of root `id` and moves them into an
    /// in-flight snapshot. Returns `None` when nothing is pending.
    pub fn begin_flush(&mut self, id: ContextId) -> Result<Option<PendingFlush>, SaveError> {
        let area = self.area(id)?;
        let Some(coordinator) = area.coordinator.clone() else {
            return Err(ContextError::UnknownContext(id).into());
        };
        if area.flushing.is_some() {
            return Err(ContextError::FlushInProgress(id).into());
        }
        if !area.changes.has_changes() {
            return Ok(None);
        }
        validate_written(&area.changes, coordinator.schema())?;

        let area = self.area_mut(id)?;
        let changes = Arc::new(std::mem::take(&mut area.changes));
        area.flushing = Some(Arc::clone(&changes));
        Ok(Some(PendingFlush {
            id,
            coordinator,
            changes,
        }))
    }

    /// Settles a snapshot from [`ContextArena::begin_flush`].
    ///
    /// On store failure the snapshot is folded back under any changes staged
    /// since, so a later save retries it.
    pub fn finish_flush(
        &mut self,
        flush: PendingFlush,
        written: Result<(), CoordinatorError>,
    ) -> Result<SaveOutcome, SaveError> {
        let summary = flush.summary();
        let area = self.area_mut(flush.id)?;
        area.flushing = None;
        if let Err(err) = written {
            let mut restored =
                Arc::try_unwrap(flush.changes).unwrap_or_else(|shared| (*shared).clone());
            area.changes.merge_into(&mut restored);
            area.changes = restored;
            return Err(err.into());
        }
        Ok(SaveOutcome::Persisted(summary))
    }

    fn allocate(&mut self, area: StagingArea) -> ContextId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.area = Some(area);
            return ContextId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            area: Some(area),
        });
        ContextId {
            index,
            generation: 0,
        }
    }

    fn area(&self, id: ContextId) -> Result<&StagingArea, ContextError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.area.as_ref())
            .ok_or(ContextError::UnknownContext(id))
    }

    fn area_mut(&mut self, id: ContextId) -> Result<&mut StagingArea, ContextError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.area.as_mut())
            .ok_or(ContextError::UnknownContext(id))
    }

    /// Returns `id` followed by its ancestors up to the root.
    fn chain(&self, id: ContextId) -> Result<Vec<ContextId>, ContextError> {
        let mut chain = vec![id];
        let mut cursor = self.area(id)?.parent;
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.area(current)?.parent;
        }
        Ok(chain)
    }

    fn root_coordinator(&self, id: ContextId) -> Result<&Arc<StoreCoordinator>, ContextError> {
        let chain = self.chain(id)?;
        let root = chain.last().copied().unwrap_or(id);
        self.area(root)?
            .coordinator
            .as_ref()
            .ok_or(ContextError::UnknownContext(root))
    }
}

fn validate_written(changes: &ChangeSet, schema: &ModelSchema) -> Result<(), SaveError> {
    for record in changes.written() {
        record.validate(schema)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ContextArena;
    use crate::context::coordinator::{CoordinatorError, StoreCoordinator};
    use crate::context::{ContextError, FetchError, SaveError, SaveOutcome};
    use crate::db::{SqliteStore, StoreKind};
    use crate::config::StoreOptions;
    use crate::model::fetch::FetchRequest;
    use crate::model::schema::{AttributeDescription, EntityDescription, ModelSchema};
    use crate::model::value::AttributeKind;
    use std::sync::Arc;

    fn note_schema() -> ModelSchema {
        ModelSchema::new("Test").with_entity(
            EntityDescription::new("Note")
                .with_attribute(AttributeDescription::new("title", AttributeKind::Text)),
        )
    }

    fn ready_coordinator() -> Arc<StoreCoordinator> {
        let schema = note_schema();
        let store = SqliteStore::open_in_memory(&schema, &StoreOptions::default()).unwrap();
        let coordinator = Arc::new(StoreCoordinator::new(Arc::new(schema), StoreKind::InMemory));
        coordinator.attach(Box::new(store), None);
        coordinator
    }

    #[test]
    fn only_the_root_holds_a_coordinator() {
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", ready_coordinator());
        let child = arena.create_child("foreground", root).unwrap();

        assert!(arena.coordinator(root).unwrap().is_some());
        assert!(arena.coordinator(child).unwrap().is_none());
        assert_eq!(arena.parent(child).unwrap(), Some(root));
    }

    #[test]
    fn released_handles_are_rejected_after_slot_reuse() {
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", ready_coordinator());
        let worker = arena.create_child("worker", root).unwrap();
        assert!(arena.release(worker));
        assert!(!arena.release(worker));

        let reused = arena.create_child("worker", root).unwrap();
        assert_ne!(reused, worker);
        assert!(matches!(
            arena.has_changes(worker),
            Err(ContextError::UnknownContext(_))
        ));
        assert_eq!(arena.live_count(), 2);
    }

    #[test]
    fn sibling_sees_changes_only_after_merge() {
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", ready_coordinator());
        let foreground = arena.create_child("foreground", root).unwrap();
        let worker = arena.create_child("worker", root).unwrap();

        let mut record = arena.insert(worker, "Note").unwrap();
        record.set("title", "A");
        arena.update(worker, record.clone()).unwrap();

        let request = FetchRequest::new("Note");
        assert!(arena.fetch(foreground, &request).unwrap().is_empty());

        let outcome = arena.merge_into_parent(worker).unwrap();
        assert!(matches!(outcome, SaveOutcome::Staged(summary) if summary.inserted == 1));
        assert_eq!(arena.fetch(foreground, &request).unwrap(), vec![record]);
        assert!(!arena.has_changes(worker).unwrap());
        assert!(arena.has_changes(root).unwrap());
    }

    #[test]
    fn update_of_record_deleted_upstream_conflicts() {
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", ready_coordinator());
        let first = arena.create_child("first", root).unwrap();
        let second = arena.create_child("second", root).unwrap();

        let record = arena.insert(root, "Note").unwrap();
        arena.flush_root(root).unwrap();

        let mut edited = record.clone();
        edited.set("title", "edited");
        arena.update(first, edited).unwrap();
        arena.delete(second, record.id).unwrap();
        arena.merge_into_parent(second).unwrap();

        let err = arena.merge_into_parent(first).unwrap_err();
        assert!(matches!(err, SaveError::Conflict(id) if id == record.id));
        assert!(arena.has_changes(first).unwrap());
    }

    #[test]
    fn flush_root_persists_and_clears() {
        let coordinator = ready_coordinator();
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", Arc::clone(&coordinator));

        arena.insert(root, "Note").unwrap();
        let outcome = arena.flush_root(root).unwrap();
        assert!(matches!(outcome, SaveOutcome::Persisted(summary) if summary.inserted == 1));
        assert!(!arena.has_changes(root).unwrap());
        assert_eq!(coordinator.record_count().unwrap(), 1);
        assert_eq!(arena.flush_root(root).unwrap(), SaveOutcome::Skipped);
    }

    #[test]
    fn changes_staged_during_a_flush_stay_pending() {
        let coordinator = ready_coordinator();
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", Arc::clone(&coordinator));
        let foreground = arena.create_child("foreground", root).unwrap();
        let request = FetchRequest::new("Note");

        let first = arena.insert(root, "Note").unwrap();
        let flush = arena.begin_flush(root).unwrap().unwrap();
        assert!(arena.has_changes(root).unwrap());
        assert!(matches!(
            arena.begin_flush(root),
            Err(SaveError::Context(ContextError::FlushInProgress(_)))
        ));

        let second = arena.insert(root, "Note").unwrap();
        assert_eq!(arena.fetch(foreground, &request).unwrap().len(), 2);
        arena.delete(foreground, first.id).unwrap();
        arena.merge_into_parent(foreground).unwrap();

        let written = flush.write();
        let outcome = arena.finish_flush(flush, written).unwrap();
        assert!(matches!(outcome, SaveOutcome::Persisted(summary) if summary.inserted == 1));
        assert_eq!(coordinator.record_count().unwrap(), 1);

        let pending = arena.pending_summary(root).unwrap();
        assert_eq!((pending.inserted, pending.deleted), (1, 1));
        let visible = arena.fetch(foreground, &request).unwrap();
        assert_eq!(visible.iter().map(|record| record.id).collect::<Vec<_>>(), [second.id]);

        arena.flush_root(root).unwrap();
        assert!(!arena.has_changes(root).unwrap());
        assert_eq!(coordinator.record_count().unwrap(), 1);
    }

    #[test]
    fn failed_flush_folds_snapshot_back_under_newer_changes() {
        let coordinator = Arc::new(StoreCoordinator::new(
            Arc::new(note_schema()),
            StoreKind::InMemory,
        ));
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", coordinator);

        let first = arena.insert(root, "Note").unwrap();
        let flush = arena.begin_flush(root).unwrap().unwrap();
        let mut edited = first.clone();
        edited.set("title", "edited");
        arena.update(root, edited.clone()).unwrap();
        arena.insert(root, "Note").unwrap();

        let written = flush.write();
        let err = arena.finish_flush(flush, written).unwrap_err();
        assert!(matches!(err, SaveError::Store(CoordinatorError::NotReady)));

        let pending = arena.pending_summary(root).unwrap();
        assert_eq!((pending.inserted, pending.updated), (2, 0));
        assert_eq!(arena.resolve(root, first.id).unwrap(), Some(edited));
    }

    #[test]
    fn fetch_before_the_store_is_attached_is_not_ready() {
        let coordinator = Arc::new(StoreCoordinator::new(
            Arc::new(note_schema()),
            StoreKind::Sqlite,
        ));
        let mut arena = ContextArena::new();
        let root = arena.create_root("background", coordinator);
        let foreground = arena.create_child("foreground", root).unwrap();

        let err = arena
            .fetch(foreground, &FetchRequest::new("Note"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Store(CoordinatorError::NotReady)));
    }
}
