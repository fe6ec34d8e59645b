//! Disposable context for one background unit of work.
//!
//! # Invariants
//! - A worker never writes to the store; its save stages into the parent.
//! - Changes made in a worker are invisible elsewhere until it saves.
//! - Dropping the worker discards unsaved changes.

use crate::context::{
    ContextError, FetchError, ManagedContext, PendingSave, SaveError, SaveOutcome,
};
use crate::model::fetch::FetchRequest;
use crate::model::predicate::Predicate;
use crate::model::record::{ManagedRecord, RecordId};
use log::debug;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// Child context with its own queue and pending set.
pub struct WorkerContext {
    context: ManagedContext,
}

impl Debug for WorkerContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WorkerContext").field(&self.context).finish()
    }
}

impl WorkerContext {
    /// Creates a worker chained under `parent`.
    pub fn new(parent: &ManagedContext) -> Result<Self, ContextError> {
        let label = format!("worker-{}", NEXT_WORKER.fetch_add(1, Ordering::Relaxed));
        let context = ManagedContext::child(parent, &label)?;
        debug!(
            "event=worker_create module=service status=ok context={} parent={}",
            label,
            parent.label()
        );
        Ok(Self { context })
    }

    pub fn context(&self) -> &ManagedContext {
        &self.context
    }

    pub fn label(&self) -> &str {
        self.context.label()
    }

    /// Allocates a record of `entity` with model defaults.
    ///
    /// The returned copy is detached; stage edits with [`WorkerContext::update`].
    pub fn insert(&self, entity: &str) -> Result<ManagedRecord, ContextError> {
        self.context.insert(entity)
    }

    pub fn insert_with<F>(&self, entity: &str, fill: F) -> Result<ManagedRecord, ContextError>
    where
        F: FnOnce(&mut ManagedRecord) + Send + 'static,
    {
        self.context.insert_with(entity, fill)
    }

    pub fn update(&self, record: ManagedRecord) -> Result<(), ContextError> {
        self.context.update(record)
    }

    /// Marks `record` for removal on the next save.
    pub fn delete(&self, record: &ManagedRecord) -> Result<(), ContextError> {
        self.context.delete(record.id)
    }

    pub fn delete_by_id(&self, record_id: RecordId) -> Result<(), ContextError> {
        self.context.delete(record_id)
    }

    pub fn existing(&self, record_id: RecordId) -> Result<Option<ManagedRecord>, ContextError> {
        self.context.existing(record_id)
    }

    pub fn fetch(&self, request: FetchRequest) -> Result<Vec<ManagedRecord>, FetchError> {
        self.context.fetch(request)
    }

    pub fn fetch_all(
        &self,
        entity: &str,
        predicate: Option<Predicate>,
    ) -> Result<Vec<ManagedRecord>, FetchError> {
        self.context.fetch_all(entity, predicate)
    }

    pub fn has_changes(&self) -> bool {
        self.context.has_changes()
    }

    /// Stages pending changes into the parent on the worker queue.
    pub fn save(&self) -> PendingSave {
        self.context.save()
    }

    /// Like [`WorkerContext::save`]; `on_complete` runs on the worker queue.
    pub fn save_then<F>(&self, on_complete: F)
    where
        F: FnOnce(Result<SaveOutcome, SaveError>) + Send + 'static,
    {
        self.context.save_then(on_complete)
    }
}
