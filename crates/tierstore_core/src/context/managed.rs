//! Queue-bound handle to one staging area.
//!
//! # Responsibility
//! - Route every read and mutation of a staging area through its queue.
//! - Push pending changes one level up on save.
//!
//! # Invariants
//! - A save runs entirely on the saving context's queue; it never waits on
//!   another queue.
//! - Caller closures never run while the arena lock is held.
//! - Store writes and scans run after the arena lock is released.
//! - The staging area is released when the last handle is dropped.

use super::arena::{ContextArena, ContextId};
use super::coordinator::StoreCoordinator;
use super::queue::{ContextQueue, QueueError};
use super::{ContextError, FetchError, PendingSave, SaveError, SaveOutcome};
use crate::model::changes::ChangeSummary;
use crate::model::fetch::FetchRequest;
use crate::model::predicate::Predicate;
use crate::model::record::{ManagedRecord, RecordId};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Instant;

pub(crate) type SharedArena = Arc<Mutex<ContextArena>>;

struct ContextInner {
    id: ContextId,
    label: String,
    queue: ContextQueue,
    arena: SharedArena,
    parent: Option<ManagedContext>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.arena.lock().release(self.id) {
            debug!(
                "event=context_release module=context status=ok context={}",
                self.label
            );
        }
    }
}

/// Cloneable handle to a staging area and its serial queue.
#[derive(Clone)]
pub struct ManagedContext {
    inner: Arc<ContextInner>,
}

impl Debug for ManagedContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedContext")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("parent", &self.parent().map(ManagedContext::label))
            .finish()
    }
}

impl ManagedContext {
    pub(crate) fn root(
        arena: SharedArena,
        label: &str,
        coordinator: Arc<StoreCoordinator>,
    ) -> Result<Self, QueueError> {
        let queue = ContextQueue::spawn(label)?;
        let id = arena.lock().create_root(label, coordinator);
        Ok(Self::from_parts(id, label, queue, arena, None))
    }

    pub(crate) fn child(parent: &ManagedContext, label: &str) -> Result<Self, ContextError> {
        let queue = ContextQueue::spawn(label)?;
        let arena = Arc::clone(&parent.inner.arena);
        let id = arena.lock().create_child(label, parent.id())?;
        Ok(Self::from_parts(id, label, queue, arena, Some(parent.clone())))
    }

    fn from_parts(
        id: ContextId,
        label: &str,
        queue: ContextQueue,
        arena: SharedArena,
        parent: Option<ManagedContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                label: label.to_string(),
                queue,
                arena,
                parent,
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn parent(&self) -> Option<&ManagedContext> {
        self.inner.parent.as_ref()
    }

    pub fn queue(&self) -> &ContextQueue {
        &self.inner.queue
    }

    /// Returns whether this staging area holds unsaved changes.
    ///
    /// Reads the arena directly; does not wait for queued work.
    pub fn has_changes(&self) -> bool {
        self.inner.arena.lock().has_changes(self.id()).unwrap_or(false)
    }

    pub fn pending_summary(&self) -> ChangeSummary {
        self.inner
            .arena
            .lock()
            .pending_summary(self.id())
            .unwrap_or_default()
    }

    /// Allocates a record of `entity` with model defaults and stages it.
    pub fn insert(&self, entity: &str) -> Result<ManagedRecord, ContextError> {
        let entity = entity.to_string();
        self.run(move |arena, id| arena.insert(id, &entity))?
    }

    /// Like [`ManagedContext::insert`], letting `fill` set values before staging.
    pub fn insert_with<F>(&self, entity: &str, fill: F) -> Result<ManagedRecord, ContextError>
    where
        F: FnOnce(&mut ManagedRecord) + Send + 'static,
    {
        let entity = entity.to_string();
        let arena = Arc::clone(&self.inner.arena);
        let id = self.id();
        self.inner.queue.perform_and_wait(move || {
            let mut record = arena.lock().insert(id, &entity)?;
            fill(&mut record);
            arena.lock().update(id, record.clone())?;
            Ok(record)
        })?
    }

    pub fn update(&self, record: ManagedRecord) -> Result<(), ContextError> {
        self.run(move |arena, id| arena.update(id, record))?
    }

    pub fn delete(&self, record_id: RecordId) -> Result<(), ContextError> {
        self.run(move |arena, id| arena.delete(id, record_id))?
    }

    /// Returns the version of `record_id` visible from this context.
    pub fn existing(&self, record_id: RecordId) -> Result<Option<ManagedRecord>, ContextError> {
        self.run(move |arena, id| arena.resolve(id, record_id))?
    }

    pub fn fetch(&self, request: FetchRequest) -> Result<Vec<ManagedRecord>, FetchError> {
        let arena = Arc::clone(&self.inner.arena);
        let id = self.id();
        self.inner.queue.perform_and_wait(move || {
            let plan = arena.lock().plan_fetch(id, &request)?;
            plan.execute(&request)
        })?
    }

    /// Fetches every visible record of `entity`, optionally filtered.
    pub fn fetch_all(
        &self,
        entity: &str,
        predicate: Option<Predicate>,
    ) -> Result<Vec<ManagedRecord>, FetchError> {
        let mut request = FetchRequest::new(entity);
        if let Some(predicate) = predicate {
            request = request.with_predicate(predicate);
        }
        self.fetch(request)
    }

    pub fn count(&self, request: FetchRequest) -> Result<usize, FetchError> {
        Ok(self.fetch(request)?.len())
    }

    /// Saves on this context's queue and blocks until done.
    pub fn save_and_wait(&self) -> Result<SaveOutcome, SaveError> {
        let context = self.clone();
        self.inner.queue.perform_and_wait(move || context.save_step())?
    }

    /// Enqueues a save and returns a handle to its result.
    pub fn save(&self) -> PendingSave {
        let (sender, pending) = PendingSave::channel();
        let context = self.clone();
        let submitted = self.inner.queue.perform(move || {
            let _ = sender.send(context.save_step());
        });
        match submitted {
            Ok(()) => pending,
            Err(err) => PendingSave::done(Err(err.into())),
        }
    }

    /// Enqueues a save and calls `on_complete` with its result on this
    /// context's queue.
    pub fn save_then<F>(&self, on_complete: F)
    where
        F: FnOnce(Result<SaveOutcome, SaveError>) + Send + 'static,
    {
        let context = self.clone();
        let submitted = self.inner.queue.perform(move || on_complete(context.save_step()));
        if let Err(err) = submitted {
            warn!(
                "event=context_save module=context status=error context={} error={}",
                self.label(),
                err
            );
        }
    }

    /// One save level; must run on this context's queue.
    fn save_step(&self) -> Result<SaveOutcome, SaveError> {
        let started_at = Instant::now();
        let arena = Arc::clone(&self.inner.arena);
        let id = self.id();

        let result = match self.parent() {
            Some(_) => arena.lock().merge_into_parent(id),
            None => flush_unlocked(&arena, id),
        };

        let duration_ms = started_at.elapsed().as_millis();
        match &result {
            Ok(SaveOutcome::Skipped) => debug!(
                "event=context_save module=context status=ok context={} outcome=skipped",
                self.label()
            ),
            Ok(outcome) => {
                let summary = outcome.summary();
                info!(
                    "event=context_save module=context status=ok context={} outcome={} inserted={} updated={} deleted={} duration_ms={}",
                    self.label(),
                    outcome.label(),
                    summary.inserted,
                    summary.updated,
                    summary.deleted,
                    duration_ms
                );
            }
            Err(err) => warn!(
                "event=context_save module=context status=error context={} duration_ms={} error={}",
                self.label(),
                duration_ms,
                err
            ),
        }
        result
    }

    fn run<T, F>(&self, job: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ContextArena, ContextId) -> T + Send + 'static,
    {
        let arena = Arc::clone(&self.inner.arena);
        let id = self.id();
        self.inner.queue.perform_and_wait(move || {
            let mut guard = arena.lock();
            job(&mut guard, id)
        })
    }
}

/// Flushes root `id` with the store write outside the arena lock.
fn flush_unlocked(arena: &SharedArena, id: ContextId) -> Result<SaveOutcome, SaveError> {
    let pending = arena.lock().begin_flush(id)?;
    let Some(flush) = pending else {
        return Ok(SaveOutcome::Skipped);
    };
    let written = flush.write();
    arena.lock().finish_flush(flush, written)
}
