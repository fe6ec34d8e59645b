//! Store coordinator: the single gate between the root staging area and the
//! backing store.
//!
//! # Invariants
//! - Only the root staging area holds a coordinator.
//! - Store access before the store is attached fails with `NotReady`.
//! - Once opening failed, every access reports the open failure.

use crate::db::{DbError, PersistentStore, StoreKind};
use crate::model::changes::ChangeSet;
use crate::model::record::{ManagedRecord, RecordId};
use crate::model::schema::ModelSchema;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

/// Store access failures surfaced to contexts.
#[derive(Debug)]
pub enum CoordinatorError {
    /// The backing store is still opening.
    NotReady,
    /// Opening failed; carries the open error message.
    Unavailable(String),
    Db(DbError),
}

impl Display for CoordinatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => write!(f, "backing store is not open yet"),
            Self::Unavailable(message) => write!(f, "backing store unavailable: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for CoordinatorError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

enum CoordinatorState {
    Opening,
    Ready {
        store: Box<dyn PersistentStore>,
        location: Option<PathBuf>,
    },
    Failed(String),
}

/// Mediates every read and write between staging areas and the store.
pub struct StoreCoordinator {
    schema: Arc<ModelSchema>,
    kind: StoreKind,
    state: Mutex<CoordinatorState>,
}

impl StoreCoordinator {
    pub fn new(schema: Arc<ModelSchema>, kind: StoreKind) -> Self {
        Self {
            schema,
            kind,
            state: Mutex::new(CoordinatorState::Opening),
        }
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Attaches an opened store; subsequent accesses go to it.
    pub fn attach(&self, store: Box<dyn PersistentStore>, location: Option<PathBuf>) {
        *self.state.lock() = CoordinatorState::Ready { store, location };
    }

    pub fn mark_failed(&self, message: impl Into<String>) {
        *self.state.lock() = CoordinatorState::Failed(message.into());
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), CoordinatorState::Ready { .. })
    }

    /// Store file path; `None` while opening, after failure, or in memory.
    pub fn location(&self) -> Option<PathBuf> {
        match &*self.state.lock() {
            CoordinatorState::Ready { location, .. } => location.clone(),
            _ => None,
        }
    }

    pub fn fetch_entity(&self, entity: &str) -> Result<Vec<ManagedRecord>, CoordinatorError> {
        self.with_store(|store| store.fetch_entity(entity))
    }

    pub fn fetch_record(&self, id: RecordId) -> Result<Option<ManagedRecord>, CoordinatorError> {
        self.with_store(|store| store.fetch_record(id))
    }

    pub fn apply(&self, changes: &ChangeSet) -> Result<(), CoordinatorError> {
        self.with_store(|store| store.apply(changes))
    }

    pub fn record_count(&self) -> Result<usize, CoordinatorError> {
        self.with_store(|store| store.record_count())
    }

    fn with_store<T>(
        &self,
        operation: impl FnOnce(&mut dyn PersistentStore) -> Result<T, DbError>,
    ) -> Result<T, CoordinatorError> {
        let mut state = self.state.lock();
        match &mut *state {
            CoordinatorState::Ready { store, .. } => Ok(operation(store.as_mut())?),
            CoordinatorState::Opening => Err(CoordinatorError::NotReady),
            CoordinatorState::Failed(message) => Err(CoordinatorError::Unavailable(message.clone())),
        }
    }
}
