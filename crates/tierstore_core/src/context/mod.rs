//! Managed contexts: staging areas chained into a hierarchy over one store.
//!
//! # Responsibility
//! - Own the arena of staging areas and their parent links.
//! - Run every context operation on that context's serial queue.
//! - Report save and fetch outcomes as values instead of swallowing them.
//!
//! # Invariants
//! - Saving a child only stages into its parent; only the root writes to the
//!   store.
//! - Saving a context without pending changes is a no-op.
//! - Lock order is arena, then coordinator.
//! - Store writes and store scans run without the arena lock.

use crate::model::changes::ChangeSummary;
use crate::model::predicate::PredicateError;
use crate::model::record::{RecordId, RecordValidationError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::mpsc::{self, Receiver, Sender};

pub mod arena;
pub mod coordinator;
mod managed;
pub mod queue;

pub use arena::{ContextArena, ContextId};
pub use coordinator::{CoordinatorError, StoreCoordinator};
pub use managed::ManagedContext;
pub use queue::{ContextQueue, QueueError};

/// Failures of context-level mutations and lookups.
#[derive(Debug)]
pub enum ContextError {
    /// Handle refers to a released or never-created staging area.
    UnknownContext(ContextId),
    UnknownEntity(String),
    /// Record is not visible from the context.
    RecordNotFound(RecordId),
    /// The root is already writing an earlier snapshot to the store.
    FlushInProgress(ContextId),
    Store(CoordinatorError),
    Queue(QueueError),
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownContext(id) => write!(f, "context {id} is not live"),
            Self::UnknownEntity(entity) => write!(f, "entity `{entity}` is not in the model"),
            Self::RecordNotFound(id) => write!(f, "record not visible from context: {id}"),
            Self::FlushInProgress(id) => write!(f, "context {id} is already flushing"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Queue(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Queue(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CoordinatorError> for ContextError {
    fn from(value: CoordinatorError) -> Self {
        Self::Store(value)
    }
}

impl From<QueueError> for ContextError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

/// Failures while pushing staged changes up one level.
#[derive(Debug)]
pub enum SaveError {
    Validation(RecordValidationError),
    /// A staged update targets a record deleted upstream in the meantime.
    Conflict(RecordId),
    Store(CoordinatorError),
    Context(ContextError),
    /// The save task ended without reporting a result.
    Abandoned,
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Conflict(id) => write!(f, "record {id} was deleted upstream"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Context(err) => write!(f, "{err}"),
            Self::Abandoned => write!(f, "save task ended without a result"),
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Context(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RecordValidationError> for SaveError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<CoordinatorError> for SaveError {
    fn from(value: CoordinatorError) -> Self {
        Self::Store(value)
    }
}

impl From<ContextError> for SaveError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::Store(err) => Self::Store(err),
            other => Self::Context(other),
        }
    }
}

impl From<QueueError> for SaveError {
    fn from(value: QueueError) -> Self {
        Self::Context(ContextError::Queue(value))
    }
}

/// Failures of fetch execution.
#[derive(Debug)]
pub enum FetchError {
    UnknownEntity(String),
    InvalidPredicate(PredicateError),
    Store(CoordinatorError),
    Context(ContextError),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(entity) => write!(f, "entity `{entity}` is not in the model"),
            Self::InvalidPredicate(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Context(err) => write!(f, "{err}"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidPredicate(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Context(err) => Some(err),
            Self::UnknownEntity(_) => None,
        }
    }
}

impl From<PredicateError> for FetchError {
    fn from(value: PredicateError) -> Self {
        Self::InvalidPredicate(value)
    }
}

impl From<CoordinatorError> for FetchError {
    fn from(value: CoordinatorError) -> Self {
        Self::Store(value)
    }
}

impl From<ContextError> for FetchError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::Store(err) => Self::Store(err),
            ContextError::UnknownEntity(entity) => Self::UnknownEntity(entity),
            other => Self::Context(other),
        }
    }
}

impl From<QueueError> for FetchError {
    fn from(value: QueueError) -> Self {
        Self::Context(ContextError::Queue(value))
    }
}

/// Result of one save step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing was pending, or the save gate declined to flush.
    Skipped,
    /// Changes moved into the parent's pending set.
    Staged(ChangeSummary),
    /// Changes were written to the backing store.
    Persisted(ChangeSummary),
}

impl SaveOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn summary(&self) -> ChangeSummary {
        match self {
            Self::Skipped => ChangeSummary::default(),
            Self::Staged(summary) | Self::Persisted(summary) => *summary,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Staged(_) => "staged",
            Self::Persisted(_) => "persisted",
        }
    }
}

/// Handle to a save running on some context queue.
#[derive(Debug)]
pub struct PendingSave {
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Done(Result<SaveOutcome, SaveError>),
    Waiting(Receiver<Result<SaveOutcome, SaveError>>),
}

impl PendingSave {
    pub(crate) fn done(result: Result<SaveOutcome, SaveError>) -> Self {
        Self {
            state: PendingState::Done(result),
        }
    }

    pub(crate) fn channel() -> (Sender<Result<SaveOutcome, SaveError>>, Self) {
        let (sender, receiver) = mpsc::channel();
        (
            sender,
            Self {
                state: PendingState::Waiting(receiver),
            },
        )
    }

    /// Blocks until the save finishes.
    pub fn wait(self) -> Result<SaveOutcome, SaveError> {
        match self.state {
            PendingState::Done(result) => result,
            PendingState::Waiting(receiver) => receiver.recv().unwrap_or(Err(SaveError::Abandoned)),
        }
    }
}
