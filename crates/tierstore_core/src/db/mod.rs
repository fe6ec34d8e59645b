//! Backing store bootstrap and persistence entry points.
//!
//! # Responsibility
//! - Define the `PersistentStore` contract the coordinator writes through.
//! - Open SQLite (file or in-memory) and flat binary stores.
//! - Reconcile the stored model with the current schema on open.
//!
//! # Invariants
//! - Internal table layout is tracked via `PRAGMA user_version`.
//! - A store never accepts writes before model reconciliation succeeds.
//! - `apply` is all-or-nothing for one change set.

use crate::model::changes::ChangeSet;
use crate::model::record::{ManagedRecord, RecordId};
use std::error::Error;
use std::fmt::{Display, Formatter};

mod binary_store;
pub mod mapping;
pub mod migrations;
mod open;
mod sqlite_store;

pub use binary_store::BinaryStore;
pub use open::{open_store, store_location, StoreOpenError};
pub use sqlite_store::SqliteStore;

pub type DbResult<T> = Result<T, DbError>;

/// Kind of durable backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// SQLite database living only in process memory.
    InMemory,
    /// Flat binary snapshot file rewritten on every save.
    Binary,
}

impl StoreKind {
    /// File extension of the store file; `None` for in-memory stores.
    pub fn file_extension(self) -> Option<&'static str> {
        match self {
            Self::Sqlite => Some("sqlite"),
            Self::InMemory => None,
            Self::Binary => Some("binary"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::InMemory => "memory",
            Self::Binary => "binary",
        }
    }
}

/// Durable record storage the root staging area flushes into.
pub trait PersistentStore: Send {
    fn kind(&self) -> StoreKind;
    /// Returns every stored record of `entity`.
    fn fetch_entity(&self, entity: &str) -> DbResult<Vec<ManagedRecord>>;
    fn fetch_record(&self, id: RecordId) -> DbResult<Option<ManagedRecord>>;
    /// Writes one change set atomically.
    fn apply(&mut self, changes: &ChangeSet) -> DbResult<()>;
    fn record_count(&self) -> DbResult<usize>;
}

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// Payload could not be encoded or decoded.
    Codec(String),
    /// An update targeted a record the store does not hold.
    MissingRecord(RecordId),
    InvalidData(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "store layout version {db_version} is newer than supported {latest_supported}"
            ),
            Self::Codec(message) => write!(f, "record codec failure: {message}"),
            Self::MissingRecord(id) => write!(f, "record not found in store: {id}"),
            Self::InvalidData(message) => write!(f, "invalid stored data: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for DbError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(value: bincode::Error) -> Self {
        Self::Codec(value.to_string())
    }
}
