//! Backing store bootstrap.
//!
//! # Responsibility
//! - Resolve the store file location for a model.
//! - Open the store of the configured kind and reconcile its model.
//!
//! # Invariants
//! - Returned stores have layout migrations and model reconciliation applied.
//! - Every open emits one `store_open` start event and one terminal event.

use super::{BinaryStore, DbError, PersistentStore, SqliteStore, StoreKind};
use crate::config::StoreOptions;
use crate::model::schema::ModelSchema;
use directories::UserDirs;
use log::{error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Failures attaching a backing store to the coordinator.
#[derive(Debug)]
pub enum StoreOpenError {
    /// No store directory configured and no user document directory found.
    DocumentDirUnavailable,
    CreateDir { path: PathBuf, message: String },
    Db(DbError),
    /// Stored model differs and automatic migration is disabled.
    IncompatibleModel {
        stored_version: u32,
        current_version: u32,
    },
    /// Stored model differs and mapping inference is disabled.
    MappingUnavailable {
        stored_version: u32,
        current_version: u32,
    },
    /// A required attribute cannot be derived from the stored model.
    MappingInference { entity: String, attribute: String },
    /// The opening task ended without reporting a result.
    Interrupted,
}

impl Display for StoreOpenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentDirUnavailable => {
                write!(f, "no store directory configured and no document directory found")
            }
            Self::CreateDir { path, message } => write!(
                f,
                "failed to create store directory `{}`: {message}",
                path.display()
            ),
            Self::Db(err) => write!(f, "{err}"),
            Self::IncompatibleModel {
                stored_version,
                current_version,
            } => write!(
                f,
                "stored model version {stored_version} differs from {current_version} and automatic migration is disabled"
            ),
            Self::MappingUnavailable {
                stored_version,
                current_version,
            } => write!(
                f,
                "no mapping from model version {stored_version} to {current_version} and inference is disabled"
            ),
            Self::MappingInference { entity, attribute } => write!(
                f,
                "cannot infer a value for required attribute `{entity}.{attribute}`"
            ),
            Self::Interrupted => write!(f, "store opening was interrupted"),
        }
    }
}

impl Error for StoreOpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreOpenError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreOpenError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Returns `<dir>/<model_name>.<ext>` for file stores, `None` for in-memory.
///
/// `store_dir` wins over the user document directory.
pub fn store_location(
    kind: StoreKind,
    model_name: &str,
    store_dir: Option<&Path>,
) -> Result<Option<PathBuf>, StoreOpenError> {
    let Some(extension) = kind.file_extension() else {
        return Ok(None);
    };
    let dir = match store_dir {
        Some(dir) => dir.to_path_buf(),
        None => UserDirs::new()
            .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
            .ok_or(StoreOpenError::DocumentDirUnavailable)?,
    };
    Ok(Some(dir.join(format!("{model_name}.{extension}"))))
}

/// Opens a backing store of `kind` at `location` for `schema`.
///
/// # Side effects
/// - Creates the parent directory of file stores when missing.
/// - Emits `store_open` logging events with duration and status.
pub fn open_store(
    kind: StoreKind,
    location: Option<&Path>,
    schema: &ModelSchema,
    options: &StoreOptions,
) -> Result<Box<dyn PersistentStore>, StoreOpenError> {
    let started_at = Instant::now();
    info!(
        "event=store_open module=db status=start kind={} model={}",
        kind.as_str(),
        schema.name
    );

    match open_store_inner(kind, location, schema, options) {
        Ok(store) => {
            info!(
                "event=store_open module=db status=ok kind={} model={} duration_ms={}",
                kind.as_str(),
                schema.name,
                started_at.elapsed().as_millis()
            );
            Ok(store)
        }
        Err(err) => {
            error!(
                "event=store_open module=db status=error kind={} model={} duration_ms={} error={}",
                kind.as_str(),
                schema.name,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn open_store_inner(
    kind: StoreKind,
    location: Option<&Path>,
    schema: &ModelSchema,
    options: &StoreOptions,
) -> Result<Box<dyn PersistentStore>, StoreOpenError> {
    if kind == StoreKind::InMemory {
        return Ok(Box::new(SqliteStore::open_in_memory(schema, options)?));
    }

    let Some(path) = location else {
        return Err(StoreOpenError::DocumentDirUnavailable);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| StoreOpenError::CreateDir {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;
    }

    match kind {
        StoreKind::Binary => Ok(Box::new(BinaryStore::open(path, schema, options)?)),
        _ => Ok(Box::new(SqliteStore::open(path, schema, options)?)),
    }
}
