//! Two-tier managed-context persistence over SQLite or binary snapshot stores.
//!
//! A [`StoreManager`] owns a foreground context chained under a background
//! context, the only one attached to the backing store. [`WorkerContext`]s
//! stage background units of work under either tier.

pub mod config;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod service;

pub use config::{JournalMode, SavePolicy, StoreConfig, StoreOptions};
pub use context::{
    ContextError, ContextId, FetchError, ManagedContext, PendingSave, SaveError, SaveOutcome,
};
pub use db::{StoreKind, StoreOpenError};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::changes::ChangeSummary;
pub use model::fetch::{FetchRequest, SortDescriptor};
pub use model::predicate::{CompareOp, Predicate, PredicateError};
pub use model::record::{ManagedRecord, RecordId, RecordValidationError};
pub use model::schema::{
    AttributeDescription, EntityDescription, ModelSchema, SchemaBundle, SchemaResolutionError,
};
pub use model::value::{AttributeKind, AttributeValue};
pub use service::store_manager::{StoreError, StoreManager};
pub use service::worker_context::WorkerContext;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
