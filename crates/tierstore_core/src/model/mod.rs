//! Record, schema and query model.
//!
//! # Responsibility
//! - Define the record shape shared by staging areas and backing stores.
//! - Describe schemas, filter predicates and fetch requests.
//! - Track pending changes explicitly per staging area.
//!
//! # Invariants
//! - Every record is identified by a stable `RecordId`.
//! - Records are validated against the schema before they reach a store.

pub mod changes;
pub mod fetch;
pub mod predicate;
pub mod record;
pub mod schema;
pub mod value;
