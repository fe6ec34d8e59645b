//! Public persistence surface.
//!
//! # Responsibility
//! - Bootstrap the context hierarchy and backing store from a config.
//! - Hand out worker contexts for background units of work.

pub mod store_manager;
pub mod worker_context;
