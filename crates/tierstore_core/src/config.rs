//! Store manager configuration.
//!
//! # Responsibility
//! - Collect everything a store manager needs to bootstrap in one value.
//! - Default to a SQLite store with automatic model migration, inferred
//!   mapping and `journal_mode=DELETE`.
//!
//! # Invariants
//! - Configuration is plain data; nothing here touches the filesystem.

use crate::db::StoreKind;
use std::path::{Path, PathBuf};

/// SQLite rollback journal mode applied when opening a file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Journal is deleted at the end of each transaction.
    #[default]
    Delete,
    Truncate,
    Persist,
    Wal,
}

impl JournalMode {
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Persist => "PERSIST",
            Self::Wal => "WAL",
        }
    }
}

/// Options applied while opening the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Migrate stored records when the stored model differs from the current one.
    pub auto_migrate: bool,
    /// Derive the record mapping between models instead of requiring one.
    pub infer_mapping: bool,
    pub journal_mode: JournalMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            infer_mapping: true,
            journal_mode: JournalMode::Delete,
        }
    }
}

/// Gate applied by `StoreManager::save` before flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Flush only when both the foreground and background tiers have
    /// pending changes; otherwise skip the whole save.
    #[default]
    RequireBothTiers,
    /// Flush whichever tier has pending changes.
    EachTier,
}

/// Bootstrap configuration for a store manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub model_name: String,
    pub store_kind: StoreKind,
    /// Directory holding the store file; the user document directory when unset.
    pub store_dir: Option<PathBuf>,
    pub options: StoreOptions,
    pub save_policy: SavePolicy,
}

impl StoreConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            store_kind: StoreKind::default(),
            store_dir: None,
            options: StoreOptions::default(),
            save_policy: SavePolicy::default(),
        }
    }

    pub fn with_store_kind(mut self, kind: StoreKind) -> Self {
        self.store_kind = kind;
        self
    }

    pub fn with_store_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.store_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_save_policy(mut self, policy: SavePolicy) -> Self {
        self.save_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{JournalMode, SavePolicy, StoreConfig};
    use crate::db::StoreKind;

    #[test]
    fn defaults_use_sqlite_with_automatic_migration() {
        let config = StoreConfig::new("Test");
        assert_eq!(config.store_kind, StoreKind::Sqlite);
        assert!(config.options.auto_migrate);
        assert!(config.options.infer_mapping);
        assert_eq!(config.options.journal_mode, JournalMode::Delete);
        assert_eq!(config.save_policy, SavePolicy::RequireBothTiers);
        assert!(config.store_dir.is_none());
    }
}
