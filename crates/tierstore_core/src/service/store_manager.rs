//! Store manager: two-tier context hierarchy over one backing store.
//!
//! # Responsibility
//! - Resolve the model, wire Background to the coordinator and Foreground
//!   as its child.
//! - Open the backing store off the caller's thread and report readiness
//!   once on the foreground queue.
//! - Offer save and fetch entry points against the foreground tier.
//!
//! # Invariants
//! - The ready callback runs exactly once per constructed manager.
//! - Only Background holds the coordinator.
//! - `save` never blocks on the background flush.

use crate::config::{SavePolicy, StoreConfig};
use crate::context::{
    ContextArena, ContextError, ContextQueue, FetchError, ManagedContext, PendingSave, QueueError,
    SaveOutcome, StoreCoordinator,
};
use crate::db::{open_store, store_location, StoreOpenError};
use crate::model::fetch::FetchRequest;
use crate::model::predicate::Predicate;
use crate::model::record::ManagedRecord;
use crate::model::schema::{ModelSchema, SchemaBundle, SchemaResolutionError};
use crate::service::worker_context::WorkerContext;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

const BACKGROUND_LABEL: &str = "background";
const FOREGROUND_LABEL: &str = "foreground";
const STORE_OPEN_LABEL: &str = "store-open";

/// Bootstrap failures of a store manager.
#[derive(Debug)]
pub enum StoreError {
    Schema(SchemaResolutionError),
    Open(StoreOpenError),
    Context(ContextError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(err) => write!(f, "{err}"),
            Self::Open(err) => write!(f, "{err}"),
            Self::Context(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Schema(err) => Some(err),
            Self::Open(err) => Some(err),
            Self::Context(err) => Some(err),
        }
    }
}

impl From<SchemaResolutionError> for StoreError {
    fn from(value: SchemaResolutionError) -> Self {
        Self::Schema(value)
    }
}

impl From<StoreOpenError> for StoreError {
    fn from(value: StoreOpenError) -> Self {
        Self::Open(value)
    }
}

impl From<ContextError> for StoreError {
    fn from(value: ContextError) -> Self {
        Self::Context(value)
    }
}

impl From<QueueError> for StoreError {
    fn from(value: QueueError) -> Self {
        Self::Context(ContextError::Queue(value))
    }
}

struct ManagerInner {
    config: StoreConfig,
    coordinator: Arc<StoreCoordinator>,
    background: ManagedContext,
    foreground: ManagedContext,
}

/// Entry point of the persistence layer.
///
/// Cheap to clone; clones share one hierarchy and one store.
#[derive(Clone)]
pub struct StoreManager {
    inner: Arc<ManagerInner>,
}

impl Debug for StoreManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("model", &self.inner.config.model_name)
            .field("kind", &self.inner.config.store_kind)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl StoreManager {
    /// Builds the hierarchy and starts opening the store in the background.
    ///
    /// Schema problems are returned immediately. Store problems reach
    /// `on_ready`, which runs once on the foreground queue.
    ///
    /// # Errors
    /// - `StoreError::Schema` when the model cannot be resolved.
    /// - `StoreError::Context` when a context queue cannot be started.
    pub fn new<F>(config: StoreConfig, bundle: &SchemaBundle, on_ready: F) -> Result<Self, StoreError>
    where
        F: FnOnce(Result<StoreManager, StoreOpenError>) + Send + 'static,
    {
        let schema = Arc::new(bundle.resolve(&config.model_name)?);

        let coordinator = Arc::new(StoreCoordinator::new(
            Arc::clone(&schema),
            config.store_kind,
        ));
        let arena = Arc::new(Mutex::new(ContextArena::new()));
        let background =
            ManagedContext::root(arena, BACKGROUND_LABEL, Arc::clone(&coordinator))?;
        let foreground = ManagedContext::child(&background, FOREGROUND_LABEL)?;

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                coordinator,
                background,
                foreground,
            }),
        };
        info!(
            "event=manager_init module=service status=ok model={} kind={}",
            manager.inner.config.model_name,
            manager.inner.config.store_kind.as_str()
        );

        let opener = ContextQueue::spawn(STORE_OPEN_LABEL)?;
        let opening = manager.clone();
        opener.perform(move || opening.finish_open(schema, on_ready))?;
        Ok(manager)
    }

    /// Like [`StoreManager::new`] but blocks until the store is open.
    pub fn open(config: StoreConfig, bundle: &SchemaBundle) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel();
        let _manager = Self::new(config, bundle, move |result| {
            let _ = sender.send(result);
        })?;
        match receiver.recv() {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Open(StoreOpenError::Interrupted)),
        }
    }

    /// Runs on the store-open queue.
    fn finish_open<F>(self, schema: Arc<ModelSchema>, on_ready: F)
    where
        F: FnOnce(Result<StoreManager, StoreOpenError>) + Send + 'static,
    {
        let config = &self.inner.config;
        let opened = store_location(
            config.store_kind,
            &config.model_name,
            config.store_dir.as_deref(),
        )
        .and_then(|location| {
            let store = open_store(config.store_kind, location.as_deref(), &schema, &config.options)?;
            Ok((store, location))
        });

        let result = match opened {
            Ok((store, location)) => {
                info!(
                    "event=store_ready module=service status=ok model={} location={}",
                    config.model_name,
                    location
                        .as_deref()
                        .map(|path| path.display().to_string())
                        .unwrap_or_else(|| "memory".to_string())
                );
                self.inner.coordinator.attach(store, location);
                Ok(self.clone())
            }
            Err(err) => {
                error!(
                    "event=store_ready module=service status=error model={} error={}",
                    config.model_name, err
                );
                self.inner.coordinator.mark_failed(err.to_string());
                Err(err)
            }
        };

        let delivered = self
            .inner
            .foreground
            .queue()
            .perform(move || on_ready(result));
        if let Err(err) = delivered {
            warn!(
                "event=store_ready module=service status=error error_code=callback_undeliverable error={}",
                err
            );
        }
    }

    /// Flushes Foreground into Background, then Background into the store.
    ///
    /// The foreground flush blocks; the background flush runs on the
    /// background queue and is observable through the returned handle.
    /// Under [`SavePolicy::RequireBothTiers`] the whole save is skipped
    /// unless both tiers have pending changes.
    pub fn save(&self) -> PendingSave {
        let foreground_dirty = self.inner.foreground.has_changes();
        let background_dirty = self.inner.background.has_changes();
        let proceed = match self.inner.config.save_policy {
            SavePolicy::RequireBothTiers => foreground_dirty && background_dirty,
            SavePolicy::EachTier => foreground_dirty || background_dirty,
        };
        if !proceed {
            debug!(
                "event=manager_save module=service status=skipped foreground_dirty={} background_dirty={}",
                foreground_dirty, background_dirty
            );
            return PendingSave::done(Ok(SaveOutcome::Skipped));
        }

        if foreground_dirty {
            if let Err(err) = self.inner.foreground.save_and_wait() {
                warn!(
                    "event=manager_save module=service status=error tier=foreground error={}",
                    err
                );
                return PendingSave::done(Err(err));
            }
        }
        self.inner.background.save()
    }

    /// Fetches every visible `entity` record matching `predicate`.
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

    pub fn fetch(&self, request: FetchRequest) -> Result<Vec<ManagedRecord>, FetchError> {
        let entity = request.entity.clone();
        self.inner.foreground.fetch(request).map_err(|err| {
            warn!(
                "event=manager_fetch module=service status=error entity={} error={}",
                entity, err
            );
            err
        })
    }

    pub fn count(&self, request: FetchRequest) -> Result<usize, FetchError> {
        Ok(self.fetch(request)?.len())
    }

    pub fn foreground_context(&self) -> &ManagedContext {
        &self.inner.foreground
    }

    pub fn background_context(&self) -> &ManagedContext {
        &self.inner.background
    }

    /// Creates a worker chained under Background.
    pub fn new_worker(&self) -> Result<WorkerContext, ContextError> {
        WorkerContext::new(&self.inner.background)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.coordinator.is_ready()
    }

    /// Store file path; `None` for in-memory stores or before the store opened.
    pub fn store_location(&self) -> Option<PathBuf> {
        self.inner.coordinator.location()
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        self.inner.coordinator.schema()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }
}
