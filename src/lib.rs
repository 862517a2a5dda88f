#![deny(clippy::all)]
#![allow(clippy::doc_markdown)]

//! # Event Dispatcher
//!
//! A publish/subscribe event dispatcher that fans out events received on
//! logical channels to a dynamically managed set of HTTP endpoints. For each
//! subscriber it maintains an independent delivery queue with retry, failure
//! counting, and optional disk persistence, so that events survive
//! subscriber outages and process restarts.
//!
//! The entry point is [`Dispatcher`]: build one with [`Dispatcher::build`],
//! register subscription sets with [`Dispatcher::register`], and feed it
//! events through [`Dispatcher::dispatch`].

#[doc(inline)]
pub use config::DispatcherConfig;
pub mod config;

#[doc(inline)]
pub use error::DispatchError;
pub mod error;

#[doc(inline)]
pub use event::{DispatcherEvent, EventFields, Payload};
pub mod event;

pub mod cookie;
pub mod matcher;
pub mod queue;
pub mod repository;
pub mod runtime;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod uri;

pub mod durable;

use std::sync::Arc;

use cookie::CookieJar;
use queue::memory::MemoryQueue;
use repository::{DurableQueueRepository, MemoryQueueRepository, QueueRepository};
use runtime::{Runtime, TokioRuntime};
use store::SubscriptionSetStore;
use subscription::SubscriptionSet;
use transport::{Delivery, ReqwestDelivery};

mod dispatch;
use dispatch::DispatchCore;

/// The dispatcher: owns the subscription-set store and the dispatch
/// pipeline, and is the crate's single façade over §4's components.
pub struct Dispatcher<R: Runtime = TokioRuntime> {
    store: Arc<SubscriptionSetStore>,
    core: Arc<DispatchCore<R>>,
}

impl Dispatcher<TokioRuntime> {
    /// Build a dispatcher using the `tokio`-backed runtime and a
    /// `reqwest`-backed HTTP delivery, recovering any durable queues found
    /// under `config.queue_root_path`.
    ///
    /// `config.queue_root_path = None` runs every expiring set's queue
    /// in-memory instead of durably (useful for tests and for deployments
    /// that don't need delivery to survive a restart).
    pub fn build(config: DispatcherConfig) -> Result<Self, DispatchError> {
        Self::build_with(config, TokioRuntime, Arc::new(ReqwestDelivery::default()))
    }
}

impl<R: Runtime> Dispatcher<R> {
    /// Build a dispatcher with an explicit [`Runtime`] and [`Delivery`],
    /// for tests and alternative transports.
    pub fn build_with(
        config: DispatcherConfig,
        runtime: R,
        delivery: Arc<dyn Delivery>,
    ) -> Result<Self, DispatchError> {
        let repository: Arc<dyn QueueRepository> = match &config.queue_root_path {
            Some(root) => Arc::new(
                DurableQueueRepository::new(root.clone(), config.retry_interval, runtime.clone()).map_err(
                    |e| DispatchError::QueueIoError {
                        location: root.to_string_lossy().to_string(),
                        details: e.to_string(),
                    },
                )?,
            ),
            None => Arc::new(MemoryQueueRepository::new(config.retry_interval, runtime.clone())),
        };

        let memory_queue = Arc::new(MemoryQueue::new(config.retry_interval, runtime.clone()));
        let cookie_jar = Arc::new(CookieJar::new());
        cookie_jar.set_service_cookie(config.service_access_cookie.clone());

        let store = Arc::new(SubscriptionSetStore::new(
            config.service_owner_uri.clone(),
            config.default_max_failures,
            cookie_jar,
            memory_queue,
            repository,
        ));

        let core = DispatchCore::new(&config, store.clone(), delivery, runtime)?;

        Ok(Self { store, core })
    }

    /// `register(location, set_document, access_key) → (set, existed)` (§6).
    pub fn register(
        &self,
        location: &str,
        set_document: &str,
        access_key: &str,
    ) -> Result<(SubscriptionSet, bool), DispatchError> {
        self.store.register(location, set_document, access_key)
    }

    /// `replace(location, set_document, access_key) → set | null` (§6).
    pub fn replace(
        &self,
        location: &str,
        set_document: &str,
        access_key: &str,
    ) -> Result<Option<SubscriptionSet>, DispatchError> {
        self.store.replace(location, set_document, access_key)
    }

    /// `remove(location) → bool` (§6).
    pub fn remove(&self, location: &str) -> Result<bool, DispatchError> {
        self.store.remove(location)
    }

    /// `get(location) → set?` (§6).
    pub fn get(&self, location: &str) -> Option<SubscriptionSet> {
        self.store.get(location)
    }

    /// `all() → set[]` (§6).
    pub fn all(&self) -> Vec<SubscriptionSet> {
        self.store.all()
    }

    /// The current combined set.
    pub fn combined_set(&self) -> subscription::CombinedSet {
        self.store.combined_set()
    }

    /// Register an observer fired every time the combined set is rebuilt
    /// (`on_combined_set_updated`, §6).
    pub fn on_combined_set_updated(
        &self,
        observer: Arc<dyn Fn(&subscription::CombinedSet) + Send + Sync>,
    ) {
        self.store.on_combined_set_updated(observer);
    }

    /// Submit an event for dispatch (§4.4, §6). May fail with
    /// [`DispatchError::LoopDetected`], [`DispatchError::MalformedEvent`]
    /// (from upstream construction, not this call), or
    /// [`DispatchError::EnqueueFailed`].
    pub fn dispatch(&self, event: DispatcherEvent) -> Result<(), DispatchError> {
        self.core.dispatch(event)
    }
}
