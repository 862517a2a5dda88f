//! # Queue Repository
//!
//! Lifecycle manager for per-subscriber queues backing expiring subscription
//! sets (§4.6). Two implementations sharing the [`QueueRepository`] trait, no
//! shared base class, grounded on the teacher's trait-object seams
//! (`Transport`, `Deserializer`). Non-expiring sets never go through a
//! repository — they all share the single in-memory queue [`crate::store`]
//! owns directly.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spin::Mutex;

use crate::durable::queue_dir;
use crate::error::DispatchError;
use crate::queue::durable::DurableQueue;
use crate::queue::memory::MemoryQueue;
use crate::queue::{DequeueHandler, DispatchQueue};
use crate::runtime::Runtime;
use crate::subscription::SubscriptionSet;
use crate::uri::encode_location;

/// Contract shared by the memory and durable repository variants (§4.6).
#[async_trait::async_trait]
pub trait QueueRepository: Send + Sync {
    /// Recover any sets found in durable storage and open their queues,
    /// without wiring a dequeue handler yet. Returns the recovered sets so
    /// the caller can re-register them with the subscription set store
    /// before deliveries of their pending items can start. A second call
    /// fails.
    fn initialize(&self) -> Result<Vec<SubscriptionSet>, DispatchError>;

    /// Wire `handler` onto every queue opened by [`Self::initialize`] (and
    /// any registered since). Must be called only after the sets returned
    /// by `initialize` have been adopted back into the store — otherwise a
    /// delivery completing before adoption would find no matching set and
    /// be miscounted as belonging to a non-expiring one (§4.4).
    fn arm(&self, handler: DequeueHandler);

    /// Create the queue for `set.location` if absent. The durable variant
    /// also persists the set's descriptor document.
    fn register_or_update(&self, set: &SubscriptionSet) -> Result<(), DispatchError>;

    /// Remove the queue for `location`. The durable variant also deletes its
    /// data directory and descriptor.
    fn delete(&self, location: &str) -> Result<(), DispatchError>;

    /// Look up the queue registered for `location`.
    fn get(&self, location: &str) -> Option<Arc<dyn DispatchQueue>>;

    /// Release all queues without deleting durable state.
    async fn dispose(&self);
}

fn already_initialized(where_: &str) -> DispatchError {
    DispatchError::QueueIoError {
        location: where_.to_string(),
        details: "repository already initialized".into(),
    }
}

/// Non-durable repository: creates [`MemoryQueue`]s for expiring sets.
/// `pending_sets` returned from [`Self::initialize`] is always empty — there
/// is nothing to recover.
pub struct MemoryQueueRepository<R: Runtime> {
    retry_interval: Duration,
    runtime: R,
    queues: Mutex<HashMap<String, Arc<MemoryQueue<R>>>>,
    handler: Mutex<Option<DequeueHandler>>,
    initialized: Mutex<bool>,
}

impl<R: Runtime> MemoryQueueRepository<R> {
    /// Build a repository whose queues retry failed deliveries every
    /// `retry_interval`.
    pub fn new(retry_interval: Duration, runtime: R) -> Self {
        Self {
            retry_interval,
            runtime,
            queues: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            initialized: Mutex::new(false),
        }
    }
}

#[async_trait::async_trait]
impl<R: Runtime> QueueRepository for MemoryQueueRepository<R> {
    fn initialize(&self) -> Result<Vec<SubscriptionSet>, DispatchError> {
        let mut initialized = self.initialized.lock();
        if *initialized {
            return Err(already_initialized("memory-repository"));
        }
        *initialized = true;
        Ok(Vec::new())
    }

    fn arm(&self, handler: DequeueHandler) {
        for queue in self.queues.lock().values() {
            queue.set_dequeue_handler(handler.clone());
        }
        *self.handler.lock() = Some(handler);
    }

    fn register_or_update(&self, set: &SubscriptionSet) -> Result<(), DispatchError> {
        let mut queues = self.queues.lock();
        if queues.contains_key(&set.location) {
            return Ok(());
        }
        let queue = Arc::new(MemoryQueue::new(self.retry_interval, self.runtime.clone()));
        if let Some(handler) = self.handler.lock().clone() {
            queue.set_dequeue_handler(handler);
        }
        queues.insert(set.location.clone(), queue);
        Ok(())
    }

    fn delete(&self, location: &str) -> Result<(), DispatchError> {
        self.queues.lock().remove(location);
        Ok(())
    }

    fn get(&self, location: &str) -> Option<Arc<dyn DispatchQueue>> {
        self.queues
            .lock()
            .get(location)
            .map(|q| q.clone() as Arc<dyn DispatchQueue>)
    }

    async fn dispose(&self) {
        let queues: Vec<_> = self.queues.lock().drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.dispose().await;
        }
    }
}

/// Durable repository: creates [`DurableQueue`]s rooted at `<root>/<encoded
/// location>/`, alongside a `<root>/<encoded location>.json` descriptor
/// document so the set can be recovered on restart without external
/// coordination (§4.6, §6 "Durable state layout").
pub struct DurableQueueRepository<R: Runtime> {
    root: PathBuf,
    retry_interval: Duration,
    runtime: R,
    queues: Mutex<HashMap<String, Arc<DurableQueue<R>>>>,
    handler: Mutex<Option<DequeueHandler>>,
    initialized: Mutex<bool>,
}

impl<R: Runtime> DurableQueueRepository<R> {
    /// Build a repository rooted at `root`, creating the directory if
    /// absent.
    pub fn new(root: PathBuf, retry_interval: Duration, runtime: R) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retry_interval,
            runtime,
            queues: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            initialized: Mutex::new(false),
        })
    }

    fn descriptor_path(&self, location: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_location(location)))
    }

    fn open_queue(&self, location: &str) -> Result<Arc<DurableQueue<R>>, DispatchError> {
        let dir = queue_dir(&self.root, location);
        DurableQueue::open(&dir, self.retry_interval, self.runtime.clone()).map_err(|e| {
            DispatchError::QueueIoError {
                location: location.to_string(),
                details: e.to_string(),
            }
        }).map(Arc::new)
    }
}

#[async_trait::async_trait]
impl<R: Runtime> QueueRepository for DurableQueueRepository<R> {
    fn initialize(&self) -> Result<Vec<SubscriptionSet>, DispatchError> {
        let mut initialized = self.initialized.lock();
        if *initialized {
            return Err(already_initialized("durable-repository"));
        }
        *initialized = true;

        let mut pending = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| DispatchError::QueueIoError {
            location: self.root.to_string_lossy().to_string(),
            details: e.to_string(),
        })?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let document = match fs::read_to_string(&path) {
                Ok(document) => document,
                Err(error) => {
                    log::warn!("failed to read descriptor {}: {error}", path.display());
                    continue;
                }
            };
            let set: SubscriptionSet = match serde_json::from_str(&document) {
                Ok(set) => set,
                Err(error) => {
                    log::warn!("failed to parse descriptor {}: {error}", path.display());
                    continue;
                }
            };

            let queue = match self.open_queue(&set.location) {
                Ok(queue) => queue,
                Err(error) => {
                    log::warn!("failed to open durable queue for {}: {error}", set.location);
                    continue;
                }
            };
            // No handler attached yet: the caller must adopt `pending` back
            // into the store before calling `arm`, or a delivery that
            // completes immediately would find this location unregistered.
            self.queues.lock().insert(set.location.clone(), queue);
            pending.push(set);
        }

        Ok(pending)
    }

    fn arm(&self, handler: DequeueHandler) {
        for queue in self.queues.lock().values() {
            queue.set_dequeue_handler(handler.clone());
        }
        *self.handler.lock() = Some(handler);
    }

    fn register_or_update(&self, set: &SubscriptionSet) -> Result<(), DispatchError> {
        let document = serde_json::to_vec(set).map_err(|e| DispatchError::MalformedSubscription(e.to_string()))?;
        fs::write(self.descriptor_path(&set.location), document).map_err(|e| DispatchError::QueueIoError {
            location: set.location.clone(),
            details: e.to_string(),
        })?;

        let mut queues = self.queues.lock();
        if queues.contains_key(&set.location) {
            return Ok(());
        }
        let queue = self.open_queue(&set.location)?;
        if let Some(handler) = self.handler.lock().clone() {
            queue.set_dequeue_handler(handler);
        }
        queues.insert(set.location.clone(), queue);
        Ok(())
    }

    fn delete(&self, location: &str) -> Result<(), DispatchError> {
        self.queues.lock().remove(location);
        let _ = fs::remove_file(self.descriptor_path(location));
        let _ = fs::remove_dir_all(queue_dir(&self.root, location));
        Ok(())
    }

    fn get(&self, location: &str) -> Option<Arc<dyn DispatchQueue>> {
        self.queues
            .lock()
            .get(location)
            .map(|q| q.clone() as Arc<dyn DispatchQueue>)
    }

    async fn dispose(&self) {
        let queues: Vec<_> = self.queues.lock().drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.dispose().await;
        }
    }
}
