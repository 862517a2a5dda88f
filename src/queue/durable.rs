//! # Durable dispatch queue
//!
//! Per-subscriber variant used by expiring subscription sets (§4.5: "sets
//! with `has_expiration = true` get a dedicated durable queue"). Backed by a
//! [`SegmentLog`]; items survive a process restart and are redelivered in
//! their original enqueue order, per §4.7's recovery contract.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spin::Mutex;

use super::{DeliveryEngine, DequeueHandler, DispatchItem, DispatchQueue, ItemStore, QueueState};
use crate::durable::{EntryId, SegmentLog};
use crate::error::DispatchError;
use crate::runtime::Runtime;

struct DurableItemStore {
    log: Arc<SegmentLog>,
    pending: Mutex<VecDeque<(EntryId, DispatchItem)>>,
}

impl ItemStore for DurableItemStore {
    fn push(&self, item: DispatchItem) -> Result<(), DispatchError> {
        let id = self.log.append(&item)?;
        self.pending.lock().push_back((id, item));
        Ok(())
    }

    fn current(&self) -> Option<DispatchItem> {
        self.pending.lock().front().map(|(_, item)| item.clone())
    }

    fn commit_current(&self) -> Result<(), DispatchError> {
        let front = self.pending.lock().pop_front();
        if let Some((id, _)) = front {
            self.log.commit(id)?;
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// The durable, per-subscriber delivery queue. One of these lives per
/// expiring subscription set, rooted at `queue_dir(root, location)`
/// ([`crate::durable::queue_dir`]).
pub struct DurableQueue<R: Runtime> {
    engine: Arc<DeliveryEngine<R>>,
    log: Arc<SegmentLog>,
}

impl<R: Runtime> DurableQueue<R> {
    /// Open (or recover) the durable queue rooted at `dir`, replaying any
    /// uncommitted entries onto the delivery engine in their original
    /// enqueue order before returning.
    pub fn open(dir: &Path, retry_interval: Duration, runtime: R) -> std::io::Result<Self> {
        let (log, recovered) = SegmentLog::open(dir)?;
        let log = Arc::new(log);

        let store = Arc::new(DurableItemStore {
            log: log.clone(),
            pending: Mutex::new(recovered.into_iter().collect()),
        });
        let recovered_count = store.pending.lock().len();
        if recovered_count > 0 {
            log::info!("recovered {recovered_count} pending item(s) from {}", dir.display());
        }

        let item_store: Arc<dyn ItemStore> = store;
        Ok(Self {
            engine: DeliveryEngine::new(item_store, retry_interval, runtime),
            log,
        })
    }

    /// The directory backing this queue.
    pub fn dir(&self) -> &Path {
        self.log.dir()
    }
}

#[async_trait::async_trait]
impl<R: Runtime> DispatchQueue for DurableQueue<R> {
    fn enqueue(&self, item: DispatchItem) -> Result<(), DispatchError> {
        self.engine.enqueue(item)
    }

    fn set_dequeue_handler(&self, handler: DequeueHandler) {
        self.engine.set_dequeue_handler(handler);
    }

    fn failure_window(&self) -> Duration {
        self.engine.failure_window()
    }

    fn state(&self) -> QueueState {
        self.engine.state()
    }

    async fn dispose(&self) {
        self.engine.dispose();
        self.log.close();
    }
}
