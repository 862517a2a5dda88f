//! # In-memory dispatch queue
//!
//! Backing store for non-expiring subscription sets: a shared, immediate
//! FIFO delivery queue. Items are dropped on [`MemoryQueue::dispose`];
//! there is no persistence, matching §4.5's "Memory variant" contract.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use spin::Mutex;

use super::{DeliveryEngine, DequeueHandler, DispatchItem, DispatchQueue, ItemStore, QueueState};
use crate::error::DispatchError;
use crate::runtime::Runtime;

#[derive(Default)]
struct VecDequeStore {
    items: Mutex<VecDeque<DispatchItem>>,
}

impl ItemStore for VecDequeStore {
    fn push(&self, item: DispatchItem) -> Result<(), DispatchError> {
        self.items.lock().push_back(item);
        Ok(())
    }

    fn current(&self) -> Option<DispatchItem> {
        self.items.lock().front().cloned()
    }

    fn commit_current(&self) -> Result<(), DispatchError> {
        self.items.lock().pop_front();
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// The shared, non-durable delivery queue used by every non-expiring
/// subscription set (§3 invariant: "for sets with `has_expiration = false`,
/// there is no [per-subscriber] queue — a shared immediate-delivery queue is
/// used").
pub struct MemoryQueue<R: Runtime> {
    engine: Arc<DeliveryEngine<R>>,
}

impl<R: Runtime> MemoryQueue<R> {
    /// Create a queue idle until [`DispatchQueue::set_dequeue_handler`] is
    /// called.
    pub fn new(retry_interval: Duration, runtime: R) -> Self {
        let store: Arc<dyn ItemStore> = Arc::new(VecDequeStore::default());
        Self {
            engine: DeliveryEngine::new(store, retry_interval, runtime),
        }
    }
}

#[async_trait::async_trait]
impl<R: Runtime> DispatchQueue for MemoryQueue<R> {
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
    }
}
