//! # Per-Subscriber Dispatch Queue
//!
//! One queue per expiring subscription (durable, see [`durable::DurableQueue`])
//! or a single shared queue for all non-expiring subscriptions (in-memory,
//! see [`memory::MemoryQueue`]). Both share the same one-at-a-time delivery
//! state machine, grounded on the teacher's
//! `core::event_engine::{state::State, transition::Transition}` shape:
//! `transition` computes the next state and the effects to run, the queue
//! itself applies the state and runs the effect.
//!
//! ```text
//! Idle --enqueue(non-empty, handler set)--> Delivering
//! Delivering --success--> commit-and-advance --> Delivering (if more) | Idle
//! Delivering --failure--> Backoff (retains current item)
//! Backoff --timer fire--> Delivering (same item)
//! any --dispose--> Disposed
//! ```

pub mod durable;
pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::error::DispatchError;
use crate::event::DispatcherEvent;
use crate::runtime::Runtime;

/// The unit of work stored in a per-subscriber queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchItem {
    /// Where this item should be POSTed.
    pub destination_uri: String,
    /// The (possibly recipient-narrowed) event to deliver.
    pub event: DispatcherEvent,
    /// Location of the subscription set this item was routed for, used to
    /// look up cookies and, for durable queues, the backing directory.
    pub location: String,
}

/// A function that performs the actual HTTP POST for one item, returning
/// `true` iff delivery succeeded (2xx or 304).
pub type DequeueHandler =
    Arc<dyn Fn(DispatchItem) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Observable queue state, exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No current item being delivered.
    Idle,
    /// A delivery attempt is in flight.
    Delivering,
    /// Last delivery failed; a retry timer is armed.
    Backoff,
    /// Terminal: the queue no longer accepts work.
    Disposed,
}

/// Contract shared by both queue variants (§4.5).
#[async_trait::async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Append `item`; if a handler is attached and no delivery is
    /// in-flight, begin delivery.
    fn enqueue(&self, item: DispatchItem) -> Result<(), DispatchError>;

    /// Install the function that performs the actual HTTP POST. A queue
    /// starts idle; it becomes active only after a handler is set.
    fn set_dequeue_handler(&self, handler: DequeueHandler);

    /// Duration since the first consecutive failure, or zero if not
    /// currently failing.
    fn failure_window(&self) -> Duration;

    /// Current state, for diagnostics/tests.
    fn state(&self) -> QueueState;

    /// Release resources. The durable variant additionally stops accepting
    /// work and closes its files.
    async fn dispose(&self);
}

/// Backing storage shared by the memory and durable queue variants: just
/// enough surface for the one-at-a-time delivery engine below to drive
/// enqueue/commit without knowing whether items live in a `VecDeque` or a
/// segmented file log.
pub(crate) trait ItemStore: Send + Sync {
    /// Append `item` to the tail.
    fn push(&self, item: DispatchItem) -> Result<(), DispatchError>;

    /// The current head item, if any, without removing it.
    fn current(&self) -> Option<DispatchItem>;

    /// Commit (remove/mark delivered) the current head item and advance.
    fn commit_current(&self) -> Result<(), DispatchError>;

    /// Whether the store has no pending items.
    fn is_empty(&self) -> bool;
}

/// Shared one-at-a-time delivery engine used by both queue variants.
///
/// `store` owns the actual items; this type only owns the state machine
/// (current state, failure window bookkeeping) and the attached handler.
pub(crate) struct DeliveryEngine<R: Runtime> {
    store: Arc<dyn ItemStore>,
    state: Mutex<QueueState>,
    handler: Mutex<Option<DequeueHandler>>,
    failure_since: Mutex<Option<Instant>>,
    retry_interval: Duration,
    runtime: R,
}

impl<R: Runtime> DeliveryEngine<R> {
    pub(crate) fn new(store: Arc<dyn ItemStore>, retry_interval: Duration, runtime: R) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: Mutex::new(QueueState::Idle),
            handler: Mutex::new(None),
            failure_since: Mutex::new(None),
            retry_interval,
            runtime,
        })
    }

    pub(crate) fn state(&self) -> QueueState {
        *self.state.lock()
    }

    /// Duration since the first consecutive failure, or zero if not
    /// currently failing.
    pub(crate) fn failure_window(&self) -> Duration {
        self.failure_since
            .lock()
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn set_dequeue_handler(self: &Arc<Self>, handler: DequeueHandler) {
        *self.handler.lock() = Some(handler);
        self.maybe_start_delivery();
    }

    pub(crate) fn enqueue(self: &Arc<Self>, item: DispatchItem) -> Result<(), DispatchError> {
        if matches!(*self.state.lock(), QueueState::Disposed) {
            return Err(DispatchError::QueueIoError {
                location: item.location.clone(),
                details: "queue is disposed".into(),
            });
        }
        self.store.push(item)?;
        self.maybe_start_delivery();
        Ok(())
    }

    pub(crate) fn dispose(&self) {
        *self.state.lock() = QueueState::Disposed;
    }

    /// `Idle + enqueue(handler set, non-empty)` -> `Delivering`.
    /// No-op if already delivering/backing off/disposed, or if the store is
    /// empty, or no handler has been attached yet (a queue starts idle and
    /// becomes active only once a handler is set, per §4.5's contract).
    fn maybe_start_delivery(self: &Arc<Self>) {
        let handler = {
            let guard = self.handler.lock();
            match guard.as_ref() {
                Some(h) => h.clone(),
                None => return,
            }
        };

        let mut state = self.state.lock();
        if *state != QueueState::Idle {
            return;
        }
        let Some(item) = self.store.current() else {
            return;
        };
        *state = QueueState::Delivering;
        drop(state);
        self.run_delivery(handler, item);
    }

    fn run_delivery(self: &Arc<Self>, handler: DequeueHandler, item: DispatchItem) {
        let engine = self.clone();
        self.runtime.spawn(async move {
            let succeeded = handler(item).await;
            engine.on_delivery_complete(succeeded, handler);
        });
    }

    fn on_delivery_complete(self: &Arc<Self>, succeeded: bool, handler: DequeueHandler) {
        if succeeded {
            *self.failure_since.lock() = None;
            if self.store.commit_current().is_err() {
                self.dispose();
                return;
            }
            let mut state = self.state.lock();
            if matches!(*state, QueueState::Disposed) {
                return;
            }
            match self.store.current() {
                Some(next) => {
                    *state = QueueState::Delivering;
                    drop(state);
                    self.run_delivery(handler, next);
                }
                None => *state = QueueState::Idle,
            }
        } else {
            {
                let mut failure_since = self.failure_since.lock();
                if failure_since.is_none() {
                    *failure_since = Some(Instant::now());
                }
            }
            *self.state.lock() = QueueState::Backoff;
            self.arm_retry_timer(handler);
        }
    }

    fn arm_retry_timer(self: &Arc<Self>, handler: DequeueHandler) {
        let engine = self.clone();
        let delay = self.retry_interval;
        self.runtime.spawn(async move {
            engine.runtime.sleep(delay).await;
            let mut state = engine.state.lock();
            if !matches!(*state, QueueState::Backoff) {
                return;
            }
            let Some(item) = engine.store.current() else {
                *state = QueueState::Idle;
                return;
            };
            *state = QueueState::Delivering;
            drop(state);
            engine.run_delivery(handler, item);
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub(crate) struct InMemoryStore {
        items: Mutex<VecDeque<DispatchItem>>,
    }

    impl ItemStore for InMemoryStore {
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
}

#[cfg(test)]
mod should {
    use super::test_support::InMemoryStore;
    use super::*;
    use crate::event::{EventFields, Payload};
    use crate::runtime::TokioRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(n: usize) -> DispatchItem {
        let event = DispatcherEvent::normalise(EventFields {
            channel_uri: "event://x/foo".into(),
            origins: vec!["http://pub/".into()],
            payload: Payload::new("application/json", format!("{{\"n\":{n}}}").into_bytes()),
            ..Default::default()
        })
        .unwrap();
        DispatchItem {
            destination_uri: "http://sub1/".into(),
            event,
            location: "L1".into(),
        }
    }

    #[tokio::test]
    async fn delivers_enqueued_item_once_handler_attached() {
        let store: Arc<dyn ItemStore> = Arc::new(InMemoryStore::default());
        let engine = DeliveryEngine::new(store, Duration::from_millis(5), TokioRuntime);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        engine.enqueue(item(1)).unwrap();
        assert_eq!(engine.state(), QueueState::Idle);

        engine.set_dequeue_handler(Arc::new(move |_item| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn retries_after_failure_until_success() {
        let store: Arc<dyn ItemStore> = Arc::new(InMemoryStore::default());
        let engine = DeliveryEngine::new(store, Duration::from_millis(10), TokioRuntime);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        engine.set_dequeue_handler(Arc::new(move |_item| {
            let attempts = attempts_clone.clone();
            Box::pin(async move { attempts.fetch_add(1, Ordering::SeqCst) >= 2 })
        }));
        engine.enqueue(item(1)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(engine.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn failure_window_is_zero_when_not_failing() {
        let store: Arc<dyn ItemStore> = Arc::new(InMemoryStore::default());
        let engine = DeliveryEngine::new(store, Duration::from_millis(10), TokioRuntime);
        assert_eq!(engine.failure_window(), Duration::ZERO);
    }

    #[tokio::test]
    async fn dispose_rejects_further_enqueues() {
        let store: Arc<dyn ItemStore> = Arc::new(InMemoryStore::default());
        let engine = DeliveryEngine::new(store, Duration::from_millis(10), TokioRuntime);
        engine.dispose();
        assert!(engine.enqueue(item(1)).is_err());
    }
}
