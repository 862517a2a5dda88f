//! # Dispatch Core
//!
//! The dispatcher's single public entry point: [`DispatchCore::dispatch`].
//! Grounded directly on the teacher's `EventEngine::new`, which pairs an
//! `async_channel::bounded` channel with a fixed pool of worker tasks
//! draining it (`effect_dispatcher`); here each worker resolves listeners,
//! narrows recipients, and routes one [`crate::queue::DispatchItem`] per
//! matching subscription onto the correct queue (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::event::{DispatcherEvent, Payload};
use crate::queue::{DequeueHandler, DispatchItem};
use crate::runtime::Runtime;
use crate::store::SubscriptionSetStore;
use crate::subscription::Subscription;
use crate::transport::{Delivery, DeliveryOutcome};

/// Channel on which the combined-set broadcast is published (§6).
const COMBINED_SET_CHANNEL: &str = "pubsub:///set/update";

/// Capacity of the bounded in-process dispatch channel. Not itself a
/// documented config knob (§6 only names `worker_concurrency`, the number of
/// *consumers*); sized generously so `dispatch` rarely blocks on a healthy
/// system while still bounding memory if workers fall behind.
const DISPATCH_CHANNEL_CAPACITY: usize = 1024;

/// Accepts events, resolves matching subscribers, and routes one item per
/// subscription onto its queue (§4.4).
pub struct DispatchCore<R: Runtime> {
    owner_uri: String,
    store: Arc<SubscriptionSetStore>,
    delivery: Arc<dyn Delivery>,
    sender: async_channel::Sender<DispatcherEvent>,
    _runtime: R,
}

impl<R: Runtime> DispatchCore<R> {
    /// Build the dispatch core, start its worker pool, recover any durable
    /// queues, and wire the combined-set rebuild observer back through
    /// [`Self::dispatch`] (so the broadcast goes through the same matching
    /// path as any other event).
    ///
    /// `store` must not yet have had a handler attached to its queues; this
    /// constructor owns that wiring.
    pub fn new(
        config: &DispatcherConfig,
        store: Arc<SubscriptionSetStore>,
        delivery: Arc<dyn Delivery>,
        runtime: R,
    ) -> Result<Arc<Self>, DispatchError> {
        let (sender, receiver) = async_channel::bounded(DISPATCH_CHANNEL_CAPACITY);

        let core = Arc::new(Self {
            owner_uri: config.service_owner_uri.clone(),
            store: store.clone(),
            delivery,
            sender,
            _runtime: runtime.clone(),
        });

        for _ in 0..config.worker_concurrency.max(1) {
            let core = core.clone();
            let receiver = receiver.clone();
            runtime.spawn(async move {
                while let Ok(event) = receiver.recv().await {
                    core.process(event).await;
                }
            });
        }

        let handler = core.build_dequeue_handler();
        // Recovered sets must be adopted into the store before the handler
        // is wired onto their queues: `deliver_and_record` looks the set up
        // by location, and a delivery that completes before adoption would
        // find nothing there and be miscounted as belonging to a
        // non-expiring set.
        for recovered in store.initialize_repository()? {
            store.adopt_recovered(recovered);
        }
        store.memory_queue().set_dequeue_handler(handler.clone());
        store.arm_repository(handler);

        let observer_core = core.clone();
        store.on_combined_set_updated(Arc::new(move |combined_set| {
            match combined_set.to_payload() {
                Ok(document) => {
                    let event = DispatcherEvent::combined_set_update(Payload::new("application/json", document));
                    if let Err(error) = observer_core.dispatch(event) {
                        log::warn!("failed to broadcast combined set update: {error}");
                    }
                }
                Err(error) => log::warn!("failed to serialize combined set: {error}"),
            }
        }));

        Ok(core)
    }

    /// Accept an event for dispatch (§4.4 steps 1–3). Non-blocking; fails
    /// fast with [`DispatchError::EnqueueFailed`] if the worker channel is
    /// full or closed, and with [`DispatchError::LoopDetected`] if this
    /// dispatcher already appears in `event.via`.
    ///
    /// The synthetic combined-set broadcast is exempt from the `via` check:
    /// it carries no prior `via` and is recognised by channel scheme instead
    /// (Open Question resolution, SPEC_FULL.md §8.2).
    pub fn dispatch(&self, event: DispatcherEvent) -> Result<(), DispatchError> {
        let event_id = event.id().to_string();

        let routed = if event.is_combined_set_update() {
            event
        } else {
            if event.via().iter().any(|hop| hop == &self.owner_uri) {
                return Err(DispatchError::LoopDetected { event_id });
            }
            event.with_via(&self.owner_uri)
        };

        self.sender
            .try_send(routed)
            .map_err(|_| DispatchError::EnqueueFailed { event_id })
    }

    async fn process(&self, event: DispatcherEvent) {
        let subscription_ids = if event.recipients().is_empty() {
            self.store.matches_by_channel(event.channel_uri(), event.resource_uri())
        } else {
            self.store.matches_by_recipients(event.recipients())
        };

        let mut by_destination: HashMap<String, Vec<(Subscription, String)>> = HashMap::new();
        for id in subscription_ids {
            if let Some(entry) = self.store.subscription(&id) {
                by_destination.entry(entry.0.destination_uri.clone()).or_default().push(entry);
            }
        }

        for (destination, subscriptions) in by_destination {
            let routed_event = if event.recipients().is_empty() {
                event.clone()
            } else {
                let mut narrowed: Vec<String> = event
                    .recipients()
                    .iter()
                    .filter(|recipient| subscriptions.iter().any(|(sub, _)| sub.recipients.contains(*recipient)))
                    .cloned()
                    .collect();
                if narrowed.is_empty() {
                    continue;
                }
                narrowed.sort();
                narrowed.dedup();
                event.with_recipients(narrowed)
            };

            for (_subscription, location) in subscriptions {
                let item = DispatchItem {
                    destination_uri: destination.clone(),
                    event: routed_event.clone(),
                    location: location.clone(),
                };
                self.route_item(item, &location);
            }
        }
    }

    fn route_item(&self, item: DispatchItem, location: &str) {
        match self.store.get(location) {
            Some(set) if set.has_expiration => match self.store.durable_queue(location) {
                Some(queue) => {
                    if let Err(error) = queue.enqueue(item) {
                        log::warn!("failed to enqueue onto durable queue for {location}: {error}");
                    }
                }
                None => log::warn!("no durable queue registered for location {location}; dropping item"),
            },
            Some(_) => {
                if let Err(error) = self.store.memory_queue().enqueue(item) {
                    log::warn!("failed to enqueue onto shared memory queue: {error}");
                }
            }
            None => log::warn!("location {location} no longer registered; dropping item"),
        }
    }

    /// Build the shared dequeue handler installed on every queue: perform
    /// the HTTP delivery, then apply §4.4's per-class completion contract.
    fn build_dequeue_handler(self: &Arc<Self>) -> DequeueHandler {
        let core = self.clone();
        Arc::new(move |item: DispatchItem| {
            let core = core.clone();
            Box::pin(async move { core.deliver_and_record(item).await })
        })
    }

    async fn deliver_and_record(&self, item: DispatchItem) -> bool {
        let outcome = self.delivery.deliver(&item, self.store.cookie_jar()).await;
        let succeeded = matches!(outcome, DeliveryOutcome::Success);

        match self.store.get(&item.location) {
            Some(set) if set.has_expiration => succeeded,
            Some(_) => {
                if succeeded {
                    self.store.record_success(&item.location);
                } else {
                    self.store.record_failure(&item.location);
                }
                // Non-expiring deliveries always report "consumed" to the
                // shared queue; failure bookkeeping lives on the set, not
                // the queue (§4.4, Open Question resolution 1).
                true
            }
            // The set was removed while this delivery was in flight (not a
            // recovery-ordering race: `DispatchCore::new` adopts recovered
            // sets before arming their queues' handlers). Its backing
            // storage is already being torn down by `repository.delete`, so
            // there is nothing left to retain this item for.
            None => true,
        }
    }
}
