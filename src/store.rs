//! # Subscription Set Store
//!
//! Owns the two maps named in §4.2 (`owner → set`, `location → set`) plus
//! the derived match indices, and drives the rebuild-and-broadcast sequence
//! that follows every mutation. Grounded on the teacher's
//! `EventEngine::process_transition` discipline: compute new state, then
//! swap it in under lock, rather than mutating shared structures in place
//! (§9's "swap index snapshots wholesale").
//!
//! Lock ordering (§5), acquired in this order and never held across I/O:
//! 1. `state` (owner/location maps) — also guards queue repository calls.
//! 2/3. `indices` (channel/resource/recipient maps) — swapped as one unit,
//!    since they are always rebuilt and replaced together.
//! 4. `failures` (per-location consecutive failure counts).
//! 5. Per-queue locks, owned by the queues themselves, never by the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::cookie::CookieJar;
use crate::error::DispatchError;
use crate::matcher::{UriMatcher, UriMatcherBuilder};
use crate::queue::DispatchQueue;
use crate::repository::QueueRepository;
use crate::subscription::{CombinedSet, Subscription, SubscriptionSet};
use crate::uri::UNIVERSAL_RESOURCE_PATTERN;

struct StoreState {
    owner_index: HashMap<String, String>,
    sets: HashMap<String, SubscriptionSet>,
}

struct Indices {
    channel_matcher: UriMatcher,
    resource_matcher: UriMatcher,
    recipient_index: HashMap<String, HashSet<String>>,
    subscriptions: HashMap<String, (Subscription, String)>,
    combined_set: CombinedSet,
}

impl Default for Indices {
    fn default() -> Self {
        Self {
            channel_matcher: UriMatcher::default(),
            resource_matcher: UriMatcher::default(),
            recipient_index: HashMap::new(),
            subscriptions: HashMap::new(),
            combined_set: CombinedSet {
                owner_uri: String::new(),
                version: 0,
                subscriptions: Vec::new(),
            },
        }
    }
}

type Observer = Arc<dyn Fn(&CombinedSet) + Send + Sync>;

/// In-memory registry of every subscription set, the derived match indices,
/// and the combined-set rebuild/broadcast sequence (§4.2).
pub struct SubscriptionSetStore {
    owner_uri: String,
    default_max_failures: u32,
    state: RwLock<StoreState>,
    indices: RwLock<Arc<Indices>>,
    /// Serializes the whole read-old-version, build, swap sequence in
    /// [`Self::rebuild`] so concurrent `register`/`replace`/`remove` calls
    /// can't both read the same version and publish the same next one.
    rebuild_lock: Mutex<()>,
    failures: RwLock<HashMap<String, u32>>,
    cookie_jar: Arc<CookieJar>,
    memory_queue: Arc<dyn DispatchQueue>,
    repository: Arc<dyn QueueRepository>,
    observers: RwLock<Vec<Observer>>,
}

impl SubscriptionSetStore {
    /// Build an empty store. `owner_uri` is the dispatcher's own identity,
    /// used both for loop detection upstream (`dispatch.rs`) and as the
    /// combined set's owner and publish endpoint.
    pub fn new(
        owner_uri: String,
        default_max_failures: u32,
        cookie_jar: Arc<CookieJar>,
        memory_queue: Arc<dyn DispatchQueue>,
        repository: Arc<dyn QueueRepository>,
    ) -> Self {
        Self {
            owner_uri,
            default_max_failures,
            state: RwLock::new(StoreState {
                owner_index: HashMap::new(),
                sets: HashMap::new(),
            }),
            indices: RwLock::new(Arc::new(Indices::default())),
            rebuild_lock: Mutex::new(()),
            failures: RwLock::new(HashMap::new()),
            cookie_jar,
            memory_queue,
            repository,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Re-register a set recovered from durable storage, without persisting
    /// it again (used by [`crate::repository::QueueRepository::initialize`]'s
    /// `pending_sets`, see §4.6).
    pub fn adopt_recovered(&self, set: SubscriptionSet) {
        {
            let mut state = self.state.write();
            state.owner_index.insert(set.owner_uri.clone(), set.location.clone());
            self.cookie_jar.set_cookies(&set.location, set.cookies.clone());
            state.sets.insert(set.location.clone(), set);
        }
        self.rebuild();
    }

    /// `register(location, document, access_key) → (set, existed)` (§4.2,
    /// §6). `access_key` is threaded through unchecked (Non-goal:
    /// authentication is out of scope).
    pub fn register(
        &self,
        location: &str,
        document: &str,
        _access_key: &str,
    ) -> Result<(SubscriptionSet, bool), DispatchError> {
        let set = SubscriptionSet::from_document(location, document)?;

        {
            let state = self.state.read();
            if let Some(existing_location) = state.owner_index.get(&set.owner_uri) {
                return Ok((state.sets[existing_location].clone(), true));
            }
            if let Some(existing) = state.sets.get(location) {
                return Ok((existing.clone(), true));
            }
        }

        if set.has_expiration {
            self.repository.register_or_update(&set)?;
        }

        {
            let mut state = self.state.write();
            state.owner_index.insert(set.owner_uri.clone(), location.to_string());
            state.sets.insert(location.to_string(), set.clone());
        }
        self.cookie_jar.set_cookies(location, set.cookies.clone());

        self.rebuild();
        Ok((set, false))
    }

    /// `replace(location, document, access_key) → set | null` (§4.2, §6).
    pub fn replace(
        &self,
        location: &str,
        document: &str,
        _access_key: &str,
    ) -> Result<Option<SubscriptionSet>, DispatchError> {
        let current = match self.state.read().sets.get(location).cloned() {
            Some(current) => current,
            None => return Ok(None),
        };

        let new_set = SubscriptionSet::from_document(location, document)?;

        if new_set.owner_uri != current.owner_uri {
            return Err(DispatchError::OwnerMismatch {
                location: location.to_string(),
                expected: current.owner_uri,
                actual: new_set.owner_uri,
            });
        }
        if new_set.has_expiration != current.has_expiration {
            return Err(DispatchError::ExpirationTypeChanged(location.to_string()));
        }
        if new_set.effective_version() <= current.effective_version() {
            return Ok(Some(current));
        }

        if new_set.has_expiration {
            self.repository.register_or_update(&new_set)?;
        }

        {
            let mut state = self.state.write();
            state.sets.insert(location.to_string(), new_set.clone());
        }
        self.cookie_jar.set_cookies(location, new_set.cookies.clone());

        self.rebuild();
        Ok(Some(new_set))
    }

    /// `remove(location) → bool` (§4.2, §6).
    pub fn remove(&self, location: &str) -> Result<bool, DispatchError> {
        let removed = {
            let mut state = self.state.write();
            match state.sets.remove(location) {
                Some(set) => {
                    state.owner_index.remove(&set.owner_uri);
                    Some(set)
                }
                None => None,
            }
        };

        let Some(set) = removed else {
            return Ok(false);
        };

        if set.has_expiration {
            self.repository.delete(location)?;
        }
        self.cookie_jar.clear(location);
        self.failures.write().remove(location);

        self.rebuild();
        Ok(true)
    }

    /// `get(location) → set?`.
    pub fn get(&self, location: &str) -> Option<SubscriptionSet> {
        self.state.read().sets.get(location).cloned()
    }

    /// `all() → set[]`.
    pub fn all(&self) -> Vec<SubscriptionSet> {
        self.state.read().sets.values().cloned().collect()
    }

    /// The current combined set.
    pub fn combined_set(&self) -> CombinedSet {
        self.indices.read().combined_set.clone()
    }

    /// Register a callback fired every time the combined set is rebuilt
    /// (`OnCombinedSetUpdated`, §4.2).
    pub fn on_combined_set_updated(&self, observer: Observer) {
        self.observers.write().push(observer);
    }

    /// Subscriptions matching `channel` and `resource`, narrowed by the
    /// resource index first (§4.4 step 1).
    pub fn matches_by_channel(&self, channel: &str, resource: Option<&str>) -> HashSet<String> {
        let indices = self.indices.read();
        let resource_ids = indices.resource_matcher.matches_resource(resource);
        indices.channel_matcher.matches_within(channel, &resource_ids)
    }

    /// Subscriptions targeted by any of `recipients` through the recipient
    /// index (§4.4 step 1, "recipients non-empty" branch).
    pub fn matches_by_recipients(&self, recipients: &[String]) -> HashSet<String> {
        let indices = self.indices.read();
        let mut result = HashSet::new();
        for recipient in recipients {
            if let Some(ids) = indices.recipient_index.get(recipient) {
                result.extend(ids.iter().cloned());
            }
        }
        result
    }

    /// Look up a subscription by id, alongside the location of its owning
    /// set (used to resolve the set's durable queue and failure bookkeeping).
    pub fn subscription(&self, id: &str) -> Option<(Subscription, String)> {
        self.indices.read().subscriptions.get(id).cloned()
    }

    /// The shared, non-durable queue used by every non-expiring set.
    pub fn memory_queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.memory_queue
    }

    /// The durable queue registered for `location`, if any.
    pub fn durable_queue(&self, location: &str) -> Option<Arc<dyn DispatchQueue>> {
        self.repository.get(location)
    }

    /// Recover any sets the queue repository finds on disk, returning them
    /// so callers can feed each one into [`Self::adopt_recovered`] before
    /// calling [`Self::arm_repository`] (§4.6).
    pub fn initialize_repository(&self) -> Result<Vec<SubscriptionSet>, DispatchError> {
        self.repository.initialize()
    }

    /// Wire `handler` onto the queue repository. Must only be called after
    /// every set from [`Self::initialize_repository`] has been adopted, so a
    /// delivery that completes immediately always finds its set registered.
    pub fn arm_repository(&self, handler: crate::queue::DequeueHandler) {
        self.repository.arm(handler);
    }

    /// The shared cookie jar.
    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.cookie_jar
    }

    /// Record a delivery failure for a non-expiring set's location,
    /// evicting it once its failure count exceeds `max_failures` (§4.4).
    /// Returns whether the set was evicted.
    pub fn record_failure(&self, location: &str) -> bool {
        let max_failures = self
            .state
            .read()
            .sets
            .get(location)
            .map(|set| set.max_failures)
            .unwrap_or(self.default_max_failures);

        let exceeded = {
            let mut failures = self.failures.write();
            let count = failures.entry(location.to_string()).or_insert(0);
            *count += 1;
            *count > max_failures
        };

        if exceeded {
            let _ = self.remove(location);
        }
        exceeded
    }

    /// Clear a location's consecutive failure count (§4.4: "success clears
    /// the failure count").
    pub fn record_success(&self, location: &str) {
        self.failures.write().remove(location);
    }

    /// Rebuild the match indices and combined set from the current
    /// registered sets, then swap them in and fire observers (§4.2's
    /// `Rebuild` sequence).
    fn rebuild(&self) {
        // Held for the entire read-old-version -> build -> swap sequence
        // (§4.2's "acquire the store lock"), so two concurrent rebuilds
        // can't both read version N and both publish N+1 (§3: "Combined
        // Set's version is strictly increasing").
        let _rebuild_guard = self.rebuild_lock.lock();

        let sets: Vec<SubscriptionSet> = self.state.read().sets.values().cloned().collect();

        let mut channel_builder = UriMatcherBuilder::new();
        let mut resource_builder = UriMatcherBuilder::new();
        let mut recipient_index: HashMap<String, HashSet<String>> = HashMap::new();
        let mut subscriptions: HashMap<String, (Subscription, String)> = HashMap::new();

        for set in &sets {
            for subscription in &set.subscriptions {
                subscriptions.insert(subscription.id.clone(), (subscription.clone(), set.location.clone()));

                for channel in &subscription.channels {
                    channel_builder.add(channel, &subscription.id);
                }
                if subscription.resources.is_empty() {
                    resource_builder.add(UNIVERSAL_RESOURCE_PATTERN, &subscription.id);
                } else {
                    for resource in &subscription.resources {
                        resource_builder.add(resource, &subscription.id);
                    }
                }
                for recipient in &subscription.recipients {
                    recipient_index
                        .entry(recipient.clone())
                        .or_default()
                        .insert(subscription.id.clone());
                }
            }
        }

        let next_version = self.indices.read().combined_set.version + 1;
        let combined_set = CombinedSet::build(&self.owner_uri, next_version, &self.owner_uri, sets);

        let new_indices = Arc::new(Indices {
            channel_matcher: channel_builder.build(),
            resource_matcher: resource_builder.build(),
            recipient_index,
            subscriptions,
            combined_set: combined_set.clone(),
        });
        *self.indices.write() = new_indices;

        for observer in self.observers.read().iter() {
            observer(&combined_set);
        }
    }
}

#[cfg(test)]
mod should {
    use super::*;
    use crate::queue::memory::MemoryQueue;
    use crate::repository::MemoryQueueRepository;
    use crate::runtime::TokioRuntime;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn store() -> SubscriptionSetStore {
        let memory_queue: Arc<dyn DispatchQueue> =
            Arc::new(MemoryQueue::new(Duration::from_secs(60), TokioRuntime));
        let repository: Arc<dyn QueueRepository> =
            Arc::new(MemoryQueueRepository::new(Duration::from_secs(60), TokioRuntime));
        SubscriptionSetStore::new(
            "http://dispatcher/".into(),
            5,
            Arc::new(CookieJar::new()),
            memory_queue,
            repository,
        )
    }

    fn doc(owner: &str) -> String {
        format!(
            r#"{{
                "owner_uri": "{owner}",
                "location": "",
                "has_expiration": false,
                "subscriptions": [
                    {{
                        "id": "",
                        "channels": ["event://*/foo"],
                        "destination_uri": "http://sub1/",
                        "recipients": ["user:alice"]
                    }}
                ]
            }}"#
        )
    }

    #[test]
    fn register_is_idempotent_on_owner_collision() {
        let store = store();
        let (first, existed_first) = store.register("L1", &doc("http://a/"), "key").unwrap();
        let (second, existed_second) = store.register("L2", &doc("http://a/"), "key").unwrap();
        assert!(!existed_first);
        assert!(existed_second);
        assert_eq!(first.location, second.location);
    }

    #[test]
    fn combined_set_version_strictly_increases_on_replace() {
        let store = store();
        store.register("L1", &doc("http://a/"), "key").unwrap();
        let before = store.combined_set().version;

        let document = r#"{
            "owner_uri": "http://a/",
            "location": "",
            "version": 2,
            "has_expiration": false,
            "subscriptions": [
                { "id": "", "channels": ["event://*/bar"], "destination_uri": "http://sub1/", "recipients": ["user:alice"] }
            ]
        }"#;
        store.replace("L1", document, "key").unwrap();
        assert!(store.combined_set().version > before);
    }

    #[test]
    fn replace_rejects_owner_change() {
        let store = store();
        store.register("L1", &doc("http://a/"), "key").unwrap();
        let document = r#"{
            "owner_uri": "http://b/",
            "location": "",
            "version": 2,
            "has_expiration": false,
            "subscriptions": [
                { "id": "", "channels": ["event://*/foo"], "destination_uri": "http://sub1/", "recipients": ["user:alice"] }
            ]
        }"#;
        let err = store.replace("L1", document, "key").unwrap_err();
        assert!(matches!(err, DispatchError::OwnerMismatch { .. }));
    }

    #[test]
    fn index_coherence_after_register() {
        let store = store();
        store.register("L1", &doc("http://a/"), "key").unwrap();
        let matches = store.matches_by_channel("event://x/foo", None);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn eviction_removes_set_after_exceeding_max_failures() {
        let store = store();
        let document = r#"{
            "owner_uri": "http://a/",
            "location": "",
            "max_failures": 2,
            "has_expiration": false,
            "subscriptions": [
                { "id": "", "channels": ["event://*/foo"], "destination_uri": "http://sub1/", "recipients": ["user:alice"] }
            ]
        }"#;
        store.register("L1", document, "key").unwrap();

        assert!(!store.record_failure("L1"));
        assert!(!store.record_failure("L1"));
        assert!(store.record_failure("L1"));
        assert!(store.get("L1").is_none());
    }

    #[test]
    fn observer_fires_once_per_rebuild() {
        let store = store();
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        store.on_combined_set_updated(Arc::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        store.register("L1", &doc("http://a/"), "key").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_registrations_never_publish_a_duplicate_version() {
        let store = Arc::new(store());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = observed.clone();
        store.on_combined_set_updated(Arc::new(move |combined_set| {
            observed_clone.lock().push(combined_set.version);
        }));

        const REGISTRATIONS: usize = 20;
        let threads: Vec<_> = (0..REGISTRATIONS)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let owner = format!("http://owner-{i}/");
                    store.register(&format!("L{i}"), &doc(&owner), "key").unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut versions = observed.lock().clone();
        versions.sort_unstable();
        let mut deduped = versions.clone();
        deduped.dedup();
        assert_eq!(versions.len(), REGISTRATIONS, "every registration should rebuild exactly once");
        assert_eq!(deduped.len(), versions.len(), "no two rebuilds should publish the same version");
        assert_eq!(store.combined_set().version as usize, REGISTRATIONS);
    }
}
