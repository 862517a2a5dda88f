//! # URI Matcher
//!
//! Two indices keyed by [`UriPattern`]: a channel index and a resource
//! index. Queries are deterministic, order-independent, and never allocate
//! per-call beyond the returned result set, per §4.1's contract.
//!
//! Grounded on the teacher's index-rebuild discipline (`core::event_engine`'s
//! "compute new structures, then swap under lock") applied by
//! [`crate::store::SubscriptionSetStore::rebuild`], which replaces a whole
//! [`UriMatcher`] atomically rather than mutating one in place.

use std::collections::HashSet;

use crate::uri::{UriPattern, UNIVERSAL_RESOURCE_PATTERN};

/// Immutable, queryable index of subscription ids keyed by URI pattern.
///
/// Built once per rebuild via [`UriMatcherBuilder`] and then never mutated;
/// the store swaps the whole structure when the combined set changes.
#[derive(Debug, Default)]
pub struct UriMatcher {
    entries: Vec<(UriPattern, HashSet<String>)>,
    /// Subscription ids registered under [`UNIVERSAL_RESOURCE_PATTERN`]:
    /// these always match, regardless of the query (including a query for
    /// "no resource"), since the universal pattern's placeholder scheme
    /// (`x://`) never equals a real resource's scheme under ordinary
    /// segment-wise matching.
    universal: HashSet<String>,
}

/// Builder used while replaying every set's subscriptions into a fresh
/// index (see [`crate::store::SubscriptionSetStore::rebuild`]).
#[derive(Debug, Default)]
pub struct UriMatcherBuilder {
    matcher: UriMatcher,
}

impl UriMatcherBuilder {
    /// Start a new, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `subscription_id` under `pattern`.
    pub fn add(&mut self, pattern: &str, subscription_id: &str) -> &mut Self {
        if pattern == UNIVERSAL_RESOURCE_PATTERN {
            self.matcher.universal.insert(subscription_id.to_string());
            return self;
        }

        let parsed = UriPattern::parse(pattern);
        if let Some((_, ids)) = self.matcher.entries.iter_mut().find(|(p, _)| p == &parsed) {
            ids.insert(subscription_id.to_string());
        } else {
            let mut ids = HashSet::new();
            ids.insert(subscription_id.to_string());
            self.matcher.entries.push((parsed, ids));
        }
        self
    }

    /// Finish building, producing an immutable [`UriMatcher`].
    pub fn build(self) -> UriMatcher {
        self.matcher
    }
}

impl UriMatcher {
    /// Every subscription id whose pattern matches `uri`.
    pub fn matches(&self, uri: &str) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|(pattern, _)| pattern.matches(uri))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// [`Self::matches`] intersected with `filter`.
    pub fn matches_within(&self, uri: &str, filter: &HashSet<String>) -> HashSet<String> {
        self.matches(uri)
            .into_iter()
            .filter(|id| filter.contains(id))
            .collect()
    }

    /// Resource-index query. `resource` is `None` when the event declared no
    /// resource, in which case only subscriptions with no resource
    /// declaration (indexed under the universal pattern) apply.
    pub fn matches_resource(&self, resource: Option<&str>) -> HashSet<String> {
        let mut result = self.universal.clone();
        if let Some(uri) = resource {
            result.extend(self.matches(uri));
        }
        result
    }
}
