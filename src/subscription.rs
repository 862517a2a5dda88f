//! # Subscription, Subscription Set and Combined Set
//!
//! This module holds the data model described by the subscription-set
//! document: a [`Subscription`] belongs to exactly one [`SubscriptionSet`],
//! sets are registered under a `location` in the [`crate::store`], and the
//! [`CombinedSet`] is the read-only merge of every registered set used to
//! rebuild the dispatcher's match indices.
//!
//! Serialization uses `serde`/`serde_json`, grounded on the teacher's
//! `providers::serialization_serde` pairing of `serde` + `serde_json` (the
//! spec allows any document format; JSON avoids introducing a dependency the
//! rest of the stack doesn't already carry).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Default number of consecutive delivery failures a non-expiring set
/// tolerates before it is evicted.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// A single delivery rule: which channels/resources route to which
/// `destination_uri`, and which recipients it targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    /// Unique id, generated if the document omitted one.
    pub id: String,
    /// Channel URI patterns this subscription matches against.
    pub channels: Vec<String>,
    /// Resource URI patterns this subscription matches against. Empty means
    /// "any resource" and is indexed under the universal resource pattern.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Where matching events are POSTed.
    pub destination_uri: String,
    /// Recipients this subscription cares about. Never empty in a
    /// well-formed document: a subscription with no explicit recipients is
    /// not representable as `spec.md` always requires `one or more
    /// recipient elements`; a [`SubscriptionDocument`] that omits recipients
    /// fails to parse.
    pub recipients: Vec<String>,
    /// Opaque `Set-Cookie` value attached to deliveries for this
    /// subscription, if any.
    #[serde(default)]
    pub cookie: Option<String>,
}

impl Subscription {
    /// Validate the invariant that a proxy `destination_uri` is required
    /// whenever more than one recipient is present (so a single POST can
    /// still be narrowed to the recipients that care, per §4.4).
    fn validate(&self) -> Result<(), DispatchError> {
        if self.channels.is_empty() {
            return Err(DispatchError::MalformedSubscription(
                "subscription must declare at least one channel".into(),
            ));
        }
        if self.recipients.is_empty() {
            return Err(DispatchError::MalformedSubscription(
                "subscription must declare at least one recipient".into(),
            ));
        }
        if url::Url::parse(&self.destination_uri).is_err() {
            return Err(DispatchError::MalformedSubscription(format!(
                "subscription {} has a malformed destination_uri",
                self.id
            )));
        }
        if self.recipients.len() > 1
            && self.recipients.iter().any(|r| r == &self.destination_uri)
        {
            return Err(DispatchError::MalformedSubscription(format!(
                "subscription {} has multiple recipients but destination_uri is not a proxy",
                self.id
            )));
        }
        Ok(())
    }
}

/// A group of subscriptions managed as a unit, registered under a single
/// `owner_uri` and `location`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionSet {
    /// Globally unique owner URI for this set.
    pub owner_uri: String,
    /// Opaque key this set is registered under; also the durable queue's
    /// on-disk directory name (percent-encoded, see [`crate::uri::encode_location`]).
    pub location: String,
    /// Document version used for optimistic replacement (`replace` is a
    /// no-op if the new version isn't strictly greater).
    #[serde(default)]
    pub version: Option<u64>,
    /// Consecutive delivery failures tolerated before eviction. Only
    /// meaningful for non-expiring sets.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Immutable for the lifetime of the set: selects the durable vs.
    /// in-memory queue class.
    pub has_expiration: bool,
    /// The subscriptions owned by this set.
    pub subscriptions: Vec<Subscription>,
    /// `Set-Cookie` values carried by this set, merged into the shared
    /// cookie jar on registration/replacement.
    #[serde(default)]
    pub cookies: Vec<String>,
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_FAILURES
}

impl SubscriptionSet {
    /// Parse and validate a subscription-set document, assigning fresh ids
    /// to any subscription that omitted one.
    pub fn from_document(location: &str, document: &str) -> Result<Self, DispatchError> {
        let mut set: SubscriptionSet = serde_json::from_str(document)
            .map_err(|e| DispatchError::MalformedSubscription(e.to_string()))?;

        if set.owner_uri.is_empty() {
            return Err(DispatchError::MalformedSubscription(
                "subscription set must declare uri.owner".into(),
            ));
        }
        set.location = location.to_string();

        for subscription in &mut set.subscriptions {
            if subscription.id.is_empty() {
                subscription.id = Uuid::new_v4().to_string();
            }
            subscription.validate()?;
        }

        Ok(set)
    }

    /// `version` treated as `0` when absent, so an un-versioned document
    /// always loses to any versioned replacement and a first registration
    /// always succeeds.
    pub fn effective_version(&self) -> u64 {
        self.version.unwrap_or(0)
    }
}

/// The read-only, dispatcher-wide merge of every registered set.
///
/// Deduplicated per `(channel, resource)`; each subscription's destination
/// is replaced with the local dispatcher's own publish endpoint so that
/// publishers address the dispatcher, not the end subscriber, when they
/// observe the combined set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CombinedSet {
    /// This dispatcher's own identity, used as the combined set's owner.
    pub owner_uri: String,
    /// Monotonically increasing version, incremented on every rebuild.
    pub version: u64,
    /// Merged, deduplicated subscriptions with destinations rewritten to
    /// the dispatcher's publish endpoint.
    pub subscriptions: Vec<Subscription>,
}

impl CombinedSet {
    /// Build the combined set from every registered set's subscriptions.
    ///
    /// Deduplication key is `(channels, resources)` joined, matching the
    /// spec's "deduplicating per (channel, resource)"; first occurrence
    /// wins.
    pub fn build(
        owner_uri: &str,
        version: u64,
        publish_endpoint: &str,
        sets: impl IntoIterator<Item = SubscriptionSet>,
    ) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut subscriptions = Vec::new();

        for set in sets {
            for mut subscription in set.subscriptions {
                let key = (subscription.channels.clone(), subscription.resources.clone());
                if !seen.insert(key) {
                    continue;
                }
                subscription.destination_uri = publish_endpoint.to_string();
                subscriptions.push(subscription);
            }
        }

        Self {
            owner_uri: owner_uri.to_string(),
            version,
            subscriptions,
        }
    }

    /// Serialize this combined set for the `pubsub:///set/update` broadcast
    /// payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, DispatchError> {
        serde_json::to_vec(self).map_err(|e| DispatchError::MalformedSubscription(e.to_string()))
    }
}

#[cfg(test)]
mod should {
    use super::*;

    fn doc(owner: &str, has_expiration: bool) -> String {
        format!(
            r#"{{
                "owner_uri": "{owner}",
                "location": "",
                "has_expiration": {has_expiration},
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
    fn assign_fresh_subscription_id_when_absent() {
        let set = SubscriptionSet::from_document("L1", &doc("http://a/", false)).unwrap();
        assert!(!set.subscriptions[0].id.is_empty());
    }

    #[test]
    fn reject_document_without_owner() {
        let err = SubscriptionSet::from_document("L1", &doc("", false)).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedSubscription(_)));
    }

    #[test]
    fn reject_multi_recipient_subscription_without_proxy() {
        let document = r#"{
            "owner_uri": "http://a/",
            "location": "",
            "has_expiration": false,
            "subscriptions": [
                {
                    "id": "s1",
                    "channels": ["event://*/foo"],
                    "destination_uri": "http://sub1/",
                    "recipients": ["user:alice", "http://sub1/"]
                }
            ]
        }"#;
        let err = SubscriptionSet::from_document("L1", document).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedSubscription(_)));
    }

    #[test]
    fn deduplicate_combined_set_by_channel_and_resource() {
        let a = SubscriptionSet::from_document("L1", &doc("http://a/", false)).unwrap();
        let b = SubscriptionSet::from_document("L2", &doc("http://b/", false)).unwrap();
        let combined = CombinedSet::build("http://dispatcher/", 1, "http://dispatcher/publish", [a, b]);
        assert_eq!(combined.subscriptions.len(), 1);
        assert_eq!(combined.subscriptions[0].destination_uri, "http://dispatcher/publish");
    }
}
