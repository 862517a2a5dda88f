//! # Event Normaliser
//!
//! Parses/validates inbound messages into an immutable [`DispatcherEvent`].
//! Mutators return new instances sharing the payload, grounded on the
//! teacher's immutable event construction in `dx::subscribe::event_engine::event`.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::DispatchError;

/// Content carried by a dispatched event: a MIME type and raw body bytes,
/// reused verbatim as the outbound HTTP request body. `Bytes` is the same
/// cheaply-cloneable buffer type `reqwest` hands back from a response body,
/// grounded on the teacher's `transport::reqwest` request/response plumbing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// `Content-Type` to attach to the outbound POST.
    pub content_type: String,
    /// Raw body bytes.
    pub body: Bytes,
}

impl Payload {
    /// Construct a payload from owned bytes.
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

/// An event accepted by the dispatcher: a channel, an optional resource, the
/// set of dispatchers this event has already visited (`via`, loop
/// detection), optional targeted recipients, and a payload.
///
/// Immutable after construction; [`Self::with_via`] and
/// [`Self::with_recipients`] return new instances that share the payload's
/// `Bytes` buffer rather than copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherEvent {
    id: String,
    channel_uri: String,
    resource_uri: Option<String>,
    origins: Vec<String>,
    recipients: Vec<String>,
    via: Vec<String>,
    payload: Payload,
}

/// Fields accepted from an inbound message, before normalisation.
#[derive(Debug, Clone, Default)]
pub struct EventFields {
    /// Event id; a fresh UUID is assigned when absent.
    pub id: Option<String>,
    /// Required: the channel this event is published on.
    pub channel_uri: String,
    /// Optional resource narrowing the channel.
    pub resource_uri: Option<String>,
    /// Required unless `resource_uri` is present: at least one origin.
    pub origins: Vec<String>,
    /// Targeted recipients; empty means "broadcast by channel".
    pub recipients: Vec<String>,
    /// Dispatchers already visited by this event.
    pub via: Vec<String>,
    /// Event body.
    pub payload: Payload,
}

impl DispatcherEvent {
    /// Normalise inbound fields into a validated event.
    ///
    /// Fails with [`DispatchError::MalformedEvent`] unless the channel is
    /// present and non-empty, and either a resource or at least one origin
    /// is present (§4.3: "If the event has no resource and no origins,
    /// construction fails").
    pub fn normalise(fields: EventFields) -> Result<Self, DispatchError> {
        if fields.channel_uri.is_empty() {
            return Err(DispatchError::MalformedEvent(
                "event must declare exactly one channel".into(),
            ));
        }
        if fields.resource_uri.is_none() && fields.origins.is_empty() {
            return Err(DispatchError::MalformedEvent(
                "event must declare a resource or at least one origin".into(),
            ));
        }

        Ok(Self {
            id: fields.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            channel_uri: fields.channel_uri,
            resource_uri: fields.resource_uri,
            origins: fields.origins,
            recipients: fields.recipients,
            via: fields.via,
            payload: fields.payload,
        })
    }

    /// Build the synthetic combined-set broadcast event for
    /// `pubsub:///set/update`. Per spec §6 its `origins` are empty; since a
    /// resource is also absent, this bypasses the usual "resource or
    /// origins" requirement intentionally, mirroring the one exception
    /// called out in §4.3/§6.
    pub fn combined_set_update(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_uri: "pubsub:///set/update".to_string(),
            resource_uri: None,
            origins: Vec::new(),
            recipients: Vec::new(),
            via: Vec::new(),
            payload,
        }
    }

    /// Id of this event, unique per event.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Channel this event was published on.
    pub fn channel_uri(&self) -> &str {
        &self.channel_uri
    }

    /// Resource narrowing this event, if any.
    pub fn resource_uri(&self) -> Option<&str> {
        self.resource_uri.as_deref()
    }

    /// Origins that produced this event.
    pub fn origins(&self) -> &[String] {
        &self.origins
    }

    /// Targeted recipients; empty means "broadcast by channel".
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Dispatchers already visited by this event.
    pub fn via(&self) -> &[String] {
        &self.via
    }

    /// This event's payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether this is the synthetic combined-set broadcast, identified by
    /// scheme rather than by `via` (per the Open Question resolution in
    /// SPEC_FULL.md §8.3: self-loops on this channel are filtered by
    /// scheme, not by `via`, since the broadcast carries no prior `via`).
    pub fn is_combined_set_update(&self) -> bool {
        self.channel_uri.starts_with("pubsub:")
    }

    /// A new event with `owner` appended to `via`, sharing this event's
    /// payload.
    pub fn with_via(&self, owner: &str) -> Self {
        let mut via = self.via.clone();
        via.push(owner.to_string());
        Self {
            via,
            ..self.clone()
        }
    }

    /// A new event with `recipients` replaced, sharing this event's payload.
    pub fn with_recipients(&self, recipients: Vec<String>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod should {
    use super::*;

    fn fields() -> EventFields {
        EventFields {
            channel_uri: "event://x/foo".into(),
            origins: vec!["http://pub/".into()],
            payload: Payload::new("application/json", b"{}".to_vec()),
            ..Default::default()
        }
    }

    #[test]
    fn assign_fresh_id_when_absent() {
        let event = DispatcherEvent::normalise(fields()).unwrap();
        assert!(!event.id().is_empty());
    }

    #[test]
    fn reject_event_without_channel() {
        let mut f = fields();
        f.channel_uri = String::new();
        assert!(matches!(
            DispatcherEvent::normalise(f),
            Err(DispatchError::MalformedEvent(_))
        ));
    }

    #[test]
    fn reject_event_without_resource_or_origins() {
        let mut f = fields();
        f.origins.clear();
        assert!(matches!(
            DispatcherEvent::normalise(f),
            Err(DispatchError::MalformedEvent(_))
        ));
    }

    #[test]
    fn accept_event_with_resource_but_no_origins() {
        let mut f = fields();
        f.origins.clear();
        f.resource_uri = Some("res://x/y".into());
        assert!(DispatcherEvent::normalise(f).is_ok());
    }

    #[test]
    fn with_via_appends_without_mutating_original() {
        let event = DispatcherEvent::normalise(fields()).unwrap();
        let routed = event.with_via("http://dispatcher/");
        assert!(event.via().is_empty());
        assert_eq!(routed.via(), ["http://dispatcher/".to_string()]);
    }

    #[test]
    fn recognise_combined_set_update_by_scheme() {
        let event = DispatcherEvent::combined_set_update(Payload::new("application/json", b"{}".to_vec()));
        assert!(event.is_combined_set_update());
        assert!(event.via().is_empty());
    }
}
