//! # Outbound HTTP delivery
//!
//! Grounded directly on the teacher's `transport::reqwest::TransportReqwest`:
//! same header-preparation shape, same 2xx/304 success criterion, same
//! `reqwest_client.post(url).body(...)` call shape. The [`Delivery`] trait is
//! the seam `crate::dispatch` and `crate::queue` program against, so tests
//! can substitute a fake without spinning up `wiremock` for every case.

use std::time::Duration;

use crate::cookie::CookieJar;
use crate::error::DispatchError;
use crate::event::DispatcherEvent;
use crate::queue::DispatchItem;

/// Header names event metadata round-trips through, on both the outbound
/// HTTP POST and the durable record format (§6: "Exact names may vary; the
/// contract is that all event metadata round-trips through headers").
pub mod headers {
    use super::*;
    use crate::event::{EventFields, Payload};

    pub const EVENT_ID: &str = "X-Dream-Event-Id";
    pub const EVENT_CHANNEL: &str = "X-Dream-Event-Channel";
    pub const EVENT_RESOURCE: &str = "X-Dream-Event-Resource";
    pub const EVENT_ORIGIN: &str = "X-Dream-Event-Origin";
    pub const EVENT_RECIPIENTS: &str = "X-Dream-Event-Recipients";
    pub const EVENT_VIA: &str = "X-Dream-Event-Via";

    /// Flatten an event's metadata into the repeated `(name, value)` header
    /// pairs used both on the wire and in the durable record format.
    pub fn event_headers(event: &DispatcherEvent) -> Vec<(String, String)> {
        let mut pairs = vec![(EVENT_ID.to_string(), event.id().to_string())];
        pairs.push((EVENT_CHANNEL.to_string(), event.channel_uri().to_string()));
        if let Some(resource) = event.resource_uri() {
            pairs.push((EVENT_RESOURCE.to_string(), resource.to_string()));
        }
        for origin in event.origins() {
            pairs.push((EVENT_ORIGIN.to_string(), origin.clone()));
        }
        for recipient in event.recipients() {
            pairs.push((EVENT_RECIPIENTS.to_string(), recipient.clone()));
        }
        for hop in event.via() {
            pairs.push((EVENT_VIA.to_string(), hop.clone()));
        }
        pairs
    }

    /// Reconstruct an event's fields from its header pairs plus a payload
    /// already extracted from the body/content-type. Used to recover a
    /// durable record back into a [`DispatcherEvent`].
    pub fn headers_to_event_fields(
        pairs: &[(String, String)],
        payload: Payload,
    ) -> Result<EventFields, DispatchError> {
        let mut fields = EventFields {
            payload,
            ..Default::default()
        };

        for (key, value) in pairs {
            match key.as_str() {
                EVENT_ID => fields.id = Some(value.clone()),
                EVENT_CHANNEL => fields.channel_uri = value.clone(),
                EVENT_RESOURCE => fields.resource_uri = Some(value.clone()),
                EVENT_ORIGIN => fields.origins.push(value.clone()),
                EVENT_RECIPIENTS => fields.recipients.push(value.clone()),
                EVENT_VIA => fields.via.push(value.clone()),
                _ => {}
            }
        }

        if fields.channel_uri.is_empty() {
            return Err(DispatchError::MalformedEvent(
                "recovered record missing event channel header".into(),
            ));
        }

        Ok(fields)
    }
}

/// Outcome of attempting a delivery. Kept distinct from [`DispatchError`]
/// because a failed delivery (non-2xx/304, or a transport error) is never
/// surfaced to the publisher — it only feeds failure bookkeeping or queue
/// retry (§7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// HTTP 2xx or 304.
    Success,
    /// Any other status, or a transport-level failure.
    Failure,
}

/// Performs the actual HTTP POST to a subscriber.
#[async_trait::async_trait]
pub trait Delivery: Send + Sync {
    /// POST `item` to its destination, attaching cookies from `cookies` for
    /// `item.location`.
    async fn deliver(&self, item: &DispatchItem, cookies: &CookieJar) -> DeliveryOutcome;
}

/// `reqwest`-backed [`Delivery`], grounded on `transport::reqwest::TransportReqwest`.
#[derive(Clone, Debug)]
pub struct ReqwestDelivery {
    client: reqwest::Client,
}

impl ReqwestDelivery {
    /// Build a delivery client with the given per-request timeout. A zero
    /// timeout means "unlimited", matching §5's "timeout governed by the
    /// client, may be unlimited".
    pub fn new(timeout: Duration) -> Self {
        let mut builder = reqwest::Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        Self {
            client: builder
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for ReqwestDelivery {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait::async_trait]
impl Delivery for ReqwestDelivery {
    async fn deliver(&self, item: &DispatchItem, cookies: &CookieJar) -> DeliveryOutcome {
        let mut request = self
            .client
            .post(&item.destination_uri)
            .header(reqwest::header::CONTENT_TYPE, item.event.payload().content_type.clone())
            .body(item.event.payload().body.clone());

        for (name, value) in headers::event_headers(&item.event) {
            request = request.header(name, value);
        }

        let mut jar_cookies = cookies.cookies_for(&item.location);
        if item.event.is_combined_set_update() {
            if let Some(service_cookie) = cookies.service_cookie() {
                jar_cookies.push(service_cookie);
            }
        }
        if !jar_cookies.is_empty() {
            request = request.header(reqwest::header::COOKIE, jar_cookies.join("; "));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.as_u16() == 304 {
                    DeliveryOutcome::Success
                } else {
                    log::warn!(
                        "delivery to {} for location {} failed with status {status}",
                        item.destination_uri,
                        item.location
                    );
                    DeliveryOutcome::Failure
                }
            }
            Err(error) => {
                log::warn!(
                    "delivery to {} for location {} failed: {error}",
                    item.destination_uri,
                    item.location
                );
                DeliveryOutcome::Failure
            }
        }
    }
}
