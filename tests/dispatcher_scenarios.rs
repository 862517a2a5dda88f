//! End-to-end scenarios against the public [`Dispatcher`] facade, driving
//! real HTTP deliveries through `wiremock` rather than the fake [`Delivery`]
//! used by the unit tests in `src/dispatch.rs`. These mirror the numbered
//! scenarios in the component design's "testable properties" section.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_core::event::{DispatcherEvent, EventFields, Payload};
use dispatch_core::runtime::TokioRuntime;
use dispatch_core::transport::{Delivery, DeliveryOutcome};
use dispatch_core::{Dispatcher, DispatchError, DispatcherConfig};

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("dispatch_core=trace");
    let _ = env_logger::Builder::from_env(env).is_test(true).try_init();
}

fn event(channel: &str, recipients: &[&str]) -> DispatcherEvent {
    DispatcherEvent::normalise(EventFields {
        channel_uri: channel.into(),
        origins: vec!["http://pub/".into()],
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        payload: Payload::new("application/json", b"{}".to_vec()),
        ..Default::default()
    })
    .unwrap()
}

fn doc(owner: &str, destination: &str, channel: &str, recipients: &[&str], max_failures: u32) -> String {
    let recipients_json: Vec<String> = recipients.iter().map(|r| format!("\"{r}\"")).collect();
    format!(
        r#"{{
            "owner_uri": "{owner}",
            "location": "",
            "max_failures": {max_failures},
            "has_expiration": false,
            "subscriptions": [
                {{
                    "id": "",
                    "channels": ["{channel}"],
                    "destination_uri": "{destination}",
                    "recipients": [{}]
                }}
            ]
        }}"#,
        recipients_json.join(",")
    )
}

fn build_dispatcher() -> Arc<Dispatcher> {
    let config = DispatcherConfig {
        service_owner_uri: "http://dispatcher/".into(),
        ..Default::default()
    };
    Arc::new(Dispatcher::build(config).unwrap())
}

/// Scenario 1: a broadcast on a wildcard channel reaches the one matching
/// subscriber and leaves its failure count untouched.
#[tokio::test]
async fn channel_broadcast_reaches_single_matching_subscriber() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = build_dispatcher();
    dispatcher
        .register("L1", &doc("http://a/", &server.uri(), "event://*/foo", &["user:alice"], 5), "key")
        .unwrap();

    dispatcher.dispatch(event("event://x/foo", &[])).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert!(dispatcher.get("L1").is_some());
}

/// Scenario 3: an event that already carries this dispatcher's owner in
/// `via` is rejected synchronously and never reaches a subscriber.
#[tokio::test]
async fn loop_prevention_rejects_event_synchronously() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = build_dispatcher();
    dispatcher
        .register("L1", &doc("http://a/", &server.uri(), "event://*/foo", &["user:alice"], 5), "key")
        .unwrap();

    let looping = DispatcherEvent::normalise(EventFields {
        channel_uri: "event://x/foo".into(),
        origins: vec!["http://pub/".into()],
        via: vec!["http://dispatcher/".into()],
        payload: Payload::new("application/json", b"{}".to_vec()),
        ..Default::default()
    })
    .unwrap();

    let err = dispatcher.dispatch(looping).unwrap_err();
    assert!(matches!(err, DispatchError::LoopDetected { .. }));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(server.received_requests().await.unwrap().is_empty());
}

/// Scenario 4: a non-expiring set whose endpoint always returns 500 is
/// evicted once consecutive failures exceed `max_failures`, and no further
/// deliveries are attempted afterward.
#[tokio::test]
async fn eviction_stops_delivery_after_max_failures() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dispatcher = build_dispatcher();
    dispatcher
        .register("L1", &doc("http://a/", &server.uri(), "event://*/foo", &["user:alice"], 2), "key")
        .unwrap();

    for _ in 0..3 {
        dispatcher.dispatch(event("event://x/foo", &[])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(dispatcher.get("L1").is_none());

    let requests_after_eviction = server.received_requests().await.unwrap().len();
    dispatcher.dispatch(event("event://x/foo", &[])).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), requests_after_eviction);
}

/// Scenario 6: registering a set fires the combined-set-updated observer
/// exactly once, and the observed document's version matches
/// `Dispatcher::combined_set`.
#[tokio::test]
async fn combined_set_broadcast_fires_observer_with_matching_version() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = build_dispatcher();
    let observed_version = Arc::new(AtomicU64::new(0));
    let observed_calls = Arc::new(AtomicU64::new(0));
    let version_clone = observed_version.clone();
    let calls_clone = observed_calls.clone();
    dispatcher.on_combined_set_updated(Arc::new(move |combined_set| {
        version_clone.store(combined_set.version, Ordering::SeqCst);
        calls_clone.fetch_add(1, Ordering::SeqCst);
    }));

    dispatcher
        .register("L1", &doc("http://a/", &server.uri(), "event://*/foo", &["user:alice"], 5), "key")
        .unwrap();

    assert_eq!(observed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(observed_version.load(Ordering::SeqCst), dispatcher.combined_set().version);
}

/// Scenario 2: a recipient-targeted event reaches only the subscriber whose
/// subscription targets that recipient, carrying just that recipient.
#[tokio::test]
async fn targeted_event_reaches_only_the_matching_recipients_subscriber() {
    init_logging();
    let alice_server = MockServer::start().await;
    let bob_server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&alice_server).await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&bob_server).await;

    let dispatcher = build_dispatcher();
    dispatcher
        .register("L1", &doc("http://a/", &alice_server.uri(), "event://*/*", &["user:alice"], 5), "key")
        .unwrap();
    dispatcher
        .register("L2", &doc("http://b/", &bob_server.uri(), "event://*/*", &["user:bob"], 5), "key")
        .unwrap();

    dispatcher.dispatch(event("event://x/foo", &["user:alice"])).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice_server.received_requests().await.unwrap().len(), 1);
    assert!(bob_server.received_requests().await.unwrap().is_empty());
}

fn durable_doc(owner: &str, channel: &str, recipients: &[&str]) -> String {
    let recipients_json: Vec<String> = recipients.iter().map(|r| format!("\"{r}\"")).collect();
    format!(
        r#"{{
            "owner_uri": "{owner}",
            "location": "",
            "has_expiration": true,
            "subscriptions": [
                {{
                    "id": "",
                    "channels": ["{channel}"],
                    "destination_uri": "http://sub1/",
                    "recipients": [{}]
                }}
            ]
        }}"#,
        recipients_json.join(",")
    )
}

/// A fake [`Delivery`] standing in for the subscriber's HTTP endpoint: fails
/// every attempt while `online` is false, succeeds (and records the event id)
/// once it flips to true. Standing in for "the endpoint comes back up" in
/// scenario 5, without spinning up a real server whose availability we'd have
/// to toggle out from under `wiremock`.
struct ToggleableDelivery {
    online: Arc<std::sync::atomic::AtomicBool>,
    calls: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Delivery for ToggleableDelivery {
    async fn deliver(
        &self,
        item: &dispatch_core::queue::DispatchItem,
        _cookies: &dispatch_core::cookie::CookieJar,
    ) -> DeliveryOutcome {
        if self.online.load(Ordering::SeqCst) {
            self.calls.lock().unwrap().push(item.event.id().to_string());
            DeliveryOutcome::Success
        } else {
            DeliveryOutcome::Failure
        }
    }
}

/// Scenario 5: an expiring set's durable queue retains an undelivered event
/// across a restart and redelivers it exactly once when the endpoint comes
/// back up. `retry_interval` is set far longer than the test's lifetime so
/// the pre-restart instance's single backoff timer never fires again and
/// can't race the post-restart delivery.
#[tokio::test]
async fn durable_queue_redelivers_exactly_once_after_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let online = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

    let config = DispatcherConfig {
        service_owner_uri: "http://dispatcher/".into(),
        retry_interval: Duration::from_secs(10),
        queue_root_path: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let delivery: Arc<dyn Delivery> =
        Arc::new(ToggleableDelivery { online: online.clone(), calls: calls.clone() });

    let dispatched_event_id = {
        let dispatcher = Dispatcher::build_with(config.clone(), TokioRuntime, delivery.clone()).unwrap();
        dispatcher
            .register("L1", &durable_doc("http://a/", "event://*/foo", &["user:alice"]), "key")
            .unwrap();
        let e1 = event("event://x/foo", &[]);
        let id = e1.id().to_string();
        dispatcher.dispatch(e1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.lock().unwrap().is_empty(), "endpoint is offline, nothing should have succeeded");
        id
    };

    online.store(true, Ordering::SeqCst);

    let dispatcher = Dispatcher::build_with(config, TokioRuntime, delivery).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(*calls.lock().unwrap(), vec![dispatched_event_id]);
    let _ = dispatcher;
}
