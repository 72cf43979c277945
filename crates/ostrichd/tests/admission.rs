mod common;

use async_trait::async_trait;
use common::*;
use ostrich_common::crypto::{public_key_hex, unix_now};
use ostrich_common::Event;
use ostrichd::admission::ConnMeta;
use ostrichd::config::VerificationMode;
use ostrichd::error::ServiceError;
use ostrichd::external::{AdmissionService, HttpAdmissionService, Verdict};
use ostrichd::server::Collaborators;
use ostrichd::storage::MemoryStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn future_timestamp_is_invalid() {
    let mut config = test_config();
    config.policy.reject_future_seconds = 0;
    let (relay, store) = start_relay(config).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let event = note_at(&keys(1), unix_now() + 3600, 1, "from the future");
    client.publish(&event).await;

    let (accepted, message) = client.expect_ok(&event.id).await;
    assert!(!accepted);
    assert!(message.starts_with("invalid:"), "got {message}");
    assert!(store.is_empty());
}

#[tokio::test]
async fn expired_event_is_invalid() {
    let (relay, _store) = start_relay(test_config()).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let expired = (unix_now() - 60).to_string();
    let event = ostrich_common::crypto::sign_event(
        &keys(2),
        unix_now() - 120,
        1,
        vec![vec!["expiration".into(), expired]],
        "gone",
    );
    client.publish(&event).await;
    let (accepted, message) = client.expect_ok(&event.id).await;
    assert!(!accepted);
    assert!(message.starts_with("invalid:"));
}

#[tokio::test]
async fn oversized_event_is_invalid() {
    let mut config = test_config();
    config.policy.max_event_bytes = 512;
    let (relay, _store) = start_relay(config).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let event = note(&keys(3), 1, &"x".repeat(1024));
    client.publish(&event).await;
    let (accepted, message) = client.expect_ok(&event.id).await;
    assert!(!accepted);
    assert!(message.starts_with("invalid:"), "got {message}");
}

#[tokio::test]
async fn denied_kind_is_blocked() {
    let mut config = test_config();
    config.policy.kind_denylist = [1984].into_iter().collect();
    let (relay, _store) = start_relay(config).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let report = note(&keys(4), 1984, "report");
    client.publish(&report).await;
    let (accepted, message) = client.expect_ok(&report.id).await;
    assert!(!accepted);
    assert!(message.starts_with("blocked:"), "got {message}");

    let text = note(&keys(4), 1, "fine");
    client.publish(&text).await;
    assert!(client.expect_ok(&text.id).await.0);
}

#[tokio::test]
async fn author_outside_whitelist_is_blocked() {
    let allowed = keys(5);
    let mut config = test_config();
    config.policy.pubkey_whitelist = Some([public_key_hex(&allowed)].into_iter().collect());
    let (relay, _store) = start_relay(config).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let stranger = note(&keys(6), 1, "let me in");
    client.publish(&stranger).await;
    let (accepted, message) = client.expect_ok(&stranger.id).await;
    assert!(!accepted);
    assert!(message.starts_with("blocked:"));

    let member = note(&allowed, 1, "hi");
    client.publish(&member).await;
    assert!(client.expect_ok(&member.id).await.0);
}

#[tokio::test]
async fn event_rate_limit_applies() {
    let mut config = test_config();
    config.policy.messages_per_sec = 1;
    let (relay, _store) = start_relay(config).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let keys = keys(7);
    let first = note_at(&keys, unix_now() - 2, 1, "first");
    let second = note_at(&keys, unix_now() - 1, 1, "second");
    client.publish(&first).await;
    client.publish(&second).await;

    assert!(client.expect_ok(&first.id).await.0);
    let (accepted, message) = client.expect_ok(&second.id).await;
    assert!(!accepted);
    assert!(message.starts_with("rate-limited:"), "got {message}");
}

#[tokio::test]
async fn enforcing_identity_restricts_unverified_authors() {
    let mut config = test_config();
    config.policy.identity.mode = VerificationMode::Enforcing;
    let (relay, _store) = start_relay(config).await;
    let mut client = TestClient::connect(&relay.addr).await;

    let keys = keys(8);
    let text = note(&keys, 1, "unverified");
    client.publish(&text).await;
    let (accepted, message) = client.expect_ok(&text.id).await;
    assert!(!accepted);
    assert!(message.starts_with("restricted:"), "got {message}");

    // metadata stays open so the claim itself can be published
    let metadata = note(&keys, 0, r#"{"nip05":"bob@example.com"}"#);
    client.publish(&metadata).await;
    assert!(client.expect_ok(&metadata.id).await.0);
}

struct Denylist {
    calls: AtomicUsize,
}

#[async_trait]
impl AdmissionService for Denylist {
    async fn check(&self, event: &Event, meta: &ConnMeta) -> Result<Verdict, ServiceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        assert!(meta.ip.is_loopback());
        Ok(Verdict {
            permit: !event.content.contains("spam"),
            message: Some("looks like spam".into()),
        })
    }
}

#[tokio::test]
async fn admission_service_can_deny() {
    let service = Arc::new(Denylist {
        calls: AtomicUsize::new(0),
    });
    let relay = start_relay_with(
        test_config(),
        Arc::new(MemoryStore::new()),
        Collaborators {
            admission_service: Some(service.clone()),
            ..Collaborators::default()
        },
    )
    .await;
    let mut client = TestClient::connect(&relay.addr).await;

    let spam = note(&keys(10), 1, "buy spam now");
    client.publish(&spam).await;
    let (accepted, message) = client.expect_ok(&spam.id).await;
    assert!(!accepted);
    assert_eq!(message, "blocked: looks like spam");

    let ham = note(&keys(10), 1, "good morning");
    client.publish(&ham).await;
    assert!(client.expect_ok(&ham.id).await.0);
    assert_eq!(service.calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn unreachable_admission_service_fails_open() {
    // reserve a port, then free it so nothing is listening there
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let service = HttpAdmissionService::new(
        &format!("http://127.0.0.1:{port}/check"),
        Duration::from_millis(500),
    )
    .unwrap();

    let mut config = test_config();
    config.admission_timeout_ms = 500;
    let store = Arc::new(MemoryStore::new());
    let relay = start_relay_with(
        config,
        store.clone(),
        Collaborators {
            admission_service: Some(Arc::new(service)),
            ..Collaborators::default()
        },
    )
    .await;
    let mut client = TestClient::connect(&relay.addr).await;

    let event = note(&keys(11), 1, "service is down");
    client.publish(&event).await;
    assert_eq!(client.expect_ok(&event.id).await, (true, String::new()));
    assert_eq!(store.len(), 1);
}
