//! End-to-end tests against a bound server.
//!
//! Each test spins up the full router on an ephemeral port. Push
//! delivery either goes to a wiremock double of the browser push
//! service (exercising real RFC 8291 encryption + VAPID signing) or to
//! an in-process recording gateway when the test needs to see the
//! cleartext payload.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use base64::Engine;
use rand::RngCore;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pane_push::server::{router, AppState};
use pane_push::store::Subscription;
use pane_push::{
    Config, DeliveryOutcome, Dispatcher, PushGateway, Store, Tmux, VapidKeys, WebPush,
};

const API_KEY: &str = "test-api-key";

struct TestServer {
    base: String,
    client: reqwest::Client,
    store: Arc<Store>,
    vapid_public: String,
    _data_dir: TempDir,
}

impl TestServer {
    fn url(&self, p: &str) -> String {
        format!("{}{p}", self.base)
    }
}

async fn spawn_with_gateway(gateway: Arc<dyn PushGateway>, vapid_public: String) -> TestServer {
    let data_dir = TempDir::new().expect("temp dir");
    let store = Arc::new(Store::open(data_dir.path()).expect("open store"));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), gateway));

    let config = Config {
        api_key: API_KEY.to_string(),
        ..Default::default()
    };
    let state = AppState {
        config: Arc::new(config),
        store: Arc::clone(&store),
        dispatcher,
        tmux: Arc::new(Tmux::new()),
        vapid_public_key: vapid_public.clone(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        store,
        vapid_public,
        _data_dir: data_dir,
    }
}

/// Server wired to the production web-push gateway.
async fn spawn_webpush_server() -> TestServer {
    let vapid = VapidKeys::generate();
    let gateway = Arc::new(WebPush::new(
        reqwest::Client::new(),
        vapid.private_key_base64url().to_string(),
        "mailto:test@example.com".to_string(),
    ));
    spawn_with_gateway(gateway, vapid.public_key_base64url().to_string()).await
}

/// Gateway double that accepts everything and keeps the cleartext payloads.
#[derive(Default)]
struct RecordingGateway {
    payloads: Mutex<Vec<Value>>,
}

#[async_trait]
impl PushGateway for RecordingGateway {
    async fn deliver(&self, _subscription: &Subscription, payload: &[u8]) -> DeliveryOutcome {
        let parsed: Value = serde_json::from_slice(payload).expect("payload is JSON");
        self.payloads.lock().unwrap().push(parsed);
        DeliveryOutcome::Delivered
    }
}

/// A realistic browser subscription: fresh P-256 key for `p256dh`,
/// random 16-byte auth secret.
fn browser_subscription(endpoint: &str) -> Value {
    use p256::ecdsa::SigningKey;
    use p256::elliptic_curve::rand_core::OsRng;

    let browser_key = SigningKey::random(&mut OsRng);
    let p256dh = BASE64URL.encode(
        browser_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes(),
    );
    let mut auth = [0u8; 16];
    rand::rng().fill_bytes(&mut auth);

    json!({
        "endpoint": endpoint,
        "expirationTime": null,
        "keys": { "p256dh": p256dh, "auth": BASE64URL.encode(auth) },
    })
}

async fn post_json(server: &TestServer, p: &str, body: Value) -> reqwest::Response {
    server
        .client
        .post(server.url(p))
        .json(&body)
        .send()
        .await
        .expect("request")
}

async fn notify(server: &TestServer, body: Value) -> reqwest::Response {
    server
        .client
        .post(server.url("/api/notify"))
        .header("x-api-key", API_KEY)
        .json(&body)
        .send()
        .await
        .expect("request")
}

#[tokio::test]
async fn test_subscribe_notify_delivers_encrypted_push() {
    let push_service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push/1"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&push_service)
        .await;

    let server = spawn_webpush_server().await;
    let endpoint = format!("{}/push/1", push_service.uri());

    let resp = post_json(&server, "/api/subscribe", browser_subscription(&endpoint)).await;
    assert_eq!(resp.status(), 200);

    let resp = notify(
        &server,
        json!({
            "title": "Permission needed",
            "message": "Run tests?",
            "event_type": "Notification",
            "tmux_pane": "%3",
            "session_id": "abc",
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["sent_to"], 1);
    let id = body["notification_id"].as_str().unwrap();
    assert_eq!(id.len(), 12);

    // The push service saw one signed, encrypted request.
    let requests = push_service.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(
        req.headers.get("content-encoding").unwrap().to_str().unwrap(),
        "aes128gcm"
    );
    assert!(req.headers.contains_key("ttl"));
    let auth_header = req.headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth_header.starts_with("vapid"), "VAPID-signed: {auth_header}");
    assert!(!req.body.is_empty(), "payload is encrypted, not empty");

    // History records it, newest first.
    let resp = server
        .client
        .get(server.url("/api/notifications"))
        .send()
        .await
        .unwrap();
    let history: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(history[0]["id"].as_str().unwrap(), id);
    assert!(history[0].get("responded").is_none());
}

#[tokio::test]
async fn test_notify_payload_marks_actionable() {
    let gateway = Arc::new(RecordingGateway::default());
    let server = spawn_with_gateway(gateway.clone(), "test-key".to_string()).await;

    post_json(
        &server,
        "/api/subscribe",
        browser_subscription("https://push.example.com/e1"),
    )
    .await;

    let resp = notify(
        &server,
        json!({
            "title": "t",
            "message": "m",
            "event_type": "Notification",
            "tmux_pane": "%3",
        }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    let id = body["notification_id"].as_str().unwrap();

    let payloads = gateway.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["data"]["actionable"], true);
    assert_eq!(payloads[0]["data"]["notification_id"], id);
    assert_eq!(payloads[0]["data"]["event_type"], "Notification");
}

#[tokio::test]
async fn test_notify_without_pane_is_not_actionable() {
    let gateway = Arc::new(RecordingGateway::default());
    let server = spawn_with_gateway(gateway.clone(), "test-key".to_string()).await;

    post_json(
        &server,
        "/api/subscribe",
        browser_subscription("https://push.example.com/e1"),
    )
    .await;
    notify(&server, json!({ "message": "m", "event_type": "Notification" })).await;

    let payloads = gateway.payloads.lock().unwrap();
    assert_eq!(payloads[0]["data"]["actionable"], false);
}

#[tokio::test]
async fn test_notify_rejects_bad_api_key() {
    let server = spawn_webpush_server().await;

    let resp = post_json(&server, "/api/notify", json!({ "message": "m" })).await;
    assert_eq!(resp.status(), 403, "missing key");

    let resp = server
        .client
        .post(server.url("/api/notify"))
        .header("x-api-key", "wrong")
        .json(&json!({ "message": "m" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Invalid API key");
}

#[tokio::test]
async fn test_gone_endpoint_is_pruned() {
    let push_service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&push_service)
        .await;
    Mock::given(method("POST"))
        .and(path("/push/ok"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&push_service)
        .await;

    let server = spawn_webpush_server().await;
    let gone = format!("{}/push/gone", push_service.uri());
    let ok = format!("{}/push/ok", push_service.uri());
    post_json(&server, "/api/subscribe", browser_subscription(&gone)).await;
    post_json(&server, "/api/subscribe", browser_subscription(&ok)).await;

    let resp = notify(&server, json!({ "message": "first" })).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sent_to"], 1, "gone endpoint not counted");

    // Exactly the gone endpoint was pruned.
    let remaining: Vec<String> = server
        .store
        .subscriptions()
        .unwrap()
        .into_iter()
        .map(|s| s.endpoint)
        .collect();
    assert_eq!(remaining, vec![ok.clone()]);

    // A second notify only reaches the surviving endpoint.
    notify(&server, json!({ "message": "second" })).await;
    let requests = push_service.received_requests().await.unwrap();
    let gone_hits = requests.iter().filter(|r| r.url.path() == "/push/gone").count();
    let ok_hits = requests.iter().filter(|r| r.url.path() == "/push/ok").count();
    assert_eq!(gone_hits, 1);
    assert_eq!(ok_hits, 2);
}

#[tokio::test]
async fn test_transient_failure_keeps_subscription() {
    let push_service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&push_service)
        .await;

    let server = spawn_webpush_server().await;
    let endpoint = format!("{}/push/flaky", push_service.uri());
    post_json(&server, "/api/subscribe", browser_subscription(&endpoint)).await;

    let resp = notify(&server, json!({ "message": "m" })).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sent_to"], 0);
    assert_eq!(server.store.subscriptions().unwrap().len(), 1, "5xx is not pruned");
}

#[tokio::test]
async fn test_subscribe_requires_endpoint() {
    let server = spawn_webpush_server().await;
    let resp = post_json(&server, "/api/subscribe", json!({ "keys": {} })).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Missing endpoint");
}

#[tokio::test]
async fn test_unsubscribe_reports_removed() {
    let server = spawn_webpush_server().await;
    post_json(
        &server,
        "/api/subscribe",
        browser_subscription("https://push.example.com/e1"),
    )
    .await;

    let resp = post_json(
        &server,
        "/api/unsubscribe",
        json!({ "endpoint": "https://push.example.com/e1" }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], true);

    let resp = post_json(
        &server,
        "/api/unsubscribe",
        json!({ "endpoint": "https://push.example.com/e1" }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], false);
}

#[tokio::test]
async fn test_respond_error_statuses() {
    let server = spawn_webpush_server().await;

    // Unknown id
    let resp = post_json(
        &server,
        "/api/respond",
        json!({ "notification_id": "missing", "action": "approve" }),
    )
    .await;
    assert_eq!(resp.status(), 404);

    // Invalid action (checked before lookup)
    let resp = post_json(
        &server,
        "/api/respond",
        json!({ "notification_id": "missing", "action": "shrug" }),
    )
    .await;
    assert_eq!(resp.status(), 400);

    // Notification whose pane handle is malformed
    let resp = notify(
        &server,
        json!({ "message": "m", "event_type": "Notification", "tmux_pane": "bad" }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    let id = body["notification_id"].as_str().unwrap().to_string();

    let resp = post_json(
        &server,
        "/api/respond",
        json!({ "notification_id": id, "action": "approve" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no valid tmux pane for this notification");

    // Store unmutated by the failed respond.
    let n = server.store.get_notification(&id).unwrap().unwrap();
    assert!(n.responded.is_none());

    // Missing text is rejected before any tmux invocation.
    let resp = notify(
        &server,
        json!({ "message": "m", "event_type": "Notification", "tmux_pane": "%1" }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    let id = body["notification_id"].as_str().unwrap().to_string();

    let resp = post_json(
        &server,
        "/api/respond",
        json!({ "notification_id": id, "action": "text", "text": "" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let n = server.store.get_notification(&id).unwrap().unwrap();
    assert!(n.responded.is_none());
}

#[tokio::test]
async fn test_test_notify_needs_no_auth() {
    let server = spawn_webpush_server().await;
    let resp = post_json(&server, "/api/test-notify", json!({})).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["sent_to"], 0);

    let history: Vec<Value> = server
        .client
        .get(server.url("/api/notifications"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history[0]["event_type"], "test");
}

#[tokio::test]
async fn test_list_notifications_limit() {
    let server = spawn_webpush_server().await;
    for i in 0..3 {
        notify(&server, json!({ "message": format!("m{i}") })).await;
    }

    let history: Vec<Value> = server
        .client
        .get(server.url("/api/notifications?limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["message"], "m2", "newest first");
}

#[tokio::test]
async fn test_vapid_public_key_served() {
    let server = spawn_webpush_server().await;
    let body: Value = server
        .client
        .get(server.url("/api/vapid-public-key"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["publicKey"].as_str().unwrap(), server.vapid_public);
}

#[tokio::test]
async fn test_health() {
    let server = spawn_webpush_server().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_kill_session_validates_name() {
    let server = spawn_webpush_server().await;
    let resp = post_json(&server, "/api/sessions/kill", json!({ "name": "bad name;rm" })).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Invalid session name");
}

#[tokio::test]
async fn test_create_session_enforces_allow_list() {
    let server = spawn_webpush_server().await;

    let resp = post_json(&server, "/api/sessions", json!({})).await;
    assert_eq!(resp.status(), 400, "missing path");

    // No directories configured, so every path is off-list.
    let resp = post_json(&server, "/api/sessions", json!({ "path": "/tmp" })).await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Path not in configured directories");
}
