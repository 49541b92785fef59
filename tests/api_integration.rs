//! REST surface exercised through the full router.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tower::ServiceExt;

use chat_delivery_service::auth::{sign_token, Claims, JwtIdentityResolver, JwtValidator};
use chat_delivery_service::broker::MemoryBroker;
use chat_delivery_service::chat::{Channel, ChannelKind, User};
use chat_delivery_service::config::{ApiConfig, JwtConfig, Settings};
use chat_delivery_service::connection_manager::{Outbound, Session};
use chat_delivery_service::presence::MemoryPresenceStore;
use chat_delivery_service::server::{create_app, AppState};
use chat_delivery_service::store::{ChatStore, MemoryChatStore};
use chat_delivery_service::websocket::EventKind;

const API_KEY: &str = "test-api-key";

fn settings() -> Settings {
    Settings {
        server: Default::default(),
        jwt: JwtConfig {
            secret: "api-test-secret".to_string(),
            issuer: None,
            audience: None,
        },
        redis: Default::default(),
        database: Default::default(),
        broker: Default::default(),
        presence: Default::default(),
        websocket: Default::default(),
        api: ApiConfig {
            key: Some(API_KEY.to_string()),
        },
        otel: Default::default(),
    }
}

struct Harness {
    state: AppState,
    store: Arc<MemoryChatStore>,
    alice: User,
    bob: User,
    carol: User,
    channel: Channel,
}

impl Harness {
    fn new() -> Self {
        let settings = settings();
        let store = Arc::new(MemoryChatStore::new());
        let alice = store.add_user("alice");
        let bob = store.add_user("bob");
        let carol = store.add_user("carol");
        let channel = store.add_channel("general", ChannelKind::Group, &[alice.id, bob.id]);

        let chat_store: Arc<dyn ChatStore> = store.clone();
        let identity = Arc::new(JwtIdentityResolver::new(
            JwtValidator::new(&settings.jwt),
            Arc::clone(&chat_store),
        ));
        let state = AppState::from_parts(
            settings,
            chat_store,
            Arc::new(MemoryBroker::new()),
            Arc::new(MemoryPresenceStore::new("api-test")),
            identity,
        );

        Self {
            state,
            store,
            alice,
            bob,
            carol,
            channel,
        }
    }

    fn app(&self) -> Router {
        create_app(self.state.clone())
    }

    fn token(&self, user: &User) -> String {
        sign_token(&self.state.settings.jwt, &Claims::new(user.username.clone(), 600)).unwrap()
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_backends() {
    let h = Harness::new();
    let response = assert_ok!(h.app().oneshot(get("/health")).await);
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backends"]["store"], "memory");
    assert_eq!(body["backends"]["broker"], "memory");
    assert_eq!(body["backends"]["presence"], "memory");
    assert_eq!(body["connections"]["total"], 0);
}

#[tokio::test]
async fn test_online_users_lists_connected_users() {
    let h = Harness::new();
    let (session, _rx) = Session::new(h.alice.id, h.channel.id, 8);
    h.state.connection_manager.connect(session).await.unwrap();

    let response = h.app().oneshot(get("/online-users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([h.alice.id]));

    let stats = body_json(h.app().oneshot(get("/stats")).await.unwrap()).await;
    assert_eq!(stats["connections"]["total_sessions"], 1);
    assert_eq!(stats["online_users"], 1);
}

#[tokio::test]
async fn test_history_requires_membership() {
    let h = Harness::new();
    let uri = format!("/api/v1/channels/{}/messages", h.channel.id);

    let response = h.app().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .app()
        .oneshot(authed("GET", &uri, &h.token(&h.carol)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_history_is_newest_first() {
    let h = Harness::new();
    for content in ["one", "two", "three"] {
        h.store
            .create_message(h.channel.id, h.bob.id, content)
            .await
            .unwrap();
    }

    let uri = format!("/api/v1/channels/{}/messages?limit=2", h.channel.id);
    let response = h
        .app()
        .oneshot(authed("GET", &uri, &h.token(&h.alice)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let contents: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["three", "two"]);

    let bad = format!("/api/v1/channels/{}/messages?limit=0", h.channel.id);
    let response = h
        .app()
        .oneshot(authed("GET", &bad, &h.token(&h.alice)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mark_read_updates_and_announces() {
    let h = Harness::new();
    h.store
        .create_message(h.channel.id, h.bob.id, "from bob")
        .await
        .unwrap();
    h.store
        .create_message(h.channel.id, h.alice.id, "from alice")
        .await
        .unwrap();

    let (bob_session, mut bob_rx) = Session::new(h.bob.id, h.channel.id, 8);
    h.state.connection_manager.connect(bob_session).await.unwrap();

    let uri = format!("/api/v1/channels/{}/read", h.channel.id);
    let response = h
        .app()
        .oneshot(authed("POST", &uri, &h.token(&h.alice)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let updated = body_json(response).await;
    assert_eq!(updated.as_array().unwrap().len(), 1);
    assert_eq!(updated[0]["content"], "from bob");
    assert_eq!(updated[0]["status"], "read");

    let mut receipt = None;
    while receipt.is_none() {
        match tokio::time::timeout(Duration::from_secs(2), bob_rx.recv()).await {
            Ok(Some(Outbound::Event(event))) if event.kind == EventKind::Notification => {
                receipt = Some(event)
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("session queue closed"),
            Err(_) => panic!("no read receipt received"),
        }
    }
    let receipt = receipt.unwrap();
    assert_eq!(receipt.data["type"], "read_receipt");
    assert_eq!(receipt.data["reader_id"], h.alice.id);
}

#[tokio::test]
async fn test_notify_requires_api_key() {
    let h = Harness::new();
    let uri = format!("/api/v1/channels/{}/notify", h.channel.id);
    let payload = json!({ "data": "maintenance at 5" }).to_string();

    let request = Request::builder()
        .method("POST")
        .uri(&uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.clone()))
        .unwrap();
    let response = h.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri(&uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-API-Key", API_KEY)
        .body(Body::from(payload.clone()))
        .unwrap();
    let response = h.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "broker");

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/channels/999/notify")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-API-Key", API_KEY)
        .body(Body::from(payload))
        .unwrap();
    let response = h.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let h = Harness::new();
    let response = assert_ok!(h.app().oneshot(get("/metrics")).await);
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("chat_sessions_active"));
}
