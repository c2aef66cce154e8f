//! API endpoint integration tests

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use beacon_channels::EchoAgent;
use beacon_channels::api::{ApiServer, ApiState};
use beacon_channels::channels::AdapterState;
use beacon_channels::dispatch::{DispatchConfig, Dispatcher};
use beacon_channels::lifecycle::ChannelOverrides;
use beacon_channels::plugins::{AdapterRegistry, LoaderOptions, MASKED_VALUE, PluginLoader};
use beacon_channels::security::{DmPolicy, PairingConfig, PairingManager};
use beacon_channels::threads::ThreadBindingStore;
use secrecy::SecretString;
use tempfile::TempDir;
use tower::ServiceExt;

mod common;
use common::write_manifest;

const ADMIN_KEY: &str = "admin-key";

struct Fixture {
    _dir: TempDir,
    router: Router,
    loader: Arc<PluginLoader>,
    pairing: Arc<PairingManager>,
}

/// A running webhook channel `hook` behind the full router
async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_manifest(
        &plugins,
        "hook",
        &serde_json::json!({
            "id": "hook",
            "name": "Test webhook",
            "enabled": true,
            "adapter": "webhook",
            "config": {
                "channel_id": "hook",
                "auth_token": {"default": "secret", "sensitive": true},
                "verify_token": {"default": "verify-me", "sensitive": true},
                "response_timeout_secs": 5
            }
        }),
    );

    let loader = Arc::new(PluginLoader::with_env(
        LoaderOptions::new(vec![plugins], dir.path().join("plugins_state.json")),
        AdapterRegistry::with_builtins(),
        Arc::new(|_: &str| None),
    ));
    assert_eq!(loader.discover(), vec!["hook".to_string()]);

    let pairing = Arc::new(PairingManager::new(PairingConfig {
        policy: DmPolicy::Pairing,
        owner_id: Some("owner".to_string()),
        ..PairingConfig::new(dir.path().join("dm_allowlist.json"))
    }));
    let bindings = Arc::new(ThreadBindingStore::new(24.0));

    let dispatcher = Dispatcher::new(
        Arc::clone(&pairing),
        Arc::clone(&bindings),
        Arc::new(ChannelOverrides::new()),
        Arc::new(EchoAgent),
        DispatchConfig::default(),
    )
    .with_channels(&loader);
    assert_eq!(loader.start_all(Arc::new(dispatcher)), 1);

    for _ in 0..100 {
        let running = loader
            .channel_states()
            .iter()
            .any(|(id, state)| id == "hook" && *state == AdapterState::Running);
        if running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let router = ApiServer::new(
        ApiState {
            loader: Arc::clone(&loader),
            pairing: Arc::clone(&pairing),
            bindings,
            api_key: Some(SecretString::from(ADMIN_KEY)),
            webhook_limiter: None,
            approval_wait: Duration::from_secs(30),
        },
        0,
    )
    .router();

    Fixture {
        _dir: dir,
        router,
        loader,
        pairing,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

fn post_json(uri: &str, auth: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = auth {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = auth {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let f = fixture().await;

    let (status, body) = send(&f.router, get("/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["channels"][0]["id"], "hook");
    assert_eq!(body["channels"][0]["state"], "running");
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_webhook_requires_bearer() {
    let f = fixture().await;
    let payload = serde_json::json!({"sender_id": "u1", "message": "ping"});

    let (status, _) = send(&f.router, post_json("/webhook/hook", None, &payload)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&f.router, post_json("/webhook/hook", Some("wrong"), &payload)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_webhook_round_trip_through_dispatcher() {
    let f = fixture().await;
    let payload = serde_json::json!({"sender_id": "u1", "sender_name": "Alice", "message": "ping"});

    let (status, body) = send(&f.router, post_json("/webhook/hook", Some("secret"), &payload)).await;

    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["ok"], true);
    assert_eq!(body["response"]["content"], "ping");
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_webhook_rejects_empty_message() {
    let f = fixture().await;
    let payload = serde_json::json!({"sender_id": "u1", "message": "  "});

    let (status, body) = send(&f.router, post_json("/webhook/hook", Some("secret"), &payload)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "No message provided");
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_webhook_unknown_channel() {
    let f = fixture().await;
    let payload = serde_json::json!({"message": "ping"});

    let (status, _) = send(&f.router, post_json("/webhook/nope", Some("secret"), &payload)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_webhook_verification_challenge() {
    let f = fixture().await;

    let (status, body) = send(
        &f.router,
        get(
            "/webhook/hook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=c123",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"c123");

    let (status, _) = send(
        &f.router,
        get(
            "/webhook/hook?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=c123",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_admin_requires_api_key() {
    let f = fixture().await;

    let (status, _) = send(&f.router, get("/api/plugins", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&f.router, get("/api/plugins", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_plugin_listing_masks_secrets() {
    let f = fixture().await;

    let (status, body) = send(&f.router, get("/api/plugins", Some(ADMIN_KEY))).await;

    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    let plugin = &body[0];
    assert_eq!(plugin["id"], "hook");
    assert_eq!(plugin["channels"][0], "hook");
    let token = plugin["config"]
        .as_array()
        .unwrap()
        .iter()
        .find(|field| field["key"] == "auth_token")
        .unwrap();
    assert_eq!(token["value"], MASKED_VALUE);
    assert!(!body.to_string().contains("secret\""));
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_plugin_toggle() {
    let f = fixture().await;

    let (status, body) = send(
        &f.router,
        post_json("/api/plugins/hook/disable", Some(ADMIN_KEY), &serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["enabled"], false);
    assert!(!f.loader.list_plugins()[0].enabled);

    let (status, _) = send(
        &f.router,
        post_json("/api/plugins/ghost/enable", Some(ADMIN_KEY), &serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_pairing_approve_endpoint() {
    let f = fixture().await;
    let request = f.pairing.create_request("u1", "Alice", "hook").unwrap();

    let (status, body) = send(&f.router, get("/api/pairing/pending", Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)[0]["code"], request.code.as_str());

    let approve = serde_json::json!({"code": request.code});
    let (status, body) = send(
        &f.router,
        post_json("/api/pairing/approve", Some(ADMIN_KEY), &approve),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["request"]["sender_id"], "u1");
    assert!(f.pairing.is_authorized("u1"));

    // Same code again is simply unknown
    let (status, _) = send(
        &f.router,
        post_json("/api/pairing/approve", Some(ADMIN_KEY), &approve),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&f.router, get("/api/pairing/allowed", Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["allowed"][0], "u1");
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_pairing_wait_endpoint() {
    let f = fixture().await;
    let request = f.pairing.create_request("u3", "Carol", "hook").unwrap();

    let waiting = tokio::spawn({
        let router = f.router.clone();
        let body = serde_json::json!({"code": request.code});
        async move { send(&router, post_json("/api/pairing/wait", Some(ADMIN_KEY), &body)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.pairing.approve_code(&request.code).unwrap();

    let (status, body) = waiting.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["status"], "approved");
    assert_eq!(json(&body)["request"]["sender_id"], "u3");

    let other = f.pairing.create_request("u4", "Dan", "hook").unwrap();
    let (_, body) = send(
        &f.router,
        post_json(
            "/api/pairing/wait",
            Some(ADMIN_KEY),
            &serde_json::json!({"code": other.code, "timeout_secs": 0}),
        ),
    )
    .await;
    assert_eq!(json(&body)["status"], "timed_out");

    let (_, body) = send(
        &f.router,
        post_json(
            "/api/pairing/wait",
            Some(ADMIN_KEY),
            &serde_json::json!({"code": "NOPE2345"}),
        ),
    )
    .await;
    assert_eq!(json(&body)["status"], "expired");
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_pairing_block_endpoint() {
    let f = fixture().await;
    f.pairing.allow("u2").unwrap();

    let (status, _) = send(
        &f.router,
        post_json(
            "/api/pairing/block",
            Some(ADMIN_KEY),
            &serde_json::json!({"sender_id": "u2"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(!f.pairing.is_authorized("u2"));
    assert_eq!(f.pairing.list_blocked(), vec!["u2".to_string()]);
    f.loader.stop_all().await;
}

#[tokio::test]
async fn test_bindings_endpoints() {
    let f = fixture().await;

    let bind = serde_json::json!({"thread_id": "t1", "target": "research", "creator_id": "u1"});
    let (status, body) = send(&f.router, post_json("/api/bindings", Some(ADMIN_KEY), &bind)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json(&body)["target"], "research");

    let (status, body) = send(&f.router, get("/api/bindings?creator_id=u1", Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body).as_array().unwrap().len(), 1);

    let (_, body) = send(&f.router, get("/api/bindings?creator_id=u9", Some(ADMIN_KEY))).await;
    assert!(json(&body).as_array().unwrap().is_empty());

    let delete = |uri: &str| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("authorization", format!("Bearer {ADMIN_KEY}"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&f.router, delete("/api/bindings/t1")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&f.router, delete("/api/bindings/t1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    f.loader.stop_all().await;
}
