// tests/pipeline_tests.rs

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use kmi_rotor::{create_router, AppState, KeyRecord, ProxyConfig, Registry};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn test_config(dir: &TempDir) -> ProxyConfig {
    ProxyConfig {
        state_dir: dir.path().to_path_buf(),
        dry_run: true,
        enforce_permissions: false,
        ..ProxyConfig::default()
    }
}

fn registry(labels: &[&str]) -> Registry {
    Registry::new(
        labels
            .iter()
            .map(|l| KeyRecord::new(*l, format!("sk-{l}-secret-0000")))
            .collect(),
    )
    .unwrap()
}

fn build_app(config: ProxyConfig, registry: Registry) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(config, registry).unwrap());
    (create_router(Arc::clone(&state)), state)
}

fn proxy_request(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(format!("/kmi-rotor/v1/{path}"));
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn dry_run_end_to_end_records_state_and_trace() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.proxy_token = "secret-token".to_string();
    let (app, state) = build_app(config.clone(), registry(&["a"]));

    let response = app
        .oneshot(proxy_request("models", Some("secret-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = response_json(response).await;
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["method"], "GET");
    assert_eq!(json["path"], "models");
    assert_eq!(json["key_label"], "a");
    assert!(json["upstream_url"]
        .as_str()
        .unwrap()
        .ends_with("/models"));

    let rotation = state.state.lock().await;
    assert_eq!(rotation.keys["a"].request_count, 1);
    drop(rotation);

    let entries = kmi_rotor::trace::load_recent_entries(&config.trace_file(), 200);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, 200);
    assert_eq!(entries[0].key_label, "a");
    assert_eq!(entries[0].request_id.len(), 32);
    assert!(entries[0].error_code.is_none());
}

#[tokio::test]
async fn missing_or_wrong_token_is_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.proxy_token = "secret-token".to_string();
    let (app, _state) = build_app(config, registry(&["a"]));

    let response = app
        .clone()
        .oneshot(proxy_request("models", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = response_json(response).await;
    assert!(json["hint"].as_str().unwrap().contains("X-KMI-Proxy-Token"));

    let response = app
        .oneshot(proxy_request("models", Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn proxy_token_header_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.proxy_token = "secret-token".to_string();
    let (app, _state) = build_app(config, registry(&["a"]));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/kmi-rotor/v1/models")
        .header("x-kmi-proxy-token", "secret-token")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn round_robin_distributes_requests_evenly() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.auto_rotate_allowed = true;
    let (app, state) = build_app(config.clone(), registry(&["a", "b", "c"]));
    state.state.lock().await.auto_rotate = true;

    for _ in 0..9 {
        let response = app
            .clone()
            .oneshot(proxy_request("chat/completions", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let entries = kmi_rotor::trace::load_recent_entries(&config.trace_file(), 200);
    let labels: Vec<&str> = entries.iter().map(|e| e.key_label.as_str()).collect();
    assert_eq!(labels, ["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
    assert_eq!(state.state.lock().await.rotation_index, 0);
    assert_eq!(kmi_rotor::trace::compute_confidence(&entries), 100.0);
}

#[tokio::test]
async fn global_rate_limit_rejects_with_429() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.max_rps = 2;
    let (app, _state) = build_app(config, registry(&["a"]));

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(proxy_request("models", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(proxy_request("models", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = response_json(response).await;
    assert_eq!(json["error"], "Proxy rate limit exceeded");
}

#[tokio::test]
async fn per_key_rate_limit_rolls_back_the_rotation_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.auto_rotate_allowed = true;
    config.max_rps_per_key = 1;
    let (app, state) = build_app(config.clone(), registry(&["a", "b"]));
    state.state.lock().await.auto_rotate = true;

    for expected in ["a", "b"] {
        let response = app
            .clone()
            .oneshot(proxy_request("models", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["key_label"], expected);
    }

    // Third selection lands on "a" again and trips its per-key limit; the
    // cursor must roll back to where it was before the selection.
    let cursor_before = state.state.lock().await.rotation_index;
    let response = app.oneshot(proxy_request("models", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = response_json(response).await;
    assert_eq!(json["error"], "Per-key rate limit exceeded");

    let rotation = state.state.lock().await;
    assert_eq!(rotation.rotation_index, cursor_before);
    assert_eq!(rotation.keys["a"].request_count, 1);
    assert_eq!(rotation.keys["b"].request_count, 1);
    drop(rotation);

    let entries = kmi_rotor::trace::load_recent_entries(&config.trace_file(), 200);
    assert_eq!(entries.len(), 2, "rejected request must not be traced");
}

#[tokio::test]
async fn exhausted_pool_returns_503_with_remediation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let (app, state) = build_app(config, registry(&["a", "b"]));
    {
        let mut rotation = state.state.lock().await;
        rotation.mark_exhausted("a", 300);
        rotation.mark_blocked("b", kmi_rotor::storage::BlockReason::PaymentRequired, 300);
    }

    let response = app.oneshot(proxy_request("models", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = response_json(response).await;
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("All keys are unavailable"));
}

#[tokio::test]
async fn healthz_always_answers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.proxy_token = "secret-token".to_string();
    let (app, _state) = build_app(config, registry(&["a"]));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cooldown_excludes_a_key_until_it_expires() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.auto_rotate_allowed = true;
    let (app, state) = build_app(config, registry(&["a", "b"]));
    state.state.lock().await.auto_rotate = true;
    state.state.lock().await.mark_exhausted("a", 300);

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(proxy_request("models", None))
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["key_label"], "b");
    }

    // Force-expire the cooldown; "a" becomes selectable again.
    {
        let mut rotation = state.state.lock().await;
        rotation.keys.get_mut("a").unwrap().exhausted_until =
            Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        rotation.rotation_index = 0;
    }
    let response = app.oneshot(proxy_request("models", None)).await.unwrap();
    let json = response_json(response).await;
    assert_eq!(json["key_label"], "a");
}
