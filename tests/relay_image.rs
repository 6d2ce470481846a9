//! Wire-level tests of the image generation relay.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use llm_relay::relay::cost::RatioTables;
use llm_relay::relay::http::router;
use llm_relay::relay::ledger::MemoryQuotaStore;
use llm_relay::{ChannelType, RelayContext, RelaySettings, RelayState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn seeded_store(user_quota: i64) -> Arc<MemoryQuotaStore> {
    let store = Arc::new(MemoryQuotaStore::new());
    store.set_user_quota(1, user_quota);
    store.set_token_quota(10, user_quota);
    store
}

fn image_ctx(base_url: &str) -> RelayContext {
    RelayContext {
        user_id: 1,
        token_id: 10,
        token_name: "test-token".to_string(),
        channel_id: 7,
        channel_type: ChannelType::OpenAi,
        base_url: base_url.to_string(),
        api_key: "sk-upstream".to_string(),
        group: "default".to_string(),
        consume_quota: true,
        ..RelayContext::default()
    }
}

async fn generate(state: RelayState, ctx: RelayContext, body: Value) -> axum::response::Response {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/images/generations")
        .header("content-type", "application/json")
        .extension(ctx)
        .body(Body::from(body.to_string()))
        .expect("request");
    router(state).oneshot(request).await.expect("response")
}

async fn error_code(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("error json");
    body["error"]["code"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn validation_rejects_before_dispatch() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/images/generations");
        then.status(200).body("{}");
    });

    let store = seeded_store(1_000_000);
    let state =
        RelayState::with_tables(RelaySettings::default(), store.clone(), RatioTables::default())
            .expect("state");

    let cases = [
        (
            json!({"model": "dall-e-2", "prompt": "a cat", "size": "999x999"}),
            "size_not_supported",
        ),
        (
            json!({"model": "dall-e-2", "prompt": "", "size": "256x256"}),
            "prompt_missing",
        ),
        (
            json!({"model": "dall-e-3", "prompt": "a cat", "size": "1024x1024", "n": 2}),
            "n_not_within_range",
        ),
    ];

    for (body, expected_code) in cases {
        let response = generate(state.clone(), image_ctx(&upstream.base_url()), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, expected_code);
    }

    mock.assert_hits(0);
    assert_eq!(store.user_quota(1), 1_000_000);
    assert!(store.consume_logs().is_empty());
}

#[tokio::test]
async fn prompt_length_limit_applies_per_model() {
    let upstream = MockServer::start();
    let mut tables = RatioTables::default();
    tables
        .image_prompt_length_limits
        .insert("dall-e-2".to_string(), 10);

    let store = seeded_store(1_000_000);
    let state =
        RelayState::with_tables(RelaySettings::default(), store, tables).expect("state");

    let response = generate(
        state,
        image_ctx(&upstream.base_url()),
        json!({"model": "dall-e-2", "prompt": "a very long prompt", "size": "256x256"}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "prompt_too_long");
}

#[tokio::test]
async fn hd_generation_commits_the_fixed_cost() {
    let upstream = MockServer::start();
    let upstream_body = r#"{"created":1,"data":[{"url":"https://images.example.com/1.png"}]}"#;
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/images/generations")
            .header("authorization", "Bearer sk-upstream");
        then.status(200)
            .header("content-type", "application/json")
            .body(upstream_body);
    });

    let mut tables = RatioTables::default();
    tables.model_ratio.insert("dall-e-3".to_string(), 0.04);
    tables
        .image_generation_amounts
        .insert("dall-e-3".to_string(), (1, 2));

    let store = seeded_store(1_000_000);
    let state =
        RelayState::with_tables(RelaySettings::default(), store.clone(), tables).expect("state");

    let response = generate(
        state,
        image_ctx(&upstream.base_url()),
        json!({
            "model": "dall-e-3",
            "prompt": "a cat wearing a hat",
            "size": "1024x1024",
            "quality": "hd",
            "n": 2
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    assert_eq!(bytes.as_ref(), upstream_body.as_bytes());
    mock.assert();

    // hd at 1024x1024 doubles the size ratio: ⌊0.04 × 2 × 1000⌋ × 2.
    assert_eq!(store.token_quota(10), 1_000_000 - 160);
    let logs = store.consume_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].model, "dall-e-3");
    assert_eq!(logs[0].quota, 160);
    assert_eq!(logs[0].prompt_tokens, 0);
    assert_eq!(logs[0].completion_tokens, 0);
}

#[tokio::test]
async fn upstream_failure_aborts_without_commit() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/images/generations");
        then.status(500)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"backend exploded","type":"server_error"}}"#);
    });

    let store = seeded_store(1_000_000);
    let state = RelayState::with_tables(
        RelaySettings::default(),
        store.clone(),
        RatioTables::default(),
    )
    .expect("state");

    let response = generate(
        state,
        image_ctx(&upstream.base_url()),
        json!({"model": "dall-e-2", "prompt": "a cat", "size": "256x256"}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    mock.assert();
    assert_eq!(store.token_quota(10), 1_000_000);
    assert!(store.consume_logs().is_empty());
}

#[tokio::test]
async fn defaults_fill_model_and_size() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/images/generations")
            .json_body_partial(r#"{"prompt": "a cat"}"#);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"created":1,"data":[]}"#);
    });

    let mut tables = RatioTables::default();
    tables.model_ratio.insert("dall-e-2".to_string(), 8.0);

    let store = seeded_store(1_000_000);
    let state =
        RelayState::with_tables(RelaySettings::default(), store.clone(), tables).expect("state");

    let response = generate(
        state,
        image_ctx(&upstream.base_url()),
        json!({"prompt": "a cat"}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let _ = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    mock.assert();

    // Defaulted to dall-e-2 at 1024x1024: ⌊8.0 × 1.25 × 1000⌋ × 1.
    assert_eq!(store.token_quota(10), 1_000_000 - 10_000);
    assert_eq!(store.consume_logs()[0].model, "dall-e-2");
}
