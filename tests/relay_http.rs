//! End-to-end relay scenarios against mock upstreams.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use manta_relay::breaker::build_key;
use manta_relay::model::{AttemptStatus, CircuitBreakerState, GroupMode};
use serde_json::json;
use tower::util::ServiceExt;

use common::*;

fn ok_completion(model: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3}
    })
}

#[tokio::test]
async fn cold_path_succeeds_on_first_channel() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    let mock_a = server_a
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-a")
                .json_body_partial(r#"{"model": "m1"}"#);
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;
    let mock_b = server_b
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    let mut group = group("m1", GroupMode::Failover, &[1, 2]);
    group.session_keep_time = 300;
    let harness = Harness::new(
        vec![
            channel(1, "a", &server_a.url("/v1")),
            channel(2, "b", &server_b.url("/v1")),
        ],
        vec![group],
    );

    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_body(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "hi");

    mock_a.assert_async().await;
    assert_eq!(mock_b.hits_async().await, 0);

    eventually(|| !harness.logs.records().is_empty()).await;
    let records = harness.logs.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.total_attempts, 1);
    assert_eq!(record.attempts[0].status, AttemptStatus::Success);
    assert_eq!(record.attempts[0].channel_id, 1);
    assert_eq!(record.input_tokens, 7);
    assert_eq!(record.output_tokens, 3);
    assert!(record.error.is_empty());

    // Stickiness points at the successful channel.
    let sticky = harness.sticky(0, "m1").unwrap();
    assert_eq!(sticky.channel_id, 1);

    // Breakers untouched.
    let snap_a = harness.state.breaker.snapshot(&build_key(1, "m1"));
    assert_eq!(snap_a.state, CircuitBreakerState::Closed);
    assert_eq!(snap_a.trip_count, 0);
    let snap_b = harness.state.breaker.snapshot(&build_key(2, "m1"));
    assert_eq!(snap_b.state, CircuitBreakerState::Closed);
}

#[tokio::test]
async fn failover_trips_breaker_and_uses_next_channel() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    let mock_a = server_a
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("upstream down");
        })
        .await;
    let mock_b = server_b
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    let mut group = group("m1", GroupMode::Failover, &[1, 2]);
    group.session_keep_time = 300;
    let harness = Harness::new(
        vec![
            channel(1, "a", &server_a.url("/v1")),
            channel(2, "b", &server_b.url("/v1")),
        ],
        vec![group],
    );
    harness.settings.set("cb_failure_threshold", "1");

    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::OK);

    mock_a.assert_async().await;
    mock_b.assert_async().await;

    eventually(|| !harness.logs.records().is_empty()).await;
    let records = harness.logs.records();
    let attempts = &records[0].attempts;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].channel_id, 1);
    assert_eq!(attempts[0].relay_status_code, 503);
    assert_eq!(attempts[0].relay_error_source, "upstream");
    assert!(attempts[0].relay_retryable);
    assert!(attempts[0].relay_trippable);
    assert_eq!(attempts[1].status, AttemptStatus::Success);
    assert_eq!(attempts[1].channel_id, 2);

    let snap_a = harness.state.breaker.snapshot(&build_key(1, "m1"));
    assert_eq!(snap_a.state, CircuitBreakerState::Open);
    assert_eq!(snap_a.trip_count, 1);
    assert!(snap_a.last_failure_reason.contains("upstream error: 503"));

    let sticky = harness.sticky(0, "m1").unwrap();
    assert_eq!(sticky.channel_id, 2);
}

#[tokio::test]
async fn all_open_returns_structured_503_with_retry_after() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).body("boom");
        })
        .await;

    let harness = Harness::new(
        vec![
            channel(1, "a", &server.url("/v1")),
            channel(2, "b", &server.url("/v1")),
        ],
        vec![group("m1", GroupMode::Failover, &[1, 2])],
    );
    harness.settings.set("cb_failure_threshold", "1");
    harness.settings.set("cb_base_cooldown_ms", "10000");

    // Round 1 trips both channels; round 2 finds every breaker open.
    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get("retry-after").unwrap().to_str().unwrap(),
        "10"
    );
    let body = read_body(response).await;
    assert_eq!(body["error"], "all upstream circuit breakers are open");
    let breaker = &body["data"]["circuit_breaker"];
    assert_eq!(breaker["reason"], "all_open");
    assert_eq!(breaker["retry_after_seconds"], 10);
    assert_eq!(breaker["scope"]["group_id"], 1);
    assert_eq!(breaker["scope"]["model_name"], "m1");
    assert!(breaker["earliest_retry_at"].as_str().unwrap().ends_with('Z'));

    let records = harness.logs.records();
    let last = records.last().unwrap();
    let all_open = last
        .attempts
        .iter()
        .find(|attempt| attempt.cb_decision == "all_open")
        .expect("all_open attempt recorded");
    assert_eq!(all_open.status, AttemptStatus::CircuitBreak);
    assert_eq!(all_open.retry_after_seconds, 10);

    // A second request short-circuits in round 1.
    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn probe_after_cooldown_closes_breaker_on_success() {
    let server = MockServer::start_async().await;
    let mut mock_fail = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(502).body("bad gateway");
        })
        .await;

    let harness = Harness::new(
        vec![channel(1, "a", &server.url("/v1"))],
        vec![group("m1", GroupMode::Failover, &[1])],
    );
    harness.settings.set("cb_failure_threshold", "1");
    harness.settings.set("cb_base_cooldown_ms", "5000");

    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let key = build_key(1, "m1");
    eventually(|| harness.state.breaker.snapshot(&key).state == CircuitBreakerState::Open).await;

    mock_fail.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    // Probe-eligible after the cooldown elapses.
    harness.clock.advance(5_001);
    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::OK);

    eventually(|| harness.state.breaker.snapshot(&key).state == CircuitBreakerState::Closed).await;
    let snap = harness.state.breaker.snapshot(&key);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(snap.trip_count, 1);
    assert!(!snap.probe_in_flight);
}

#[tokio::test]
async fn rate_limited_channel_does_not_trip_but_falls_over() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    server_a
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429).body("slow down");
        })
        .await;
    server_b
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    let harness = Harness::new(
        vec![
            channel(1, "a", &server_a.url("/v1")),
            channel(2, "b", &server_b.url("/v1")),
        ],
        vec![group("m1", GroupMode::Failover, &[1, 2])],
    );
    harness.settings.set("cb_failure_threshold", "1");

    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let snap = harness.state.breaker.snapshot(&build_key(1, "m1"));
    assert_eq!(snap.state, CircuitBreakerState::Closed);
    assert_eq!(snap.trip_count, 0);
    assert_eq!(snap.consecutive_failures, 0);
}

#[tokio::test]
async fn non_retryable_upstream_error_ends_request_without_fallback() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    server_a
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(404).body("model does not exist");
        })
        .await;
    let mock_b = server_b
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    let harness = Harness::new(
        vec![
            channel(1, "a", &server_a.url("/v1")),
            channel(2, "b", &server_b.url("/v1")),
        ],
        vec![group("m1", GroupMode::Failover, &[1, 2])],
    );

    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_body(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("upstream error: 404"));
    assert_eq!(mock_b.hits_async().await, 0);
}

#[tokio::test]
async fn disabled_channel_is_skipped() {
    let server_b = MockServer::start_async().await;
    server_b
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    let mut channel_a = channel(1, "a", "http://127.0.0.1:1/v1");
    channel_a.enabled = false;
    let harness = Harness::new(
        vec![channel_a, channel(2, "b", &server_b.url("/v1"))],
        vec![group("m1", GroupMode::Failover, &[1, 2])],
    );

    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::OK);

    eventually(|| !harness.logs.records().is_empty()).await;
    let records = harness.logs.records();
    let attempts = &records[0].attempts;
    assert_eq!(attempts[0].status, AttemptStatus::Skipped);
    assert!(attempts[0].msg.contains("disabled"));
    assert_eq!(attempts[1].status, AttemptStatus::Success);
}

#[tokio::test]
async fn unknown_model_returns_404() {
    let harness = Harness::new(Vec::new(), Vec::new());
    let response = harness.post_json("/v1/chat/completions", chat_body("nope")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_body(response).await;
    assert_eq!(body["error"], "model not found");
}

#[tokio::test]
async fn empty_group_returns_503_without_touching_breakers() {
    let harness = Harness::new(Vec::new(), vec![group("m1", GroupMode::Failover, &[])]);
    let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = read_body(response).await;
    assert_eq!(body["error"], "no channels configured for model");
}

#[tokio::test]
async fn invalid_body_is_rejected_up_front() {
    let harness = Harness::new(Vec::new(), Vec::new());
    let response = harness
        .post_json("/v1/chat/completions", json!({"messages": []}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_body(response).await;
    assert_eq!(body["error"], "model is required");
}

#[tokio::test]
async fn sticky_session_pins_round_robin_selection() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    for server in [&server_a, &server_b] {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(ok_completion("m1"));
            })
            .await;
    }

    let mut group = group("m1", GroupMode::RoundRobin, &[1, 2]);
    group.session_keep_time = 600;
    let harness = Harness::new(
        vec![
            channel(1, "a", &server_a.url("/v1")),
            channel(2, "b", &server_b.url("/v1")),
        ],
        vec![group],
    );

    for sent in 1..=4 {
        let response = harness.post_json("/v1/chat/completions", chat_body("m1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        // Wait out the driver task so stickiness from this request is
        // visible to the next one.
        eventually(|| harness.logs.records().len() == sent).await;
    }
    let channels: Vec<i64> = harness
        .logs
        .records()
        .iter()
        .map(|record| record.channel_id)
        .collect();
    // Round-robin would alternate; stickiness pins everything after the
    // first request to the same channel.
    assert!(channels.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn embeddings_requests_relay_through_the_embeddings_path() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200).json_body(json!({
                "object": "list",
                "model": "e1",
                "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2]}],
                "usage": {"prompt_tokens": 4, "total_tokens": 4}
            }));
        })
        .await;

    let harness = Harness::new(
        vec![channel(1, "a", &server.url("/v1"))],
        vec![group("e1", GroupMode::Failover, &[1])],
    );

    let response = harness
        .post_json(
            "/v1/embeddings",
            json!({"model": "e1", "input": "hello world"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_body(response).await;
    assert_eq!(body["data"][0]["embedding"][0], 0.1);
    mock.assert_async().await;
}

#[tokio::test]
async fn api_keys_gate_the_relay_when_configured() {
    use manta_relay::http::{router, AppState};
    use std::collections::HashMap;

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(ok_completion("m1"));
        })
        .await;

    let harness = Harness::new(
        vec![channel(1, "a", &server.url("/v1"))],
        vec![group("m1", GroupMode::Failover, &[1])],
    );
    let app = router(
        AppState::new(harness.state.clone())
            .with_api_keys(HashMap::from([("mk-dev".to_string(), 42)])),
    );

    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(chat_body("m1").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("authorization", "Bearer mk-dev")
                .body(Body::from(chat_body("m1").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}
