//! HTTP surface: relay entry points plus the circuit-breaker admin API.

pub mod circuit_breaker;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde_json::json;

use crate::config::RelayConfig;
use crate::relay::{self, HeadBody, RelayState, ResponseHead};
use crate::transform::InboundKind;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayState>,
    /// api-key token → id. Empty means the gateway is open and every
    /// request relays under key id 0.
    pub api_keys: Arc<HashMap<String, i64>>,
}

impl AppState {
    pub fn new(relay: Arc<RelayState>) -> Self {
        Self {
            relay,
            api_keys: Arc::new(HashMap::new()),
        }
    }

    pub fn with_api_keys(mut self, api_keys: HashMap<String, i64>) -> Self {
        self.api_keys = Arc::new(api_keys);
        self
    }

    pub fn from_config(config: RelayConfig) -> Self {
        let api_keys = config.api_key_map();
        Self::new(Arc::new(config.into_relay_state())).with_api_keys(api_keys)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route(
            "/api/v1/circuit-breaker/group/:group_id/states",
            get(circuit_breaker::group_states),
        )
        .route(
            "/api/v1/circuit-breaker/channel/:channel_id/reset",
            post(circuit_breaker::reset_channel),
        )
        .route(
            "/api/v1/circuit-breaker/item/reset",
            post(circuit_breaker::reset_item),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_entry(state, InboundKind::OpenAiChat, headers, body).await
}

async fn embeddings(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    relay_entry(state, InboundKind::OpenAiEmbeddings, headers, body).await
}

async fn relay_entry(
    state: AppState,
    kind: InboundKind,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let api_key_id = match resolve_api_key(&state, &headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let head = relay::handle(state.relay, kind, api_key_id, headers, body).await;
    head_into_response(head)
}

fn resolve_api_key(state: &AppState, headers: &HeaderMap) -> Result<i64, Response> {
    if state.api_keys.is_empty() {
        return Ok(0);
    }
    let token = extract_bearer(headers)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing api key"))?;
    state
        .api_keys
        .get(&token)
        .copied()
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "invalid api key"))
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn head_into_response(head: ResponseHead) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY);
    match head.body {
        HeadBody::Json(bytes) => {
            let mut builder = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(retry_after) = head.retry_after {
                builder = builder.header(header::RETRY_AFTER, retry_after);
            }
            builder
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        HeadBody::Stream(rx) => {
            let frames = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            });
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .header("x-accel-buffering", "no")
                .body(Body::from_stream(frames))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}
