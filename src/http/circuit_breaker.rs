//! Circuit-breaker admin endpoints: group snapshots plus channel and
//! per-item resets.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::breaker;
use crate::model::{
    CircuitBreakerResetResponse, CircuitBreakerState, GroupCircuitBreakerItemState,
    GroupCircuitBreakerStatesResponse,
};
use crate::utils::clock::format_rfc3339_millis;

use super::{error_response, AppState};

pub async fn group_states(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> Response {
    let Some(group) = state.relay.groups.get(group_id).await else {
        return error_response(StatusCode::NOT_FOUND, "group not found");
    };

    let now_ms = state.relay.clock.now_millis();
    let mut items = Vec::with_capacity(group.items.len());
    for item in &group.items {
        let channel_name = state
            .relay
            .channels
            .get(item.channel_id)
            .await
            .map(|channel| channel.name)
            .unwrap_or_default();
        let key = breaker::build_key(item.channel_id, &item.model_name);
        let snap = state.relay.breaker.snapshot(&key);
        items.push(GroupCircuitBreakerItemState {
            group_id: group.id,
            group_name: group.name.clone(),
            channel_id: item.channel_id,
            channel_name,
            model_name: item.model_name.clone(),
            breaker_key: key,
            state: snap.state,
            consecutive_failures: snap.consecutive_failures,
            trip_count: snap.trip_count,
            last_failure_at: format_rfc3339_millis(snap.last_failure_at_ms),
            last_failure_reason: snap.last_failure_reason,
            last_trip_at: format_rfc3339_millis(snap.last_trip_at_ms),
            open_until: format_rfc3339_millis(snap.open_until_ms),
            open_remaining_second: open_remaining_seconds(snap.open_until_ms, now_ms, snap.state),
            probe_in_flight: snap.probe_in_flight,
        });
    }

    Json(json!({
        "data": GroupCircuitBreakerStatesResponse {
            group_id: group.id,
            group_name: group.name,
            items,
        }
    }))
    .into_response()
}

pub async fn reset_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
) -> Response {
    let (affected_breakers, breaker_keys) = state.relay.breaker.reset_channel(channel_id);
    tracing::info!(channel_id, affected_breakers, "circuit breakers reset for channel");
    Json(json!({
        "data": CircuitBreakerResetResponse {
            channel_id,
            affected_breakers,
            breaker_keys,
        }
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ResetItemRequest {
    pub channel_id: i64,
    pub model_name: String,
}

pub async fn reset_item(
    State(state): State<AppState>,
    payload: Result<Json<ResetItemRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.to_string());
        }
    };
    if request.model_name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "model_name is required");
    }

    let key = breaker::build_key(request.channel_id, &request.model_name);
    let affected = usize::from(state.relay.breaker.reset_key(&key));
    Json(json!({
        "data": {
            "breaker_key": key,
            "affected_breakers": affected,
        }
    }))
    .into_response()
}

fn open_remaining_seconds(open_until_ms: u64, now_ms: u64, state: CircuitBreakerState) -> u64 {
    if state != CircuitBreakerState::Open || open_until_ms <= now_ms {
        return 0;
    }
    (open_until_ms - now_ms).div_ceil(1_000)
}
