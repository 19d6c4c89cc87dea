//! The relay dispatch engine: per-request driver tying together the
//! balancer iterator, the circuit-breaker manager, the forwarder and the
//! metrics recorder.
//!
//! Each inbound request runs on its own task. The task owns the full
//! retry lifecycle and reports the response head to the HTTP handler over
//! a oneshot channel: a JSON head for buffered responses, a body channel
//! for committed SSE streams.

pub mod forward;
pub mod metrics;

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio::sync::{mpsc, oneshot};

use crate::balancer::iterator::CandidateIterator;
use crate::balancer::session::SessionMap;
use crate::balancer::Balancers;
use crate::breaker::{self, BreakerManager};
use crate::error::RelayError;
use crate::model::{
    AttemptStatus, ChannelAttempt, CircuitBreakerAllOpenData, CircuitBreakerAllOpenScope, Group,
};
use crate::store::{
    ChannelStore, GroupStore, PriceTable, RelayLogSink, SettingStore, StatsSink,
};
use crate::transform::{self, InboundKind, InternalRequest, RequestKind};
use crate::utils::clock::{format_rfc3339_millis, Clock, SystemClock};

pub use forward::{error_body, error_body_with_data, HeadBody, ResponseHead};
use forward::AttemptExchange;
use metrics::RelayMetrics;

const MAX_ROUNDS: u32 = 3;
const DEFAULT_MAX_SSE_EVENT_BYTES: usize = 32 * 1024 * 1024;

/// Environment variable overriding the SSE event size cap, read once at
/// startup. Image-capable models ship very large base64 frames.
pub const MAX_SSE_EVENT_SIZE_ENV: &str = "MANTA_RELAY_MAX_SSE_EVENT_SIZE";

/// Everything the relay core needs, owned explicitly so tests can build a
/// hermetic instance. One per server.
pub struct RelayState {
    pub channels: Arc<dyn ChannelStore>,
    pub groups: Arc<dyn GroupStore>,
    pub settings: Arc<dyn SettingStore>,
    pub relay_log: Arc<dyn RelayLogSink>,
    pub stats: Arc<dyn StatsSink>,
    pub prices: Arc<dyn PriceTable>,
    pub breaker: BreakerManager,
    pub sessions: SessionMap,
    pub balancers: Balancers,
    pub clock: Arc<dyn Clock>,
    pub http: reqwest::Client,
    pub max_sse_event_bytes: usize,
}

impl RelayState {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        groups: Arc<dyn GroupStore>,
        settings: Arc<dyn SettingStore>,
        relay_log: Arc<dyn RelayLogSink>,
        stats: Arc<dyn StatsSink>,
        prices: Arc<dyn PriceTable>,
    ) -> Self {
        Self {
            channels,
            groups,
            settings,
            relay_log,
            stats,
            prices,
            breaker: BreakerManager::new(),
            sessions: SessionMap::new(),
            balancers: Balancers::new(),
            clock: Arc::new(SystemClock),
            http: reqwest::Client::new(),
            max_sse_event_bytes: max_sse_event_bytes_from_env(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn with_max_sse_event_bytes(mut self, max: usize) -> Self {
        self.max_sse_event_bytes = max.max(1);
        self
    }
}

fn max_sse_event_bytes_from_env() -> usize {
    std::env::var(MAX_SSE_EVENT_SIZE_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_SSE_EVENT_BYTES)
}

/// Relay entry: parse the inbound body, then run the retry driver on its
/// own task and wait for the response head.
pub async fn handle(
    state: Arc<RelayState>,
    kind: InboundKind,
    api_key_id: i64,
    client_headers: HeaderMap,
    body: Bytes,
) -> ResponseHead {
    let inbound = transform::inbound(kind);
    let request = match inbound.transform_request(&body) {
        Ok(request) => request,
        Err(err) => return ResponseHead::error(err.status_or(400), &err.message),
    };

    let (head_tx, head_rx) = oneshot::channel();
    tokio::spawn(drive(
        state,
        kind,
        request,
        api_key_id,
        client_headers,
        head_tx,
    ));

    match head_rx.await {
        Ok(head) => head,
        Err(_) => ResponseHead::error(502, "relay terminated unexpectedly"),
    }
}

/// The multi-round retry driver.
async fn drive(
    state: Arc<RelayState>,
    kind: InboundKind,
    mut request: InternalRequest,
    api_key_id: i64,
    client_headers: HeaderMap,
    head_tx: oneshot::Sender<ResponseHead>,
) {
    let inbound = transform::inbound(kind);
    let request_model = request.model.clone();
    let mut metrics = RelayMetrics::new(api_key_id, &request_model, state.clock.now_millis());

    let Some(group) = state.groups.get_by_model(&request_model).await else {
        let _ = head_tx.send(ResponseHead::error(404, "model not found"));
        return;
    };
    metrics.set_group(&group.name);

    if group.items.is_empty() {
        metrics.save(
            &state,
            false,
            Some("no channels configured for model"),
            Vec::new(),
        );
        let _ = head_tx.send(ResponseHead::error(503, "no channels configured for model"));
        return;
    }

    let cfg = breaker::config::resolve(state.settings.as_ref());
    let mut head = Some(head_tx);
    let mut written = false;
    let mut all_attempts: Vec<ChannelAttempt> = Vec::new();
    let mut last_err: Option<RelayError> = None;
    let mut last_status: u16 = 0;

    for round in 1..=MAX_ROUNDS {
        let now = state.clock.now_millis();
        let (filtered, earliest_retry) = state.breaker.filter_available(&group.items, now, &cfg);

        if cfg.enabled && filtered.is_empty() {
            let data = build_all_open_data(&group, &request_model, earliest_retry, now);
            let mut iter = new_iterator(&state, &group, &[], None, round);
            iter.record_all_open(&data.earliest_retry_at, data.retry_after_seconds);
            all_attempts.extend(iter.into_attempts());

            let err = RelayError::all_breakers_open();
            let retry_after = data.retry_after_seconds;
            let body = error_body_with_data(
                &err.message,
                serde_json::json!({ "circuit_breaker": data }),
            );
            metrics.save(&state, false, Some(&err.message), all_attempts);
            if let Some(head) = head.take() {
                let _ = head.send(ResponseHead {
                    status: 503,
                    retry_after: Some(retry_after),
                    body: HeadBody::Json(body),
                });
            }
            return;
        }

        let sticky = state
            .sessions
            .get(api_key_id, &request_model, group.session_keep_time, now);
        let mut iter = new_iterator(&state, &group, &filtered, sticky.as_ref(), round);

        while iter.advance() {
            // Client gone before anything was committed: stop quietly.
            if head.as_ref().map(|tx| tx.is_closed()).unwrap_or(false) && !written {
                tracing::info!("request canceled, stopping retry");
                return;
            }

            let item = iter.current().clone();
            let breaker_key = breaker::build_key(item.channel_id, &item.model_name);

            let Some(channel) = state.channels.get(item.channel_id).await else {
                let err = RelayError::local(502, format!("channel {} not found", item.channel_id));
                iter.skip(item.channel_id, 0, "", &err);
                last_status = err.status_code;
                last_err = Some(err);
                continue;
            };

            if !channel.enabled {
                let err =
                    RelayError::local(502, format!("channel {} is disabled", channel.name));
                iter.skip(channel.id, 0, &channel.name, &err);
                last_status = err.status_code;
                last_err = Some(err);
                continue;
            }

            let Some(used_key) = channel.pick_key() else {
                let err = RelayError::local(
                    502,
                    format!("channel {} has no usable key", channel.name),
                );
                iter.skip(channel.id, 0, &channel.name, &err);
                last_status = err.status_code;
                last_err = Some(err);
                continue;
            };

            let Some(outbound) = transform::outbound(channel.channel_type) else {
                let err = RelayError::local(
                    502,
                    format!("unsupported channel type: {:?}", channel.channel_type),
                );
                iter.skip(channel.id, used_key.id, &channel.name, &err);
                last_status = err.status_code;
                last_err = Some(err);
                continue;
            };

            if let Some(err) = compatibility_error(&request, &channel) {
                iter.skip(channel.id, used_key.id, &channel.name, &err);
                last_status = err.status_code;
                last_err = Some(err);
                continue;
            }

            let acquire = state
                .breaker
                .acquire(&breaker_key, state.clock.now_millis(), &cfg);
            if !acquire.allowed {
                iter.record_circuit_break(
                    channel.id,
                    used_key.id,
                    &channel.name,
                    &acquire,
                    state.clock.now_millis(),
                );
                last_err = Some(RelayError::local(503, acquire.decision.as_str()));
                last_status = 503;
                continue;
            }

            tracing::info!(
                model = %request_model,
                mode = ?group.mode,
                channel = %channel.name,
                upstream_model = %item.model_name,
                round,
                sticky = iter.is_sticky(),
                "forwarding"
            );

            request.model = item.model_name.clone();
            metrics.set_channel(channel.id, &channel.name, &item.model_name);
            let mut span = iter.start_attempt(channel.id, used_key.id, &channel.name);

            let (status, result) = forward::forward(AttemptExchange {
                state: state.as_ref(),
                inbound,
                outbound,
                request: &request,
                client_headers: &client_headers,
                channel: &channel,
                secret: &used_key.secret,
                first_token_timeout_secs: group.first_token_timeout,
                metrics: &mut metrics,
                head: &mut head,
                written: &mut written,
            })
            .await;

            let now = state.clock.now_millis();
            match result {
                None => {
                    let record = cfg
                        .enabled
                        .then(|| state.breaker.record_success(&breaker_key, &acquire, &cfg, now));
                    span.breaker_trace(&acquire, record.as_ref());
                    iter.end_attempt(span, AttemptStatus::Success, status, "");

                    state
                        .sessions
                        .set(api_key_id, &request_model, channel.id, used_key.id, now);

                    let mut key = used_key;
                    key.status_code = status;
                    key.last_use_timestamp_ms = now;
                    key.total_cost += metrics.total_cost(&state);
                    state.channels.update_key(channel.id, &key).await;

                    // A stream can end before any frame survived the
                    // transforms; the client still gets an empty stream.
                    if let Some(head) = head.take() {
                        let (_tx, rx) = mpsc::channel(1);
                        let _ = head.send(ResponseHead {
                            status: 200,
                            retry_after: None,
                            body: HeadBody::Stream(rx),
                        });
                    }

                    all_attempts.extend(iter.into_attempts());
                    metrics.save(&state, true, None, all_attempts);
                    return;
                }
                Some(rerr) => {
                    let record = cfg.enabled.then(|| {
                        if rerr.trippable {
                            state
                                .breaker
                                .record_failure(&breaker_key, &rerr.message, &acquire, &cfg, now)
                        } else {
                            state.breaker.record_non_trippable(&breaker_key, &acquire, &cfg)
                        }
                    });
                    span.classify(&rerr);
                    span.breaker_trace(&acquire, record.as_ref());
                    let code = if status > 0 { status } else { rerr.status_code };
                    iter.end_attempt(span, AttemptStatus::Failed, code, &rerr.message);

                    let mut key = used_key;
                    key.status_code = code;
                    key.last_use_timestamp_ms = now;
                    state.channels.update_key(channel.id, &key).await;

                    if written {
                        // Bytes already reached the client; retrying on
                        // another channel would corrupt the stream.
                        all_attempts.extend(iter.into_attempts());
                        metrics.save(&state, false, Some(&rerr.message), all_attempts);
                        return;
                    }

                    if code > 0 {
                        last_status = code;
                    }

                    if !rerr.retryable {
                        all_attempts.extend(iter.into_attempts());
                        let status = rerr.status_or(last_status);
                        let message = rerr.message.clone();
                        metrics.save(&state, false, Some(&message), all_attempts);
                        if let Some(head) = head.take() {
                            let _ = head.send(ResponseHead::error(status, &message));
                        }
                        return;
                    }
                    last_err = Some(rerr);
                }
            }
        }

        all_attempts.extend(iter.into_attempts());
    }

    let err = last_err
        .unwrap_or_else(|| RelayError::local(502, "all channels failed"));
    let status = err.status_or(last_status);
    metrics.save(&state, false, Some(&err.message), all_attempts);
    if let Some(head) = head.take() {
        let _ = head.send(ResponseHead::error(status, "all channels failed"));
    }
}

/// Ordering happens inside a narrow scope so the thread-local RNG never
/// lives across an await point.
fn new_iterator(
    state: &RelayState,
    group: &Group,
    items: &[crate::model::GroupItem],
    sticky: Option<&crate::balancer::session::SessionEntry>,
    round: u32,
) -> CandidateIterator {
    let mut rng = rand::rng();
    CandidateIterator::new(&state.balancers, group.mode, items, sticky, round, &mut rng)
}

fn compatibility_error(request: &InternalRequest, channel: &crate::model::Channel) -> Option<RelayError> {
    match request.kind {
        RequestKind::Embedding if !channel.channel_type.supports_embeddings() => {
            Some(RelayError::local(
                502,
                format!(
                    "channel type {:?} not compatible with embedding request",
                    channel.channel_type
                ),
            ))
        }
        RequestKind::Chat if !channel.channel_type.supports_chat() => Some(RelayError::local(
            502,
            format!(
                "channel type {:?} not compatible with chat request",
                channel.channel_type
            ),
        )),
        _ => None,
    }
}

fn build_all_open_data(
    group: &Group,
    model_name: &str,
    earliest_retry: Option<u64>,
    now_ms: u64,
) -> CircuitBreakerAllOpenData {
    let earliest = match earliest_retry {
        Some(at) if at > now_ms => at,
        _ => now_ms + 1_000,
    };
    let retry_after_seconds = (earliest - now_ms).div_ceil(1_000).max(1);
    CircuitBreakerAllOpenData {
        reason: "all_open".to_string(),
        earliest_retry_at: format_rfc3339_millis(earliest),
        retry_after_seconds,
        scope: CircuitBreakerAllOpenScope {
            group_id: group.id,
            model_name: model_name.to_string(),
        },
    }
}
