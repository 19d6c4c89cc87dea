//! Forwarding one attempt to an upstream channel.
//!
//! The non-stream path answers a single JSON document. The stream path
//! races the first upstream event against the group's first-token timer,
//! then bridges transformed SSE frames to the client over a bounded body
//! channel. The response head travels to the HTTP handler exactly once
//! through a oneshot; after the first flushed frame the attempt is
//! committed and can no longer be retried on another channel.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, oneshot};

use crate::error::{RelayError, RelayErrorSource};
use crate::model::Channel;
use crate::transform::{Inbound, InternalChunk, InternalRequest, Outbound};
use crate::utils::sse::{sse_data_stream_from_response, SseReadError};

use super::metrics::RelayMetrics;
use super::RelayState;

const ERROR_BODY_LIMIT: usize = 16 * 1024;
const STREAM_BODY_CHANNEL_CAPACITY: usize = 16;

/// Response head delivered to the HTTP handler once per request.
pub struct ResponseHead {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub body: HeadBody,
}

pub enum HeadBody {
    Json(Bytes),
    /// Committed SSE stream; the receiver yields client-ready frames.
    Stream(mpsc::Receiver<Result<Bytes, std::io::Error>>),
}

impl ResponseHead {
    pub fn json(status: u16, body: Bytes) -> Self {
        Self {
            status,
            retry_after: None,
            body: HeadBody::Json(body),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, error_body(message))
    }
}

pub fn error_body(message: &str) -> Bytes {
    Bytes::from(serde_json::json!({ "error": message }).to_string())
}

pub fn error_body_with_data(message: &str, data: serde_json::Value) -> Bytes {
    Bytes::from(serde_json::json!({ "error": message, "data": data }).to_string())
}

/// Everything one forward attempt needs. `head` and `written` belong to
/// the request; the forwarder consumes the head on commit.
pub(crate) struct AttemptExchange<'a> {
    pub state: &'a RelayState,
    pub inbound: &'static dyn Inbound,
    pub outbound: &'static dyn Outbound,
    pub request: &'a InternalRequest,
    pub client_headers: &'a HeaderMap,
    pub channel: &'a Channel,
    pub secret: &'a str,
    pub first_token_timeout_secs: u64,
    pub metrics: &'a mut RelayMetrics,
    pub head: &'a mut Option<oneshot::Sender<ResponseHead>>,
    pub written: &'a mut bool,
}

/// Forward the request once. Returns the upstream status (0 when the
/// exchange never produced one) and the classified error on failure.
pub(crate) async fn forward(x: AttemptExchange<'_>) -> (u16, Option<RelayError>) {
    let upstream_request = match x.outbound.transform_request(
        &x.state.http,
        x.request,
        &x.channel.base_url,
        x.secret,
    ) {
        Ok(request) => request,
        Err(err) => return (0, Some(err)),
    };

    let mut upstream_request = upstream_request;
    copy_headers(
        upstream_request.headers_mut(),
        x.client_headers,
        x.channel,
    );

    let response = match x.state.http.execute(upstream_request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(channel = %x.channel.name, error = %err, "failed to send request");
            return (0, Some(RelayError::from_transport(err)));
        }
    };

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = read_limited(response, ERROR_BODY_LIMIT).await;
        return (status, Some(RelayError::from_upstream_status(status, &body)));
    }

    if x.request.stream {
        forward_stream(x, response, status).await
    } else {
        forward_json(x, response, status).await
    }
}

async fn forward_json(
    x: AttemptExchange<'_>,
    response: reqwest::Response,
    status: u16,
) -> (u16, Option<RelayError>) {
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return (status, Some(RelayError::from_transport(err))),
    };

    let internal = match x.outbound.transform_response(&body) {
        Ok(internal) => internal,
        Err(err) => return (status, Some(fatal_at(status, err))),
    };
    if let Some(usage) = internal.usage {
        x.metrics.set_usage(usage);
    }

    let client_body = match x.inbound.transform_response(&internal) {
        Ok(bytes) => bytes,
        Err(err) => return (status, Some(fatal_at(status, err))),
    };

    if let Some(head) = x.head.take() {
        if head
            .send(ResponseHead::json(200, Bytes::from(client_body)))
            .is_ok()
        {
            *x.written = true;
        }
    }
    (status, None)
}

enum StreamEvent {
    ClientGone,
    FirstTokenTimeout,
    Item(Option<Result<String, SseReadError>>),
}

async fn forward_stream(
    x: AttemptExchange<'_>,
    response: reqwest::Response,
    status: u16,
) -> (u16, Option<RelayError>) {
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !content_type.is_empty() && !content_type.contains("text/event-stream") {
        let body = read_limited(response, ERROR_BODY_LIMIT).await;
        let err = std::io::Error::other(format!(
            "upstream returned non-SSE content-type {content_type:?} for stream request: {body}"
        ));
        return (status, Some(RelayError::from_transport(err)));
    }

    // Producer reads upstream SSE frames into a bounded channel so the
    // main loop can race the first frame against the first-token timer.
    let (item_tx, mut item_rx) = mpsc::channel::<Result<String, SseReadError>>(1);
    let mut events = sse_data_stream_from_response(response, x.state.max_sse_event_bytes);
    let producer = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            if item_tx.send(item).await.is_err() {
                return;
            }
        }
    });

    let timeout_secs = x.first_token_timeout_secs;
    let mut deadline = Box::pin(tokio::time::sleep(Duration::from_secs(timeout_secs.max(1))));
    let mut armed = timeout_secs > 0;

    let mut head = x.head.take();
    let mut body: Option<mpsc::Sender<Result<Bytes, std::io::Error>>> = None;

    loop {
        let event = if let Some(tx) = head.as_mut() {
            tokio::select! {
                _ = tx.closed() => StreamEvent::ClientGone,
                _ = &mut deadline, if armed => StreamEvent::FirstTokenTimeout,
                item = item_rx.recv() => StreamEvent::Item(item),
            }
        } else if let Some(tx) = body.as_ref() {
            tokio::select! {
                _ = tx.closed() => StreamEvent::ClientGone,
                item = item_rx.recv() => StreamEvent::Item(item),
            }
        } else {
            StreamEvent::Item(item_rx.recv().await)
        };

        match event {
            StreamEvent::ClientGone => {
                // A disconnected client is not an upstream failure.
                tracing::info!(channel = %x.channel.name, "client disconnected, stopping stream");
                producer.abort();
                return (status, None);
            }
            StreamEvent::FirstTokenTimeout => {
                tracing::warn!(
                    channel = %x.channel.name,
                    timeout_secs,
                    "first token timeout, switching channel"
                );
                producer.abort();
                let err = std::io::Error::other(format!("first token timeout ({timeout_secs}s)"));
                return (status, Some(RelayError::from_transport(err)));
            }
            StreamEvent::Item(None) => {
                tracing::debug!(channel = %x.channel.name, "stream end");
                return (status, None);
            }
            StreamEvent::Item(Some(Err(err))) => {
                // Classification is unchanged by the commit state; the
                // driver's stream-written guard stops any retry.
                tracing::warn!(channel = %x.channel.name, error = %err, "failed to read stream event");
                return (status, Some(RelayError::from_transport(err)));
            }
            StreamEvent::Item(Some(Ok(data))) => {
                let Some(frame) = transform_frame(x.inbound, x.outbound, x.metrics, &data) else {
                    continue;
                };

                if body.is_none() {
                    x.metrics.mark_first_token();
                    armed = false;
                    let (body_tx, body_rx) = mpsc::channel(STREAM_BODY_CHANNEL_CAPACITY);
                    let Some(head) = head.take() else {
                        producer.abort();
                        return (status, None);
                    };
                    if head
                        .send(ResponseHead {
                            status: 200,
                            retry_after: None,
                            body: HeadBody::Stream(body_rx),
                        })
                        .is_err()
                    {
                        producer.abort();
                        return (status, None);
                    }
                    body = Some(body_tx);
                    *x.written = true;
                }

                let Some(tx) = body.as_ref() else {
                    producer.abort();
                    return (status, None);
                };
                if tx.send(Ok(frame)).await.is_err() {
                    producer.abort();
                    return (status, None);
                }
            }
        }
    }
}

/// Upstream frame → internal → client dialect. Frames that fail either
/// transform, or transform to nothing, are dropped.
fn transform_frame(
    inbound: &dyn Inbound,
    outbound: &dyn Outbound,
    metrics: &mut RelayMetrics,
    data: &str,
) -> Option<Bytes> {
    let chunk = match outbound.transform_stream(data) {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(error = %err, "failed to transform stream frame");
            return None;
        }
    };
    if let InternalChunk::Data {
        usage: Some(usage), ..
    } = &chunk
    {
        // Usage arrives on the final delta; later frames win.
        metrics.set_usage(*usage);
    }
    match inbound.transform_stream(&chunk) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode stream frame");
            None
        }
    }
}

fn fatal_at(status: u16, err: RelayError) -> RelayError {
    RelayError {
        status_code: status,
        source: RelayErrorSource::Local,
        retryable: false,
        trippable: false,
        message: err.message.clone(),
        cause: Some(Box::new(err)),
    }
}

async fn read_limited(response: reqwest::Response, limit: usize) -> String {
    let mut out: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let remaining = limit.saturating_sub(out.len());
        out.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if out.len() >= limit {
            break;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Headers that must not travel upstream: hop-by-hop, caller identity and
/// proxy-added addressing. The outbound adapter owns authentication.
const BLOCKED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "host",
    "accept-encoding",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
    "forwarded",
    "cf-connecting-ip",
    "true-client-ip",
    "x-client-ip",
    "x-cluster-client-ip",
];

fn copy_headers(target: &mut HeaderMap, client_headers: &HeaderMap, channel: &Channel) {
    for (name, value) in client_headers {
        if BLOCKED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        target.insert(name.clone(), value.clone());
    }
    for (name, value) in &channel.custom_headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        target.insert(name, value);
    }
}
