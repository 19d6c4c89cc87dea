//! OpenAI-dialect adapters. The internal representation is close to this
//! dialect, so both directions are passthrough with model rewriting and
//! usage extraction.

use bytes::Bytes;
use serde_json::Value;

use crate::error::RelayError;
use crate::model::ChannelType;

use super::{InternalChunk, InternalRequest, InternalResponse, RequestKind, Usage};

const DONE_MARKER: &str = "[DONE]";

pub struct OpenAiChatInbound;

impl super::Inbound for OpenAiChatInbound {
    fn kind(&self) -> RequestKind {
        RequestKind::Chat
    }

    fn transform_request(&self, body: &[u8]) -> Result<InternalRequest, RelayError> {
        let payload = parse_body(body)?;
        let model = required_model(&payload)?;
        if !payload
            .get("messages")
            .map(|messages| messages.is_array())
            .unwrap_or(false)
        {
            return Err(RelayError::local_fatal(400, "messages must be an array"));
        }
        let stream = payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(InternalRequest {
            model,
            stream,
            kind: RequestKind::Chat,
            payload,
        })
    }

    fn transform_response(&self, response: &InternalResponse) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(&response.payload)
            .map_err(|err| RelayError::local_fatal(500, format!("failed to encode response: {err}")))
    }

    fn transform_stream(&self, chunk: &InternalChunk) -> Result<Option<Bytes>, RelayError> {
        encode_sse_chunk(chunk)
    }
}

pub struct OpenAiEmbeddingsInbound;

impl super::Inbound for OpenAiEmbeddingsInbound {
    fn kind(&self) -> RequestKind {
        RequestKind::Embedding
    }

    fn transform_request(&self, body: &[u8]) -> Result<InternalRequest, RelayError> {
        let payload = parse_body(body)?;
        let model = required_model(&payload)?;
        if payload.get("input").is_none() {
            return Err(RelayError::local_fatal(400, "input is required"));
        }
        Ok(InternalRequest {
            model,
            stream: false,
            kind: RequestKind::Embedding,
            payload,
        })
    }

    fn transform_response(&self, response: &InternalResponse) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(&response.payload)
            .map_err(|err| RelayError::local_fatal(500, format!("failed to encode response: {err}")))
    }

    fn transform_stream(&self, chunk: &InternalChunk) -> Result<Option<Bytes>, RelayError> {
        encode_sse_chunk(chunk)
    }
}

pub struct OpenAiOutbound;

impl super::Outbound for OpenAiOutbound {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenAi
    }

    fn transform_request(
        &self,
        client: &reqwest::Client,
        request: &InternalRequest,
        base_url: &str,
        secret: &str,
    ) -> Result<reqwest::Request, RelayError> {
        let path = match request.kind {
            RequestKind::Chat => "chat/completions",
            RequestKind::Embedding => "embeddings",
        };
        let url = format!("{}/{path}", base_url.trim_end_matches('/'));

        let mut payload = request.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("model".to_string(), Value::String(request.model.clone()));
        }

        client
            .post(&url)
            .bearer_auth(secret)
            .json(&payload)
            .build()
            .map_err(|err| {
                RelayError::local_fatal(400, format!("failed to create request: {err}"))
            })
    }

    fn transform_response(&self, body: &[u8]) -> Result<InternalResponse, RelayError> {
        let payload: Value = serde_json::from_slice(body).map_err(|err| {
            RelayError::new(
                0,
                crate::error::RelayErrorSource::Network,
                true,
                true,
                format!("failed to decode upstream response: {err}"),
            )
        })?;
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = extract_usage(&payload);
        Ok(InternalResponse {
            payload,
            model,
            usage,
        })
    }

    fn transform_stream(&self, data: &str) -> Result<Option<InternalChunk>, RelayError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == DONE_MARKER {
            return Ok(Some(InternalChunk::Done));
        }
        // Frames that do not parse are dropped rather than failing the
        // stream; upstreams occasionally interleave comments or partial
        // keep-alives.
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            return Ok(None);
        };
        let usage = extract_usage(&payload);
        Ok(Some(InternalChunk::Data { payload, usage }))
    }
}

fn parse_body(body: &[u8]) -> Result<Value, RelayError> {
    serde_json::from_slice(body)
        .map_err(|err| RelayError::local_fatal(400, format!("invalid request body: {err}")))
}

fn required_model(payload: &Value) -> Result<String, RelayError> {
    payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RelayError::local_fatal(400, "model is required"))
}

fn extract_usage(payload: &Value) -> Option<Usage> {
    let usage = payload.get("usage")?;
    if usage.is_null() {
        return None;
    }
    Some(Usage {
        prompt_tokens: usage
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

fn encode_sse_chunk(chunk: &InternalChunk) -> Result<Option<Bytes>, RelayError> {
    match chunk {
        InternalChunk::Data { payload, .. } => {
            let encoded = serde_json::to_string(payload).map_err(|err| {
                RelayError::local_fatal(500, format!("failed to encode stream chunk: {err}"))
            })?;
            Ok(Some(Bytes::from(format!("data: {encoded}\n\n"))))
        }
        InternalChunk::Done => Ok(Some(Bytes::from_static(b"data: [DONE]\n\n"))),
    }
}
