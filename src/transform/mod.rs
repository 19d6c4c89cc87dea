//! Dialect transformer contracts.
//!
//! Two adapter families sit at the relay's edges: *inbound* adapters map
//! between the caller's dialect and the internal representation, *outbound*
//! adapters map between the internal representation and an upstream
//! channel's native API. The relay core is dialect-agnostic; it only moves
//! internal values between the two.

pub mod openai;

use bytes::Bytes;
use serde_json::Value;

use crate::error::RelayError;
use crate::model::ChannelType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Embedding,
}

/// Inbound surface a request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundKind {
    OpenAiChat,
    OpenAiEmbeddings,
}

/// Dialect-neutral request. `payload` is the parsed body; `model` is the
/// logical model the client asked for until the driver rewrites it to the
/// selected upstream model.
#[derive(Clone, Debug)]
pub struct InternalRequest {
    pub model: String,
    pub stream: bool,
    pub kind: RequestKind,
    pub payload: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Clone, Debug)]
pub struct InternalResponse {
    pub payload: Value,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// One streamed unit in internal form.
#[derive(Clone, Debug)]
pub enum InternalChunk {
    Data {
        payload: Value,
        usage: Option<Usage>,
    },
    /// Upstream signalled end of stream.
    Done,
}

/// Client dialect ↔ internal.
pub trait Inbound: Send + Sync {
    fn kind(&self) -> RequestKind;

    fn transform_request(&self, body: &[u8]) -> Result<InternalRequest, RelayError>;

    fn transform_response(&self, response: &InternalResponse) -> Result<Vec<u8>, RelayError>;

    /// Encode one internal chunk as client-dialect SSE bytes. None drops
    /// the chunk.
    fn transform_stream(&self, chunk: &InternalChunk) -> Result<Option<Bytes>, RelayError>;
}

/// Internal ↔ upstream channel dialect.
pub trait Outbound: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    fn transform_request(
        &self,
        client: &reqwest::Client,
        request: &InternalRequest,
        base_url: &str,
        secret: &str,
    ) -> Result<reqwest::Request, RelayError>;

    fn transform_response(&self, body: &[u8]) -> Result<InternalResponse, RelayError>;

    /// Decode one upstream SSE data frame. None drops the frame.
    fn transform_stream(&self, data: &str) -> Result<Option<InternalChunk>, RelayError>;
}

pub fn inbound(kind: InboundKind) -> &'static dyn Inbound {
    match kind {
        InboundKind::OpenAiChat => &openai::OpenAiChatInbound,
        InboundKind::OpenAiEmbeddings => &openai::OpenAiEmbeddingsInbound,
    }
}

/// Outbound adapter for a channel type, if one is registered.
pub fn outbound(channel_type: ChannelType) -> Option<&'static dyn Outbound> {
    match channel_type {
        ChannelType::OpenAi => Some(&openai::OpenAiOutbound),
        ChannelType::Anthropic | ChannelType::Gemini => None,
    }
}
