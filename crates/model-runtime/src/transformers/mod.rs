//! Vendor dialects: request bodies, event transformers, and the shared
//! finish logic every dialect funnels through.

pub mod ollama;
pub mod openai;
pub mod responses;
pub mod think;

use serde_json::Value;

use crate::context::StreamContext;
use crate::errors::AgentRuntimeError;
use crate::model::{ModelCard, ProviderId};
use crate::payload::ChatStreamPayload;
use crate::protocol::{ChunkData, ProtocolChunk, Usage};

use think::{flush_pending, split_inline_reasoning};

/// Wire dialect spoken by a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions`.
    #[serde(rename = "openai")]
    OpenAi,
    /// OpenAI Responses API event stream.
    #[serde(rename = "openai_responses")]
    OpenAiResponses,
    /// Ollama `/api/chat`, newline-delimited JSON.
    Ollama,
}

/// How the response body is cut into vendor events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Ndjson,
}

/// Request-time switches applied while building a dialect body.
#[derive(Clone, Debug, Default)]
pub struct BodyOptions {
    /// Ask the vendor to append token usage to the stream.
    pub include_usage: bool,
    pub user: Option<String>,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenAiResponses => "openai_responses",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiResponses => "https://api.openai.com/v1",
            Self::Ollama => "http://127.0.0.1:11434",
        }
    }

    /// Whether requests carry an API key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }

    pub fn chat_path(&self) -> &'static str {
        match self {
            Self::OpenAi => "/chat/completions",
            Self::OpenAiResponses => "/responses",
            Self::Ollama => "/api/chat",
        }
    }

    pub fn models_path(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiResponses => "/models",
            Self::Ollama => "/api/tags",
        }
    }

    /// Image generation endpoint, if the dialect has one.
    pub fn images_path(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi | Self::OpenAiResponses => Some("/images/generations"),
            Self::Ollama => None,
        }
    }

    pub fn framing(&self) -> Framing {
        match self {
            Self::OpenAi | Self::OpenAiResponses => Framing::Sse,
            Self::Ollama => Framing::Ndjson,
        }
    }

    pub fn build_body(
        &self,
        provider: &ProviderId,
        payload: &ChatStreamPayload,
        options: &BodyOptions,
    ) -> Result<Value, AgentRuntimeError> {
        match self {
            Self::OpenAi => openai::build_body(provider, payload, options),
            Self::OpenAiResponses => responses::build_body(provider, payload, options),
            Self::Ollama => ollama::build_body(provider, payload),
        }
    }

    /// Turns one vendor event into canonical chunks, mutating `ctx`.
    pub fn transform(
        &self,
        event: &Value,
        ctx: &mut StreamContext,
        provider: &ProviderId,
    ) -> Vec<ProtocolChunk> {
        match self {
            Self::OpenAi => openai::transform(event, ctx, provider),
            Self::OpenAiResponses => responses::transform(event, ctx, provider),
            Self::Ollama => ollama::transform(event, ctx, provider),
        }
    }

    /// Rewrites a whole non-streaming response body as the event sequence the
    /// streaming endpoint would have produced.
    pub fn synthesize_events(&self, body: &Value) -> Vec<Value> {
        match self {
            Self::OpenAi => openai::synthesize_events(body),
            Self::OpenAiResponses => responses::synthesize_events(body),
            Self::Ollama => vec![body.clone()],
        }
    }

    pub fn parse_models(&self, body: &Value) -> Vec<ModelCard> {
        match self {
            Self::OpenAi | Self::OpenAiResponses => openai::parse_models(body),
            Self::Ollama => ollama::parse_models(body),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai_chat" => Ok(Self::OpenAi),
            "openai_responses" | "responses" => Ok(Self::OpenAiResponses),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

/// Content text through the inline reasoning splitter.
pub(crate) fn content_chunks(ctx: &mut StreamContext, content: &str) -> Vec<ProtocolChunk> {
    if content.is_empty() {
        return Vec::new();
    }
    split_inline_reasoning(ctx, content)
        .into_iter()
        .map(|segment| segment.into_chunk(&ctx.id))
        .collect()
}

/// Finish handling shared by every dialect: flush the lookback, complete the
/// tool calls, then usage, then `stop`.
///
/// An incomplete tool call replaces the `stop` with a terminal error.
pub(crate) fn finish(
    ctx: &mut StreamContext,
    provider: &ProviderId,
    usage: Option<Usage>,
    reason: &str,
) -> Vec<ProtocolChunk> {
    let mut chunks = Vec::new();
    if let Some(segment) = flush_pending(ctx) {
        chunks.push(segment.into_chunk(&ctx.id));
    }
    ctx.finish_reason = Some(reason.to_string());

    if let Err(err) = ctx.tool_calls.complete() {
        let error = AgentRuntimeError::biz(provider.clone(), err.to_string())
            .with_body(Value::String(err.arguments.clone()));
        chunks.push(ProtocolChunk::error(&ctx.id, error));
        return chunks;
    }
    if let Some(usage) = usage {
        chunks.push(ProtocolChunk::new(&ctx.id, ChunkData::Usage(usage)));
    }
    chunks.push(ProtocolChunk::stop(&ctx.id, reason));
    chunks
}

/// Called once the byte stream is exhausted.
///
/// A stream that never carried a finish signal still ends with `stop`.
pub fn end_of_input(ctx: &mut StreamContext, provider: &ProviderId) -> Vec<ProtocolChunk> {
    if ctx.is_finished() {
        return flush_pending(ctx)
            .map(|segment| vec![segment.into_chunk(&ctx.id)])
            .unwrap_or_default();
    }
    finish(ctx, provider, None, "stop")
}

/// Fail-open rendering of an event the dialect does not recognize.
pub(crate) fn raw_text_chunk(ctx: &StreamContext, event: &Value) -> ProtocolChunk {
    let text = event
        .get("content")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| event.to_string());
    ProtocolChunk::text(&ctx.id, text)
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub(crate) fn u64_field(value: &Value, path: &[&str]) -> Option<u64> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_u64)
}
