//! OpenAI-compatible chat completions dialect.

use serde_json::{Value, json};
use tracing::debug;

use crate::context::StreamContext;
use crate::errors::AgentRuntimeError;
use crate::model::{ModelCard, ProviderId};
use crate::normalize::normalize_stream_error;
use crate::payload::ChatStreamPayload;
use crate::protocol::{ChunkData, ProtocolChunk, Usage};

use super::{BodyOptions, content_chunks, finish, raw_text_chunk, str_field, u64_field};

/// Model id fragments that never denote a chat model.
pub const CHAT_MODELS_BLOCK_LIST: &[&str] = &[
    "embedding",
    "davinci",
    "curie",
    "moderation",
    "ada",
    "babbage",
    "tts",
    "whisper",
    "dall-e",
];

pub(crate) fn build_body(
    provider: &ProviderId,
    payload: &ChatStreamPayload,
    options: &BodyOptions,
) -> Result<Value, AgentRuntimeError> {
    let mut body = serde_json::to_value(payload)
        .map_err(|e| AgentRuntimeError::biz(provider.clone(), format!("invalid payload: {e}")))?;
    if payload.stream && options.include_usage {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if let Some(user) = &options.user {
        body["user"] = json!(user);
    }
    Ok(body)
}

pub(crate) fn transform(
    event: &Value,
    ctx: &mut StreamContext,
    provider: &ProviderId,
) -> Vec<ProtocolChunk> {
    if event.get("error").is_some_and(|e| !e.is_null()) || vendor_status_error(event) {
        return vec![ProtocolChunk::error(
            &ctx.id,
            normalize_stream_error(provider, event),
        )];
    }

    let Some(choices) = event.get("choices").and_then(Value::as_array) else {
        if let Some(usage) = event.get("usage").filter(|u| u.is_object()) {
            return vec![usage_chunk(ctx, usage)];
        }
        return vec![raw_text_chunk(ctx, event)];
    };

    let Some(choice) = choices.first() else {
        // `choices: []` is the trailer that carries usage when it was requested.
        return match event.get("usage").filter(|u| u.is_object()) {
            Some(usage) => vec![usage_chunk(ctx, usage)],
            None => {
                debug!(stream_id = %ctx.id, "empty choices without usage");
                Vec::new()
            }
        };
    };

    // Some compatible vendors send `"finish_reason": ""` on every chunk.
    let finish_reason = str_field(choice, "finish_reason").filter(|r| !r.is_empty());
    let usage = event.get("usage").filter(|u| u.is_object());

    let Some(delta) = choice
        .get("delta")
        .or_else(|| choice.get("message"))
        .filter(|d| d.is_object())
    else {
        if let Some(reason) = finish_reason {
            return finish(ctx, provider, usage.map(convert_usage), reason);
        }
        return vec![raw_text_chunk(ctx, event)];
    };

    let mut chunks = Vec::new();
    let (content, block_reasoning) = match delta.get("content") {
        Some(Value::String(text)) => (Some(text.clone()), None),
        Some(Value::Array(blocks)) => match content_blocks(blocks) {
            Some((text, reasoning)) => (Some(text), Some(reasoning)),
            None => {
                chunks.push(raw_text_chunk(ctx, delta));
                (None, None)
            }
        },
        _ => (None, None),
    };

    let reasoning = str_field(delta, "reasoning_content")
        .or_else(|| str_field(delta, "reasoning"))
        .map(ToOwned::to_owned)
        .or(block_reasoning);
    if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
        chunks.push(ProtocolChunk::reasoning(&ctx.id, reasoning));
    }

    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        let deltas: Vec<_> = calls
            .iter()
            .enumerate()
            .map(|(position, call)| {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|i| u32::try_from(i).ok())
                    .or_else(|| u32::try_from(position).ok())
                    .unwrap_or_default();
                let function = call.get("function");
                ctx.tool_calls.push(
                    index,
                    str_field(call, "id"),
                    function.and_then(|f| str_field(f, "name")),
                    function
                        .and_then(|f| str_field(f, "arguments"))
                        .unwrap_or_default(),
                )
            })
            .collect();
        if !deltas.is_empty() {
            chunks.push(ProtocolChunk::new(&ctx.id, ChunkData::ToolCalls(deltas)));
        }
    }

    // A `role: "tool"` delta on the finish chunk echoes built-in search
    // results (MiniMax); it is not assistant output.
    let tool_echo = finish_reason.is_some() && str_field(delta, "role") == Some("tool");
    match content.as_deref() {
        Some(text) if !text.is_empty() && !tool_echo => chunks.extend(content_chunks(ctx, text)),
        _ => {
            if finish_reason.is_none()
                && let Some(usage) = usage
            {
                chunks.insert(0, usage_chunk(ctx, usage));
            }
        }
    }

    if let Some(reason) = finish_reason {
        chunks.extend(finish(ctx, provider, usage.map(convert_usage), reason));
    }
    chunks
}

/// `content` given as typed blocks: `text` blocks and the text items of
/// `thinking` blocks, as `(text, reasoning)`. `None` when no block is known.
fn content_blocks(blocks: &[Value]) -> Option<(String, String)> {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut known = false;
    for block in blocks {
        match str_field(block, "type") {
            Some("text") => {
                known = true;
                text.push_str(str_field(block, "text").unwrap_or_default());
            }
            Some("thinking") => {
                known = true;
                let items = block.get("thinking").and_then(Value::as_array).into_iter().flatten();
                for item in items.filter(|item| str_field(item, "type") == Some("text")) {
                    reasoning.push_str(str_field(item, "text").unwrap_or_default());
                }
            }
            _ => {}
        }
    }
    known.then_some((text, reasoning))
}

/// MiniMax reports failures in `base_resp` with a non-zero `status_code`.
fn vendor_status_error(event: &Value) -> bool {
    event
        .get("base_resp")
        .and_then(|b| b.get("status_code"))
        .and_then(Value::as_i64)
        .is_some_and(|code| code != 0)
}

fn usage_chunk(ctx: &StreamContext, usage: &Value) -> ProtocolChunk {
    ProtocolChunk::new(&ctx.id, ChunkData::Usage(convert_usage(usage)))
}

/// `usage` object of a chat completion in the canonical shape.
pub fn convert_usage(usage: &Value) -> Usage {
    let prompt_tokens = u64_field(usage, &["prompt_tokens"]).unwrap_or_default();
    let completion_tokens = u64_field(usage, &["completion_tokens"]).unwrap_or_default();
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: u64_field(usage, &["total_tokens"])
            .unwrap_or(prompt_tokens + completion_tokens),
        reasoning_tokens: u64_field(usage, &["completion_tokens_details", "reasoning_tokens"]),
        cached_tokens: u64_field(usage, &["prompt_tokens_details", "cached_tokens"]),
    }
}

/// A non-streaming completion as one delta event carrying the whole message.
pub(crate) fn synthesize_events(body: &Value) -> Vec<Value> {
    if body.get("error").is_some_and(|e| !e.is_null()) {
        return vec![body.clone()];
    }
    let choices = body
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .take(1)
                .map(|choice| {
                    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
                    json!({
                        "index": 0,
                        "delta": message,
                        "finish_reason": choice.get("finish_reason").cloned().unwrap_or_else(|| json!("stop")),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut event = json!({ "id": body.get("id").cloned().unwrap_or(Value::Null), "choices": choices });
    if let Some(usage) = body.get("usage") {
        event["usage"] = usage.clone();
    }
    vec![event]
}

/// `GET /models` list, without models that cannot chat.
pub(crate) fn parse_models(body: &Value) -> Vec<ModelCard> {
    body.get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let id = str_field(entry, "id")?;
            if CHAT_MODELS_BLOCK_LIST.iter().any(|blocked| id.contains(blocked)) {
                return None;
            }
            let mut card = ModelCard::new(id);
            card.owned_by = str_field(entry, "owned_by").map(ToOwned::to_owned);
            Some(card)
        })
        .collect()
}
