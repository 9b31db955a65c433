//! Ollama `/api/chat` dialect.

use serde_json::{Map, Value, json};

use crate::context::StreamContext;
use crate::errors::AgentRuntimeError;
use crate::model::{ModelCard, ProviderId};
use crate::normalize::normalize_stream_error;
use crate::payload::ChatStreamPayload;
use crate::protocol::{ChunkData, ProtocolChunk, Usage};

use super::{content_chunks, finish, raw_text_chunk, str_field, u64_field};

pub(crate) fn build_body(
    _provider: &ProviderId,
    payload: &ChatStreamPayload,
) -> Result<Value, AgentRuntimeError> {
    let messages: Vec<Value> = payload
        .messages
        .iter()
        .map(|message| {
            let mut entry = json!({ "role": message.role, "content": message.content });
            if !message.tool_calls.is_empty() {
                entry["tool_calls"] = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "function": {
                                "name": call.function.name,
                                "arguments": call.arguments_json().unwrap_or_else(|_| json!({})),
                            }
                        })
                    })
                    .collect();
            }
            entry
        })
        .collect();

    let mut options = Map::new();
    if let Some(temperature) = payload.temperature {
        options.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = payload.top_p {
        options.insert("top_p".into(), json!(top_p));
    }
    if let Some(max_tokens) = payload.max_tokens {
        options.insert("num_predict".into(), json!(max_tokens));
    }
    if let Some(penalty) = payload.frequency_penalty {
        options.insert("frequency_penalty".into(), json!(penalty));
    }
    if let Some(penalty) = payload.presence_penalty {
        options.insert("presence_penalty".into(), json!(penalty));
    }

    let mut body = json!({
        "model": payload.model,
        "messages": messages,
        "stream": payload.stream,
    });
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    if !payload.tools.is_empty() {
        body["tools"] = serde_json::to_value(&payload.tools).unwrap_or(Value::Null);
    }
    Ok(body)
}

pub(crate) fn transform(
    event: &Value,
    ctx: &mut StreamContext,
    provider: &ProviderId,
) -> Vec<ProtocolChunk> {
    if event.get("error").is_some_and(|e| !e.is_null()) {
        return vec![ProtocolChunk::error(
            &ctx.id,
            normalize_stream_error(provider, event),
        )];
    }

    let message = event.get("message").filter(|m| m.is_object());
    let done = event.get("done").and_then(Value::as_bool).unwrap_or(false);
    if message.is_none() && !done {
        return vec![raw_text_chunk(ctx, event)];
    }

    let mut chunks = Vec::new();
    if let Some(message) = message {
        if let Some(thinking) = str_field(message, "thinking").filter(|t| !t.is_empty()) {
            chunks.push(ProtocolChunk::reasoning(&ctx.id, thinking));
        }

        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            // Ollama sends whole calls without an index; continue after the
            // calls already seen on this stream.
            let base = ctx.tool_calls.len();
            let deltas: Vec<_> = calls
                .iter()
                .enumerate()
                .map(|(position, call)| {
                    let function = call.get("function");
                    let arguments = match function.and_then(|f| f.get("arguments")) {
                        Some(Value::String(text)) => text.clone(),
                        Some(value) if !value.is_null() => value.to_string(),
                        _ => String::new(),
                    };
                    ctx.tool_calls.push(
                        u32::try_from(base + position).unwrap_or(u32::MAX),
                        str_field(call, "id"),
                        function.and_then(|f| str_field(f, "name")),
                        &arguments,
                    )
                })
                .collect();
            if !deltas.is_empty() {
                chunks.push(ProtocolChunk::new(&ctx.id, ChunkData::ToolCalls(deltas)));
            }
        }

        if let Some(content) = str_field(message, "content") {
            chunks.extend(content_chunks(ctx, content));
        }
    }

    if done {
        let reason = str_field(event, "done_reason").unwrap_or("stop").to_string();
        chunks.extend(finish(ctx, provider, convert_usage(event), &reason));
    }
    chunks
}

/// `prompt_eval_count` / `eval_count` of the final event.
pub fn convert_usage(event: &Value) -> Option<Usage> {
    let prompt_tokens = u64_field(event, &["prompt_eval_count"]);
    let completion_tokens = u64_field(event, &["eval_count"]);
    if prompt_tokens.is_none() && completion_tokens.is_none() {
        return None;
    }
    let prompt_tokens = prompt_tokens.unwrap_or_default();
    let completion_tokens = completion_tokens.unwrap_or_default();
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        reasoning_tokens: None,
        cached_tokens: None,
    })
}

/// `GET /api/tags` listing.
pub(crate) fn parse_models(body: &Value) -> Vec<ModelCard> {
    body.get("models")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let id = str_field(entry, "name").or_else(|| str_field(entry, "model"))?;
            let mut card = ModelCard::new(id);
            card.released_at = str_field(entry, "modified_at")
                .and_then(|stamp| stamp.get(..10))
                .map(ToOwned::to_owned);
            Some(card)
        })
        .collect()
}
