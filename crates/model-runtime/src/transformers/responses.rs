//! OpenAI Responses API dialect (`response.*` events).

use serde_json::{Value, json};

use crate::context::StreamContext;
use crate::errors::AgentRuntimeError;
use crate::model::ProviderId;
use crate::normalize::normalize_stream_error;
use crate::payload::{ChatStreamPayload, Role};
use crate::protocol::{ChunkData, ProtocolChunk, Usage};

use super::{BodyOptions, content_chunks, finish, raw_text_chunk, str_field, u64_field};

pub(crate) fn build_body(
    _provider: &ProviderId,
    payload: &ChatStreamPayload,
    options: &BodyOptions,
) -> Result<Value, AgentRuntimeError> {
    let mut input = Vec::with_capacity(payload.messages.len());
    for message in &payload.messages {
        match message.role {
            Role::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.content,
            })),
            _ => {
                if !message.content.is_empty() || message.tool_calls.is_empty() {
                    input.push(json!({ "role": message.role, "content": message.content }));
                }
                for call in &message.tool_calls {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }));
                }
            }
        }
    }

    let mut body = json!({
        "model": payload.model,
        "input": input,
        "stream": payload.stream,
        "store": false,
    });
    if let Some(temperature) = payload.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = payload.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = payload.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }
    if !payload.tools.is_empty() {
        body["tools"] = payload
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect();
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
    let Some(event_type) = str_field(event, "type") else {
        return vec![raw_text_chunk(ctx, event)];
    };
    match event_type {
        "response.output_text.delta" => str_field(event, "delta")
            .map(|delta| content_chunks(ctx, delta))
            .unwrap_or_default(),
        "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
            str_field(event, "delta")
                .filter(|delta| !delta.is_empty())
                .map(|delta| vec![ProtocolChunk::reasoning(&ctx.id, delta)])
                .unwrap_or_default()
        }
        "response.output_item.added" => {
            let item = event.get("item").unwrap_or(&Value::Null);
            if str_field(item, "type") != Some("function_call") {
                return Vec::new();
            }
            let next = u32::try_from(ctx.tool_calls.len()).unwrap_or(u32::MAX);
            let delta = ctx.tool_calls.push(
                output_index(event).unwrap_or(next),
                str_field(item, "call_id"),
                str_field(item, "name"),
                str_field(item, "arguments").unwrap_or_default(),
            );
            vec![ProtocolChunk::new(&ctx.id, ChunkData::ToolCalls(vec![delta]))]
        }
        "response.function_call_arguments.delta" => {
            let fragment = str_field(event, "delta").unwrap_or_default();
            let latest = u32::try_from(ctx.tool_calls.len().saturating_sub(1)).unwrap_or(u32::MAX);
            let delta = ctx
                .tool_calls
                .push(output_index(event).unwrap_or(latest), None, None, fragment);
            vec![ProtocolChunk::new(&ctx.id, ChunkData::ToolCalls(vec![delta]))]
        }
        "response.completed" | "response.incomplete" => {
            let response = event.get("response").unwrap_or(event);
            let usage = response
                .get("usage")
                .filter(|u| u.is_object())
                .map(convert_usage);
            let reason = finish_reason(event_type, response, ctx);
            finish(ctx, provider, usage, &reason)
        }
        "response.failed" | "response.error" | "error" => {
            let detail = if event.get("error").is_some_and(|e| !e.is_null()) || event_type == "error" {
                event
            } else {
                event.get("response").unwrap_or(event)
            };
            vec![ProtocolChunk::error(
                &ctx.id,
                normalize_stream_error(provider, detail),
            )]
        }
        other if other.starts_with("response.") => Vec::new(),
        _ => vec![raw_text_chunk(ctx, event)],
    }
}

/// `None` when absent or out of `u32` range.
fn output_index(event: &Value) -> Option<u32> {
    event
        .get("output_index")
        .and_then(Value::as_u64)
        .and_then(|i| u32::try_from(i).ok())
}

fn finish_reason(event_type: &str, response: &Value, ctx: &StreamContext) -> String {
    if event_type == "response.incomplete" {
        return response
            .get("incomplete_details")
            .and_then(|d| str_field(d, "reason"))
            .unwrap_or("length")
            .to_string();
    }
    if !ctx.tool_calls.is_empty() {
        return "tool_calls".to_string();
    }
    "stop".to_string()
}

/// Responses `usage` (`input_tokens` / `output_tokens`) in the canonical shape.
pub fn convert_usage(usage: &Value) -> Usage {
    let prompt_tokens = u64_field(usage, &["input_tokens"]).unwrap_or_default();
    let completion_tokens = u64_field(usage, &["output_tokens"]).unwrap_or_default();
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: u64_field(usage, &["total_tokens"])
            .unwrap_or(prompt_tokens + completion_tokens),
        reasoning_tokens: u64_field(usage, &["output_tokens_details", "reasoning_tokens"]),
        cached_tokens: u64_field(usage, &["input_tokens_details", "cached_tokens"]),
    }
}

/// Replays a whole `response` object as deltas followed by
/// `response.completed`.
pub(crate) fn synthesize_events(body: &Value) -> Vec<Value> {
    if body.get("error").is_some_and(|e| !e.is_null()) {
        return vec![json!({ "type": "response.failed", "response": body })];
    }
    let mut events = Vec::new();
    let items = body
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (index, item) in items.iter().enumerate() {
        match str_field(item, "type") {
            Some("reasoning") => {
                for summary in item.get("summary").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(text) = str_field(summary, "text") {
                        events.push(json!({"type": "response.reasoning_summary_text.delta", "delta": text}));
                    }
                }
            }
            Some("function_call") => events.push(json!({
                "type": "response.output_item.added",
                "output_index": index,
                "item": item,
            })),
            _ => {}
        }
    }
    if let Some(text) = extract_output_text(body) {
        events.push(json!({"type": "response.output_text.delta", "delta": text}));
    }
    let completed = match str_field(body, "status") {
        Some("incomplete") => "response.incomplete",
        _ => "response.completed",
    };
    events.push(json!({ "type": completed, "response": body }));
    events
}

/// Concatenated text of every `message` output item, else `output_text`.
pub(crate) fn extract_output_text(response: &Value) -> Option<String> {
    let mut parts = Vec::new();
    for item in response.get("output").and_then(Value::as_array).into_iter().flatten() {
        if str_field(item, "type") != Some("message") {
            continue;
        }
        for content in item.get("content").and_then(Value::as_array).into_iter().flatten() {
            if let Some(text) = str_field(content, "text") {
                parts.push(text.to_string());
            }
        }
    }
    if !parts.is_empty() {
        return Some(parts.join(""));
    }
    str_field(response, "output_text").map(ToOwned::to_owned)
}
