//! Canonical chunk vocabulary shared by every provider dialect, and its
//! outward SSE line form.

use bytes::Bytes;
use futures::{Stream, StreamExt as _, stream};

use crate::errors::AgentRuntimeError;

/// Terminator frame written after the last chunk of a successful stream.
pub const SSE_DONE_FRAME: &str = "data: [DONE]\n\n";

/// Function part of a tool-call delta. `name` is only present on the first
/// fragment of a call.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FunctionDelta {
    pub name: Option<String>,
    /// Argument fragment carried by this delta (not the merged whole).
    pub arguments: String,
}

/// One tool-call fragment as carried by a `tool_calls` chunk.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDelta,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Complete JSON argument string.
    pub arguments: String,
}

/// Completed tool call.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    /// Parses the argument string.
    pub fn arguments_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.function.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.function.arguments)
    }
}

/// Token accounting in the canonical shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
}

/// Typed payload of a chunk; serialized as `"type"` + `"data"`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChunkData {
    Text(String),
    Reasoning(String),
    ToolCalls(Vec<ToolCallDelta>),
    /// Finish reason reported by the vendor.
    Stop(String),
    /// Terminal failure.
    Error(AgentRuntimeError),
    Usage(Usage),
}

/// One normalized event of the canonical stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolChunk {
    /// Stream id, identical for every chunk of one call.
    pub id: String,
    #[serde(flatten)]
    pub data: ChunkData,
}

impl ProtocolChunk {
    pub fn new(id: impl Into<String>, data: ChunkData) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, ChunkData::Text(text.into()))
    }

    pub fn reasoning(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, ChunkData::Reasoning(text.into()))
    }

    pub fn stop(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(id, ChunkData::Stop(reason.into()))
    }

    pub fn error(id: impl Into<String>, error: AgentRuntimeError) -> Self {
        Self::new(id, ChunkData::Error(error))
    }

    /// Wire name of the chunk type.
    pub fn kind(&self) -> &'static str {
        match self.data {
            ChunkData::Text(_) => "text",
            ChunkData::Reasoning(_) => "reasoning",
            ChunkData::ToolCalls(_) => "tool_calls",
            ChunkData::Stop(_) => "stop",
            ChunkData::Error(_) => "error",
            ChunkData::Usage(_) => "usage",
        }
    }

    /// `error` chunks end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.data, ChunkData::Error(_))
    }

    /// Renders `data: {...}\n\n`.
    pub fn to_sse(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => format!(
                "data: {}\n\n",
                serde_json::json!({"id": self.id, "type": "error", "data": {"message": e.to_string()}})
            ),
        }
    }
}

/// Encodes a chunk stream into outward SSE frames, appending `[DONE]` unless
/// the stream ended with an `error` chunk.
pub fn encode_sse<S>(chunks: S) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = ProtocolChunk> + Send + Unpin,
{
    struct State<S> {
        chunks: S,
        last_was_error: bool,
        finished: bool,
    }

    stream::unfold(
        State {
            chunks,
            last_was_error: false,
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            match state.chunks.next().await {
                Some(chunk) => {
                    state.last_was_error = chunk.is_terminal();
                    Some((Bytes::from(chunk.to_sse()), state))
                }
                None => {
                    state.finished = true;
                    if state.last_was_error {
                        None
                    } else {
                        Some((Bytes::from_static(SSE_DONE_FRAME.as_bytes()), state))
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentRuntimeErrorType;

    #[test]
    fn text_chunk_serializes_to_line_form() {
        let chunk = ProtocolChunk::text("chatcmpl-1", "Hello");
        assert_eq!(
            chunk.to_sse(),
            "data: {\"id\":\"chatcmpl-1\",\"type\":\"text\",\"data\":\"Hello\"}\n\n"
        );
    }

    #[test]
    fn tool_calls_chunk_carries_delta_list() {
        let chunk = ProtocolChunk::new(
            "s",
            ChunkData::ToolCalls(vec![ToolCallDelta {
                index: 0,
                id: "call_1".into(),
                kind: "function".into(),
                function: FunctionDelta {
                    name: Some("search".into()),
                    arguments: "{\"q\":".into(),
                },
            }]),
        );
        let value = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(value["type"], "tool_calls");
        assert_eq!(value["data"][0]["function"]["name"], "search");
        assert_eq!(value["data"][0]["type"], "function");
    }

    #[test]
    fn error_chunk_is_terminal_and_carries_error_type() {
        let chunk = ProtocolChunk::error(
            "s",
            AgentRuntimeError::new(AgentRuntimeErrorType::ProviderBizError, "openai", "boom"),
        );
        assert!(chunk.is_terminal());
        let value = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["errorType"], "ProviderBizError");
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        let call = ToolCall {
            id: "c".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "now".into(),
                arguments: String::new(),
            },
        };
        assert_eq!(call.arguments_json().expect("json"), serde_json::json!({}));
    }

    #[tokio::test]
    async fn encode_sse_appends_done_after_success() {
        let chunks = stream::iter(vec![
            ProtocolChunk::text("s", "hi"),
            ProtocolChunk::stop("s", "stop"),
        ]);
        let frames: Vec<Bytes> = encode_sse(chunks).collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Bytes::from_static(SSE_DONE_FRAME.as_bytes()));
    }

    #[tokio::test]
    async fn encode_sse_ends_with_error_frame() {
        let chunks = stream::iter(vec![
            ProtocolChunk::text("s", "partial"),
            ProtocolChunk::error("s", AgentRuntimeError::biz("openai", "bad frame")),
        ]);
        let frames: Vec<Bytes> = encode_sse(chunks).collect().await;
        assert_eq!(frames.len(), 2);
        let last = String::from_utf8(frames[1].to_vec()).expect("utf8");
        assert!(last.contains("\"type\":\"error\""));
    }
}
