//! Per-stream mutable state threaded through a dialect transformer.

use std::collections::BTreeMap;

use crate::protocol::{FunctionCall, FunctionDelta, ToolCall, ToolCallDelta};

/// Argument buffer for one tool call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: Option<String>,
    /// Fragments concatenated in arrival order.
    pub arguments: String,
}

/// A buffer whose concatenated arguments are not valid JSON at finish time.
#[derive(Debug, thiserror::Error)]
#[error("tool call {index} ({name}) has invalid JSON arguments: {source}")]
pub struct IncompleteToolCall {
    pub index: u32,
    pub name: String,
    pub arguments: String,
    #[source]
    pub source: serde_json::Error,
}

/// Reassembles fragmented tool-call arguments, keyed by call index.
#[derive(Clone, Debug, Default)]
pub struct ToolCallAccumulator {
    buffers: BTreeMap<u32, ToolCallBuffer>,
}

impl ToolCallAccumulator {
    /// Appends one fragment and returns the delta to publish.
    ///
    /// The buffer is created on first sight of `index`; `id` and `name` are
    /// recorded the first time they are present. A call that never carries an
    /// id gets `call_<index>_<name>`.
    pub fn push(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        fragment: &str,
    ) -> ToolCallDelta {
        let buffer = self.buffers.entry(index).or_default();
        if buffer.id.is_empty()
            && let Some(id) = id.filter(|id| !id.is_empty())
        {
            buffer.id = id.to_string();
        }
        if buffer.name.is_none()
            && let Some(name) = name.filter(|name| !name.is_empty())
        {
            buffer.name = Some(name.to_string());
        }
        if buffer.id.is_empty() {
            buffer.id = generate_tool_call_id(index, buffer.name.as_deref());
        }
        buffer.arguments.push_str(fragment);

        ToolCallDelta {
            index,
            id: buffer.id.clone(),
            kind: "function".to_string(),
            function: FunctionDelta {
                name: name.filter(|n| !n.is_empty()).map(ToOwned::to_owned),
                arguments: fragment.to_string(),
            },
        }
    }

    /// Feeds a delta that was already published (downstream consumers).
    pub fn push_delta(&mut self, delta: &ToolCallDelta) {
        self.push(
            delta.index,
            Some(&delta.id),
            delta.function.name.as_deref(),
            &delta.function.arguments,
        );
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn get(&self, index: u32) -> Option<&ToolCallBuffer> {
        self.buffers.get(&index)
    }

    /// Validates every buffer and returns the calls in index order.
    ///
    /// An empty argument string counts as `{}`.
    pub fn complete(&self) -> Result<Vec<ToolCall>, IncompleteToolCall> {
        let mut calls = Vec::with_capacity(self.buffers.len());
        for (index, buffer) in &self.buffers {
            let name = buffer.name.clone().unwrap_or_default();
            if !buffer.arguments.trim().is_empty()
                && let Err(source) = serde_json::from_str::<serde_json::Value>(&buffer.arguments)
            {
                return Err(IncompleteToolCall {
                    index: *index,
                    name,
                    arguments: buffer.arguments.clone(),
                    source,
                });
            }
            calls.push(ToolCall {
                id: buffer.id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: buffer.arguments.clone(),
                },
            });
        }
        Ok(calls)
    }
}

fn generate_tool_call_id(index: u32, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("call_{index}_{name}"),
        None => format!("call_{index}"),
    }
}

/// State owned by exactly one in-flight stream.
#[derive(Clone, Debug, Default)]
pub struct StreamContext {
    /// Stream id stamped on every chunk.
    pub id: String,
    /// Inside an inline `<think>` block.
    pub thinking_in_content: bool,
    /// Held-back suffix that may be the start of a delimiter.
    pub(crate) pending_tag: String,
    pub tool_calls: ToolCallAccumulator,
    /// Set once the vendor signalled completion.
    pub finish_reason: Option<String>,
}

impl StreamContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fragments_at_one_index_reassemble() {
        let mut acc = ToolCallAccumulator::default();
        let first = acc.push(0, Some("call_abc"), Some("search"), "{\"q\":");
        let second = acc.push(0, None, None, "\"cats\"}");
        assert_eq!(first.function.name.as_deref(), Some("search"));
        assert_eq!(second.id, "call_abc");
        assert_eq!(second.function.name, None);

        let calls = acc.complete().expect("valid json");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments, "{\"q\":\"cats\"}");
        assert_eq!(calls[0].function.name, "search");
    }

    #[test]
    fn missing_id_is_generated_from_index_and_name() {
        let mut acc = ToolCallAccumulator::default();
        let delta = acc.push(2, None, Some("weather"), "{}");
        assert_eq!(delta.id, "call_2_weather");
    }

    #[test]
    fn invalid_json_is_reported_with_index() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, Some("a"), Some("ok"), "{}");
        acc.push(1, Some("b"), Some("broken"), "{\"q\":");
        let err = acc.complete().expect_err("truncated arguments");
        assert_eq!(err.index, 1);
        assert_eq!(err.name, "broken");
    }

    #[test]
    fn calls_complete_in_index_order() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(1, Some("b"), Some("second"), "{}");
        acc.push(0, Some("a"), Some("first"), "");
        let names: Vec<String> = acc
            .complete()
            .expect("valid")
            .into_iter()
            .map(|c| c.function.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    fn json_object() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i32>().prop_map(serde_json::Value::from),
            "[a-z \"\\\\{}:,]{0,12}".prop_map(serde_json::Value::from),
        ];
        let value = leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        });
        prop::collection::btree_map("[a-z_]{1,8}", value, 0..5)
            .prop_map(|m| serde_json::Value::Object(m.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn any_split_of_serialized_object_reassembles(
            object in json_object(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let text = serde_json::to_string(&object).expect("serialize");
            let chars: Vec<char> = text.chars().collect();
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(chars.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut acc = ToolCallAccumulator::default();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(chars.len())) {
                let fragment: String = chars[start..point].iter().collect();
                acc.push(0, Some("call_p"), Some("tool"), &fragment);
                start = point;
            }

            let calls = acc.complete().expect("reassembled json");
            let parsed: serde_json::Value =
                serde_json::from_str(&calls[0].function.arguments).expect("parse");
            prop_assert_eq!(parsed, object);
        }
    }
}
