//! Incremental callbacks layered over a canonical chunk stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use crate::context::ToolCallAccumulator;
use crate::errors::AgentRuntimeError;
use crate::payload::CompletionResult;
use crate::pipeline::AbortHandle;
use crate::protocol::{ChunkData, ProtocolChunk, ToolCall, ToolCallDelta, Usage};

type TextCallback = Box<dyn FnMut(&str) + Send>;

/// Optional hooks fired while a stream is consumed. Each fires at most once
/// per chunk.
#[derive(Default)]
pub struct ChatStreamCallbacks {
    pub on_start: Option<Box<dyn FnMut() + Send>>,
    pub on_text: Option<TextCallback>,
    pub on_reasoning: Option<TextCallback>,
    /// Deltas of one `tool_calls` chunk.
    pub on_tool_calls_update: Option<Box<dyn FnMut(&[ToolCallDelta]) + Send>>,
    /// Reassembled calls, fired when `stop` follows tool-call deltas.
    pub on_tool_calls_complete: Option<Box<dyn FnMut(&[ToolCall]) + Send>>,
    pub on_usage: Option<Box<dyn FnMut(&Usage) + Send>>,
    /// Fired once when the stream ends normally.
    pub on_finish: Option<Box<dyn FnMut(CompletionResult) + Send>>,
    pub on_error: Option<Box<dyn FnMut(&AgentRuntimeError) + Send>>,
}

impl ChatStreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_text(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_text = Some(Box::new(f));
        self
    }

    pub fn on_reasoning(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_reasoning = Some(Box::new(f));
        self
    }

    pub fn on_tool_calls_update(mut self, f: impl FnMut(&[ToolCallDelta]) + Send + 'static) -> Self {
        self.on_tool_calls_update = Some(Box::new(f));
        self
    }

    pub fn on_tool_calls_complete(mut self, f: impl FnMut(&[ToolCall]) + Send + 'static) -> Self {
        self.on_tool_calls_complete = Some(Box::new(f));
        self
    }

    pub fn on_usage(mut self, f: impl FnMut(&Usage) + Send + 'static) -> Self {
        self.on_usage = Some(Box::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl FnMut(CompletionResult) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&AgentRuntimeError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Running totals of a chunk stream.
#[derive(Clone, Debug, Default)]
pub struct StreamAggregate {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: ToolCallAccumulator,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

impl StreamAggregate {
    pub fn apply(&mut self, chunk: &ProtocolChunk) {
        match &chunk.data {
            ChunkData::Text(text) => self.text.push_str(text),
            ChunkData::Reasoning(text) => self.reasoning.push_str(text),
            ChunkData::ToolCalls(deltas) => deltas.iter().for_each(|d| self.tool_calls.push_delta(d)),
            ChunkData::Usage(usage) => self.usage = Some(usage.clone()),
            ChunkData::Stop(reason) => self.finish_reason = Some(reason.clone()),
            ChunkData::Error(_) => {}
        }
    }

    /// Completed tool calls; the transformer already rejected invalid ones.
    pub fn completed_tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls.complete().unwrap_or_default()
    }

    pub fn to_result(&self, id: impl Into<String>) -> CompletionResult {
        CompletionResult {
            id: id.into(),
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.completed_tool_calls(),
            usage: self.usage.clone(),
            finish_reason: self.finish_reason.clone(),
        }
    }

    pub fn into_result(self, id: impl Into<String>) -> CompletionResult {
        let tool_calls = self.completed_tool_calls();
        CompletionResult {
            id: id.into(),
            text: self.text,
            reasoning: self.reasoning,
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

/// Stream adapter returned by `with_callbacks`; yields every chunk unchanged.
pub struct CallbackStream<S> {
    inner: S,
    callbacks: ChatStreamCallbacks,
    abort: Option<AbortHandle>,
    aggregate: StreamAggregate,
    stream_id: Option<String>,
    started: bool,
    finished: bool,
}

impl<S> CallbackStream<S> {
    pub fn new(inner: S, callbacks: ChatStreamCallbacks, abort: Option<AbortHandle>) -> Self {
        Self {
            inner,
            callbacks,
            abort,
            aggregate: StreamAggregate::default(),
            stream_id: None,
            started: false,
            finished: false,
        }
    }

    /// Totals observed so far.
    pub fn aggregate(&self) -> &StreamAggregate {
        &self.aggregate
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortHandle::is_aborted)
    }

    fn dispatch(&mut self, chunk: &ProtocolChunk) {
        if !self.started {
            self.started = true;
            if let Some(f) = self.callbacks.on_start.as_mut() {
                f();
            }
        }
        if self.stream_id.is_none() {
            self.stream_id = Some(chunk.id.clone());
        }
        self.aggregate.apply(chunk);

        let callbacks = &mut self.callbacks;
        match &chunk.data {
            ChunkData::Text(text) => {
                if let Some(f) = callbacks.on_text.as_mut() {
                    f(text.as_str());
                }
            }
            ChunkData::Reasoning(text) => {
                if let Some(f) = callbacks.on_reasoning.as_mut() {
                    f(text.as_str());
                }
            }
            ChunkData::ToolCalls(deltas) => {
                if let Some(f) = callbacks.on_tool_calls_update.as_mut() {
                    f(deltas.as_slice());
                }
            }
            ChunkData::Usage(usage) => {
                if let Some(f) = callbacks.on_usage.as_mut() {
                    f(usage);
                }
            }
            ChunkData::Stop(_) => {
                if !self.aggregate.tool_calls.is_empty()
                    && let Some(f) = callbacks.on_tool_calls_complete.as_mut()
                {
                    f(self.aggregate.completed_tool_calls().as_slice());
                }
            }
            ChunkData::Error(err) => {
                self.finished = true;
                if let Some(f) = callbacks.on_error.as_mut() {
                    f(err);
                }
            }
        }
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.aborted() {
            return;
        }
        let id = self.stream_id.clone().unwrap_or_default();
        let result = self.aggregate.to_result(id);
        if let Some(f) = self.callbacks.on_finish.as_mut() {
            f(result);
        }
    }
}

impl<S> Stream for CallbackStream<S>
where
    S: Stream<Item = ProtocolChunk> + Unpin,
{
    type Item = ProtocolChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.aborted() {
            this.finished = true;
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                this.dispatch(&chunk);
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wraps any chunk stream with `callbacks`. When `abort` fires no further
/// callback runs, `on_finish` included.
pub fn with_callbacks<S>(
    stream: S,
    callbacks: ChatStreamCallbacks,
    abort: Option<AbortHandle>,
) -> CallbackStream<S>
where
    S: Stream<Item = ProtocolChunk> + Unpin,
{
    CallbackStream::new(stream, callbacks, abort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FunctionDelta;
    use futures::{StreamExt as _, stream};
    use std::sync::{Arc, Mutex};

    fn tool_delta(index: u32, name: Option<&str>, arguments: &str) -> ProtocolChunk {
        ProtocolChunk::new(
            "s",
            ChunkData::ToolCalls(vec![ToolCallDelta {
                index,
                id: "call_1".into(),
                kind: "function".into(),
                function: FunctionDelta {
                    name: name.map(ToOwned::to_owned),
                    arguments: arguments.into(),
                },
            }]),
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, ChatStreamCallbacks) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let push = |log: &Arc<Mutex<Vec<String>>>| {
            let log = log.clone();
            move |entry: String| log.lock().expect("log").push(entry)
        };
        let (start, text, reasoning, update, complete, usage, finish, error) = (
            push(&log),
            push(&log),
            push(&log),
            push(&log),
            push(&log),
            push(&log),
            push(&log),
            push(&log),
        );
        let callbacks = ChatStreamCallbacks::new()
            .on_start(move || start("start".into()))
            .on_text(move |t| text(format!("text:{t}")))
            .on_reasoning(move |t| reasoning(format!("reasoning:{t}")))
            .on_tool_calls_update(move |d| update(format!("update:{}", d.len())))
            .on_tool_calls_complete(move |calls| {
                complete(format!("complete:{}", calls[0].function.arguments))
            })
            .on_usage(move |u| usage(format!("usage:{}", u.total_tokens)))
            .on_finish(move |r| finish(format!("finish:{}", r.text)))
            .on_error(move |e| error(format!("error:{}", e.error_type)));
        (log, callbacks)
    }

    #[tokio::test]
    async fn callbacks_fire_in_chunk_order() {
        let (log, callbacks) = recorder();
        let chunks = vec![
            ProtocolChunk::reasoning("s", "hmm"),
            tool_delta(0, Some("search"), "{\"q\":"),
            tool_delta(0, None, "\"cats\"}"),
            ProtocolChunk::text("s", "ok"),
            ProtocolChunk::stop("s", "tool_calls"),
            ProtocolChunk::new(
                "s",
                ChunkData::Usage(Usage {
                    total_tokens: 9,
                    ..Usage::default()
                }),
            ),
        ];
        let passed: Vec<ProtocolChunk> = with_callbacks(stream::iter(chunks.clone()), callbacks, None)
            .collect()
            .await;
        assert_eq!(passed, chunks);
        assert_eq!(
            *log.lock().expect("log"),
            vec![
                "start",
                "reasoning:hmm",
                "update:1",
                "update:1",
                "text:ok",
                "complete:{\"q\":\"cats\"}",
                "usage:9",
                "finish:ok",
            ]
        );
    }

    #[tokio::test]
    async fn error_chunk_is_terminal_for_callbacks() {
        let (log, callbacks) = recorder();
        let chunks = vec![
            ProtocolChunk::text("s", "partial"),
            ProtocolChunk::error("s", AgentRuntimeError::biz("openai", "bad frame")),
        ];
        let passed: Vec<ProtocolChunk> = with_callbacks(stream::iter(chunks), callbacks, None)
            .collect()
            .await;
        assert_eq!(passed.len(), 2);
        assert_eq!(
            *log.lock().expect("log"),
            vec!["start", "text:partial", "error:ProviderBizError"]
        );
    }

    #[tokio::test]
    async fn no_callback_after_abort() {
        let (log, callbacks) = recorder();
        let abort = AbortHandle::new();
        let mut stream = with_callbacks(
            stream::iter(vec![
                ProtocolChunk::text("s", "one"),
                ProtocolChunk::text("s", "two"),
            ]),
            callbacks,
            Some(abort.clone()),
        );
        assert!(stream.next().await.is_some());
        abort.abort();
        assert!(stream.next().await.is_none());
        assert_eq!(*log.lock().expect("log"), vec!["start", "text:one"]);
    }
}
