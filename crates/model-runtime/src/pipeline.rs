//! Per-stream task, cancellation handle, and the consumer-side `ChatStream`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument as _, debug, info, info_span};

use crate::callbacks::{CallbackStream, ChatStreamCallbacks, StreamAggregate};
use crate::context::StreamContext;
use crate::decoder::EventStream;
use crate::errors::AgentRuntimeError;
use crate::model::ProviderId;
use crate::payload::CompletionResult;
use crate::protocol::{ChunkData, ProtocolChunk, encode_sse};
use crate::transformers::{ProviderKind, end_of_input};

/// Handle used to request cancellation of a running stream.
///
/// Clones share one signal. Firing it drops the in-flight HTTP call, stops the
/// decoder, and ends the chunk stream without any further chunk.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `abort` has been called.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

/// Resolves at `deadline`, or never.
pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs `fut` unless the abort signal or the deadline fires first.
pub(crate) async fn guarded<T, F>(
    provider: &ProviderId,
    abort: &AbortHandle,
    deadline: Option<Instant>,
    fut: F,
) -> Result<T, AgentRuntimeError>
where
    F: Future<Output = Result<T, AgentRuntimeError>>,
{
    if abort.is_aborted() {
        return Err(AgentRuntimeError::cancelled(provider.clone()));
    }
    tokio::select! {
        biased;
        _ = abort.aborted() => Err(AgentRuntimeError::cancelled(provider.clone())),
        _ = deadline_elapsed(deadline) => Err(AgentRuntimeError::timeout(provider.clone())),
        result = fut => result,
    }
}

/// Everything the stream task needs besides its channels.
pub(crate) struct StreamTask {
    pub provider: ProviderId,
    pub model: String,
    pub kind: ProviderKind,
    pub events: EventStream,
    pub deadline: Option<Instant>,
    pub debug: bool,
}

/// Spawns the stream task and returns the consumer handle.
pub(crate) fn spawn_stream(task: StreamTask, abort: AbortHandle, capacity: usize) -> ChatStream {
    let id = format!("chat_{}", uuid::Uuid::new_v4().simple());
    let (tx, rx) = mpsc::channel(capacity);
    let provider = task.provider.clone();
    let span = info_span!(
        "chat_stream",
        stream_id = %id,
        provider = %provider,
        model = %task.model
    );
    tokio::spawn(run_task(task, StreamContext::new(id.clone()), tx, abort.clone()).instrument(span));
    ChatStream {
        id,
        provider,
        rx,
        abort,
    }
}

async fn run_task(
    task: StreamTask,
    mut ctx: StreamContext,
    tx: mpsc::Sender<ProtocolChunk>,
    abort: AbortHandle,
) {
    let StreamTask {
        provider,
        kind,
        mut events,
        deadline,
        debug: debug_events,
        ..
    } = task;
    debug!("stream started");

    loop {
        tokio::select! {
            biased;
            _ = abort.aborted() => {
                debug!("stream aborted");
                return;
            }
            _ = deadline_elapsed(deadline) => {
                let chunk = ProtocolChunk::error(&ctx.id, AgentRuntimeError::timeout(provider.clone()));
                let _ = send_chunk(&tx, &abort, chunk).await;
                debug!("stream deadline elapsed");
                return;
            }
            _ = tx.closed() => {
                debug!("stream consumer dropped");
                return;
            }
            next = events.next() => {
                let chunks = match next {
                    Some(Ok(event)) => {
                        if debug_events {
                            info!(event = %event, "vendor event");
                        }
                        kind.transform(&event, &mut ctx, &provider)
                    }
                    Some(Err(err)) => vec![ProtocolChunk::error(&ctx.id, err)],
                    None => {
                        let chunks = end_of_input(&mut ctx, &provider);
                        for chunk in chunks {
                            if !send_chunk(&tx, &abort, chunk).await {
                                return;
                            }
                        }
                        debug!(finish_reason = ?ctx.finish_reason, "stream completed");
                        return;
                    }
                };
                for chunk in chunks {
                    let terminal = chunk.is_terminal();
                    if !send_chunk(&tx, &abort, chunk).await || terminal {
                        if terminal {
                            debug!("stream ended with error");
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Sends one chunk, giving up when the consumer is gone or the stream is
/// aborted while waiting for buffer space.
async fn send_chunk(tx: &mpsc::Sender<ProtocolChunk>, abort: &AbortHandle, chunk: ProtocolChunk) -> bool {
    tokio::select! {
        biased;
        _ = abort.aborted() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

/// Canonical chunk stream of one chat call.
///
/// Consume it with `next_chunk()` / `futures::Stream`, aggregate it with
/// `collect()`, or re-encode it with `into_sse()`.
pub struct ChatStream {
    id: String,
    provider: ProviderId,
    rx: mpsc::Receiver<ProtocolChunk>,
    abort: AbortHandle,
}

impl ChatStream {
    /// Stream id stamped on every chunk.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    /// Returns a handle that can cancel the stream.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Waits for the next chunk. Returns `None` once the stream ended or the
    /// abort handle fired, even if chunks are still buffered.
    pub async fn next_chunk(&mut self) -> Option<ProtocolChunk> {
        if self.abort.is_aborted() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.abort.aborted() => None,
            chunk = self.rx.recv() => chunk.filter(|_| !self.abort.is_aborted()),
        }
    }

    /// Wraps the stream with incremental callbacks.
    pub fn with_callbacks(self, callbacks: ChatStreamCallbacks) -> CallbackStream<Self> {
        let abort = self.abort.clone();
        CallbackStream::new(self, callbacks, Some(abort))
    }

    /// Drains the stream into a `CompletionResult`.
    ///
    /// An `error` chunk becomes `Err`; an aborted stream yields `Cancelled`.
    pub async fn collect(mut self) -> Result<CompletionResult, AgentRuntimeError> {
        let mut aggregate = StreamAggregate::default();
        while let Some(chunk) = self.next_chunk().await {
            if let ChunkData::Error(err) = chunk.data {
                return Err(err);
            }
            aggregate.apply(&chunk);
        }
        if self.abort.is_aborted() {
            return Err(AgentRuntimeError::cancelled(self.provider.clone()));
        }
        Ok(aggregate.into_result(self.id))
    }

    /// Outward SSE frames, `data: [DONE]` included.
    pub fn into_sse(self) -> impl futures::Stream<Item = Bytes> + Send {
        encode_sse(self)
    }
}

impl futures::Stream for ChatStream {
    type Item = ProtocolChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.abort.is_aborted() {
            return Poll::Ready(None);
        }
        // The task drops its sender right after observing the abort, which
        // wakes this receiver.
        this.rx.poll_recv(cx)
    }
}
