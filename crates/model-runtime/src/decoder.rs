//! Raw response bytes to vendor-native JSON events.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::AgentRuntimeError;
use crate::model::ProviderId;
use crate::normalize::from_transport;
use crate::pipeline::AbortHandle;
use crate::transformers::Framing;

/// Response body as handed over by `reqwest`.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Vendor events ready for a dialect transformer.
pub type EventStream =
    Pin<Box<dyn futures::Stream<Item = Result<serde_json::Value, AgentRuntimeError>> + Send + 'static>>;

const DONE_SENTINEL: &str = "[DONE]";

/// Growable byte buffer handing out complete `\n`-terminated lines.
///
/// `scanned` remembers how far the newline search got, so an unterminated
/// line arriving in many small chunks is scanned once.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
    start: usize,
    scanned: usize,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    fn next_line(&mut self) -> Option<String> {
        let from = self.scanned.max(self.start);
        match self.buf[from..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = from + offset;
                let line = trim_cr(&self.buf[self.start..end]);
                self.start = end + 1;
                self.scanned = self.start;
                Some(line)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Unterminated remainder at end of input.
    fn take_rest(&mut self) -> Option<String> {
        let rest = trim_cr(&self.buf[self.start..]);
        *self = Self::default();
        (!rest.is_empty()).then_some(rest)
    }
}

fn trim_cr(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// One dispatched `text/event-stream` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    /// Last event id seen on the stream, carried over between events.
    pub id: Option<String>,
    /// Reconnection delay requested by the server, in milliseconds.
    pub retry: Option<u64>,
}

/// Incremental `text/event-stream` parser: fields accumulate line by line
/// and a blank line dispatches the event.
#[derive(Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    /// Feeds `chunk` and returns every event it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.lines.extend(chunk);
        let mut frames = Vec::new();
        while let Some(line) = self.lines.next_line() {
            if let Some(frame) = self.apply_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Dispatches the pending event when the body ended mid-event.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if let Some(line) = self.lines.take_rest() {
            // The remainder is a field line; a dispatch never comes from it.
            let _ = self.apply_line(&line);
        }
        self.dispatch()
    }

    fn apply_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.last_id.clone(),
            retry: self.retry,
        })
    }
}

/// Newline-delimited JSON framer; blank lines are skipped.
#[derive(Default)]
pub struct NdjsonDecoder {
    lines: LineBuffer,
}

impl NdjsonDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.lines.extend(chunk);
        std::iter::from_fn(|| self.lines.next_line())
            .filter_map(non_blank)
            .collect()
    }

    pub fn finish(&mut self) -> Option<String> {
        self.lines.take_rest().and_then(non_blank)
    }
}

fn non_blank(line: String) -> Option<String> {
    let trimmed = line.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

enum Framer {
    Sse(SseDecoder),
    Ndjson(NdjsonDecoder),
}

impl Framer {
    fn new(framing: Framing) -> Self {
        match framing {
            Framing::Sse => Self::Sse(SseDecoder::default()),
            Framing::Ndjson => Self::Ndjson(NdjsonDecoder::default()),
        }
    }

    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        match self {
            Self::Sse(decoder) => decoder.push_chunk(chunk).into_iter().map(|f| f.data).collect(),
            Self::Ndjson(decoder) => decoder.push_chunk(chunk),
        }
    }

    fn finish(&mut self) -> Option<String> {
        match self {
            Self::Sse(decoder) => decoder.finish().map(|f| f.data),
            Self::Ndjson(decoder) => decoder.finish(),
        }
    }
}

enum Payload {
    Event(serde_json::Value),
    Skip,
    Done,
}

fn parse_payload(provider: &ProviderId, data: &str) -> Result<Payload, AgentRuntimeError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(Payload::Skip);
    }
    if data == DONE_SENTINEL {
        return Ok(Payload::Done);
    }
    serde_json::from_str(data).map(Payload::Event).map_err(|e| {
        AgentRuntimeError::biz(provider.clone(), format!("invalid stream frame: {e}"))
            .with_body(serde_json::Value::String(data.to_string()))
    })
}

/// Lazily decodes `bytes` into vendor events.
///
/// Ends at `[DONE]`, at end of input, after the first error, or as soon as
/// `abort` fires (the pending read is dropped with the body).
pub fn vendor_events(
    provider: ProviderId,
    bytes: ByteStream,
    framing: Framing,
    abort: AbortHandle,
) -> EventStream {
    struct State {
        provider: ProviderId,
        bytes: ByteStream,
        framer: Framer,
        abort: AbortHandle,
        pending: VecDeque<String>,
        exhausted: bool,
    }

    let stream = stream::try_unfold(
        State {
            provider,
            bytes,
            framer: Framer::new(framing),
            abort,
            pending: VecDeque::new(),
            exhausted: false,
        },
        |mut state| async move {
            loop {
                if let Some(data) = state.pending.pop_front() {
                    match parse_payload(&state.provider, &data)? {
                        Payload::Event(value) => return Ok(Some((value, state))),
                        Payload::Skip => continue,
                        Payload::Done => {
                            debug!(provider = %state.provider, "stream sentinel reached");
                            return Ok(None);
                        }
                    }
                }
                if state.exhausted || state.abort.is_aborted() {
                    return Ok(None);
                }

                let next = tokio::select! {
                    biased;
                    _ = state.abort.aborted() => return Ok(None),
                    next = state.bytes.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        let frames = state.framer.push_chunk(&chunk);
                        state.pending.extend(frames);
                    }
                    Some(Err(e)) => return Err(from_transport(&state.provider, &e)),
                    None => {
                        state.exhausted = true;
                        state.pending.extend(state.framer.finish());
                    }
                }
            }
        },
    );
    Box::pin(stream)
}
