use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::pipeline::AbortHandle;

/// Stable identifier for a provider runtime (for example `openai`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// One entry returned by `Runtime::models`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelCard {
    /// Provider-specific model id (for example `gpt-4o-mini`).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Release date formatted as `YYYY-MM-DD` when the vendor reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

impl ModelCard {
    /// Creates a card carrying only the model id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            released_at: None,
            owned_by: None,
        }
    }
}

/// Per-call options for `Runtime::chat`.
#[derive(Clone, Debug)]
pub struct ChatOptions {
    /// Cancellation signal. When absent the pipeline creates its own handle,
    /// reachable through `ChatStream::abort_handle`.
    pub abort: Option<AbortHandle>,
    /// Logs the outgoing body and every raw vendor event.
    pub debug: bool,
    /// Caller-supplied deadline for the whole call. No deadline by default.
    pub timeout: Option<Duration>,
    /// Bounded chunk buffer between the pipeline task and the consumer.
    pub stream_buffer_capacity: usize,
    /// End-user id forwarded to vendors that accept one.
    pub user: Option<String>,
    /// Extra request headers for this call only.
    pub request_headers: HashMap<String, String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            abort: None,
            debug: false,
            timeout: None,
            stream_buffer_capacity: 128,
            user: None,
            request_headers: HashMap::new(),
        }
    }
}

impl ChatOptions {
    /// Attaches a cancellation handle owned by the caller.
    pub fn abort(mut self, handle: AbortHandle) -> Self {
        self.abort = Some(handle);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets a deadline after which the call fails with `Timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }
}
