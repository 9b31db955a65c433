//! Uniform runtime over heterogeneous LLM vendor APIs.
//!
//! Every provider stream is normalized into one sequence of
//! [`ProtocolChunk`]s (`text`, `reasoning`, `tool_calls`, `stop`, `error`,
//! `usage`), and every vendor failure into an [`AgentRuntimeError`].
//!
//! # Streaming a chat completion
//!
//! ```no_run
//! use model_runtime::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = create_runtime(
//!     ProviderConfig::from_env("openai", ProviderKind::OpenAi)?.into_descriptor()?,
//! )?;
//!
//! let payload = ChatStreamPayload::new("gpt-4o-mini", vec![ChatMessage::user("Say hello")]);
//! let mut stream = runtime.chat(&payload, ChatOptions::default()).await?;
//! while let Some(chunk) = stream.next_chunk().await {
//!     if let ChunkData::Text(text) = chunk.data {
//!         print!("{text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Incremental callbacks over a chunk stream.
pub mod callbacks;
/// Environment and JSON configuration.
pub mod config;
/// Per-stream state: inline-reasoning lookback and tool-call buffers.
pub mod context;
/// SSE / NDJSON framing of raw response bytes.
pub mod decoder;
/// Error taxonomy and configuration errors.
pub mod errors;
/// `create_runtime` and the descriptor it consumes.
pub mod factory;
/// Identifiers, chat options, and model cards.
pub mod model;
/// HTTP status / body to error type mapping.
pub mod normalize;
/// Logging initialisation.
pub mod observability;
/// Request and result types.
pub mod payload;
/// Stream task, `ChatStream`, and `AbortHandle`.
pub mod pipeline;
/// Common imports for typical usage.
pub mod prelude;
/// Canonical chunk types and outward SSE encoding.
pub mod protocol;
/// Startup registration of runtimes.
pub mod registry;
/// Model-id routing over several runtimes.
pub mod router;
/// The `Runtime` trait.
pub mod runtime;
/// Per-dialect request bodies and event transformers.
pub mod transformers;

pub use callbacks::{CallbackStream, ChatStreamCallbacks, StreamAggregate, with_callbacks};
pub use config::{ProviderConfig, RouterConfig, RuntimeConfig};
pub use context::{StreamContext, ToolCallAccumulator};
pub use errors::{AgentRuntimeError, AgentRuntimeErrorType, ConfigError};
pub use factory::{AuthStrategy, ModelListFetcher, ProviderRuntime, RuntimeDescriptor, create_runtime};
pub use model::{ChatOptions, ModelCard, ProviderId};
pub use observability::{LogConfig, LogSink, init_observability, init_with};
pub use payload::{
    ChatMessage, ChatStreamPayload, ChatTool, CompletionResult, ImageResult, Role,
    TextToImagePayload,
};
pub use pipeline::{AbortHandle, ChatStream};
pub use protocol::{ChunkData, ProtocolChunk, ToolCall, ToolCallDelta, Usage, encode_sse};
pub use registry::{RuntimeRegistry, RuntimeRegistryBuilder};
pub use router::{ModelMapping, Route, RouteTarget, RouterRuntime};
pub use runtime::Runtime;
pub use transformers::ProviderKind;
