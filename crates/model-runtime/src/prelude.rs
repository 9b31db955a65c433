//! Common imports for typical runtime usage.
pub use crate::{
    AbortHandle, AgentRuntimeError, AgentRuntimeErrorType, ChatMessage, ChatOptions, ChatStream,
    ChatStreamCallbacks, ChatStreamPayload, ChunkData, CompletionResult, ProtocolChunk,
    ProviderConfig, ProviderId, ProviderKind, Runtime, RuntimeConfig, RuntimeDescriptor,
    RuntimeRegistry, create_runtime,
};
