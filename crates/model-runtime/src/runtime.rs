use crate::errors::AgentRuntimeError;
use crate::model::{ChatOptions, ModelCard, ProviderId};
use crate::payload::{ChatStreamPayload, ImageResult, TextToImagePayload};
use crate::pipeline::ChatStream;

/// Uniform client over one upstream vendor (or a router over several).
///
/// Implementations must be cheap to share behind `Arc` and safe to call
/// concurrently; every call owns its own stream state.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    /// Returns the stable provider id.
    fn id(&self) -> ProviderId;

    /// Starts a chat call and returns its canonical chunk stream.
    ///
    /// Failures before the first byte (validation, network, non-2xx) are
    /// returned here; failures after that arrive as a terminal `error` chunk.
    async fn chat(
        &self,
        payload: &ChatStreamPayload,
        options: ChatOptions,
    ) -> Result<ChatStream, AgentRuntimeError>;

    /// Lists chat-capable models.
    async fn models(&self) -> Result<Vec<ModelCard>, AgentRuntimeError>;

    async fn text_to_image(
        &self,
        payload: &TextToImagePayload,
    ) -> Result<Vec<ImageResult>, AgentRuntimeError>;
}
