//! Descriptor-driven construction of provider runtimes.

use std::fmt;
use std::sync::Arc;

use futures::stream;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::decoder::{ByteStream, EventStream, vendor_events};
use crate::errors::{AgentRuntimeError, AgentRuntimeErrorType};
use crate::model::{ChatOptions, ModelCard, ProviderId};
use crate::normalize::{from_transport, normalize_http_error};
use crate::payload::{ChatStreamPayload, ImageResult, TextToImagePayload};
use crate::pipeline::{ChatStream, StreamTask, guarded, spawn_stream};
use crate::runtime::Runtime;
use crate::transformers::{BodyOptions, ProviderKind};

/// How the API key is attached to requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthStrategy {
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// Key sent verbatim in a custom header (for example `api-key`).
    Header { name: String },
    /// No credentials.
    None,
}

/// Mutates the outgoing JSON body after the dialect built it.
pub type PayloadHook = Arc<dyn Fn(&mut Value, &ChatStreamPayload) + Send + Sync>;
/// Rewrites or drops a model card; `None` removes it from the listing.
pub type ModelCardTransform = Arc<dyn Fn(ModelCard) -> Option<ModelCard> + Send + Sync>;
/// Evaluated per call; `true` logs request bodies and raw vendor events.
pub type DebugPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Custom model listing used instead of the dialect's default endpoint.
#[async_trait::async_trait]
pub trait ModelListFetcher: Send + Sync {
    async fn fetch(
        &self,
        client: &reqwest::Client,
        descriptor: &RuntimeDescriptor,
    ) -> Result<Vec<ModelCard>, AgentRuntimeError>;
}

/// Everything needed to talk to one provider. Immutable once a runtime is
/// built from it.
#[derive(Clone)]
pub struct RuntimeDescriptor {
    pub id: ProviderId,
    pub kind: ProviderKind,
    /// Defaults to the dialect's public endpoint.
    pub base_url: Option<String>,
    pub auth: AuthStrategy,
    pub api_key: Option<String>,
    /// Static headers sent on every request.
    pub headers: Vec<(String, String)>,
    pub handle_payload: Option<PayloadHook>,
    pub models_fetcher: Option<Arc<dyn ModelListFetcher>>,
    pub model_card_transform: Option<ModelCardTransform>,
    pub debug: Option<DebugPredicate>,
    /// Do not request `stream_options.include_usage`.
    pub exclude_usage: bool,
}

impl RuntimeDescriptor {
    /// Descriptor with the dialect's defaults: bearer auth for keyed
    /// dialects, none for Ollama.
    pub fn new(id: impl Into<ProviderId>, kind: ProviderKind) -> Self {
        let auth = if kind.requires_api_key() {
            AuthStrategy::Bearer
        } else {
            AuthStrategy::None
        };
        Self {
            id: id.into(),
            kind,
            base_url: None,
            auth,
            api_key: None,
            headers: Vec::new(),
            handle_payload: None,
            models_fetcher: None,
            model_card_transform: None,
            debug: None,
            exclude_usage: false,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn auth(mut self, auth: AuthStrategy) -> Self {
        self.auth = auth;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn handle_payload(
        mut self,
        hook: impl Fn(&mut Value, &ChatStreamPayload) + Send + Sync + 'static,
    ) -> Self {
        self.handle_payload = Some(Arc::new(hook));
        self
    }

    pub fn models_fetcher(mut self, fetcher: Arc<dyn ModelListFetcher>) -> Self {
        self.models_fetcher = Some(fetcher);
        self
    }

    pub fn model_card_transform(
        mut self,
        transform: impl Fn(ModelCard) -> Option<ModelCard> + Send + Sync + 'static,
    ) -> Self {
        self.model_card_transform = Some(Arc::new(transform));
        self
    }

    pub fn debug(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.debug = Some(Arc::new(predicate));
        self
    }

    pub fn exclude_usage(mut self, exclude: bool) -> Self {
        self.exclude_usage = exclude;
        self
    }

    /// Base URL without a trailing slash.
    pub fn resolved_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    fn debug_enabled(&self) -> bool {
        self.debug.as_ref().is_some_and(|predicate| predicate())
    }
}

impl fmt::Debug for RuntimeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.len())
            .field("exclude_usage", &self.exclude_usage)
            .finish_non_exhaustive()
    }
}

/// Builds a runtime for `descriptor`.
///
/// Fails with `InvalidAPIKey` when the auth strategy needs a key and none is
/// configured. The HTTP client has no implicit timeout.
pub fn create_runtime(descriptor: RuntimeDescriptor) -> Result<ProviderRuntime, AgentRuntimeError> {
    let key_missing = descriptor
        .api_key
        .as_deref()
        .is_none_or(|key| key.trim().is_empty());
    if descriptor.auth != AuthStrategy::None && key_missing {
        return Err(AgentRuntimeError::new(
            AgentRuntimeErrorType::InvalidApiKey,
            descriptor.id.clone(),
            "an API key is required but none is configured",
        ));
    }
    let client = reqwest::Client::builder().build().map_err(|e| {
        AgentRuntimeError::new(
            AgentRuntimeErrorType::NetworkError,
            descriptor.id.clone(),
            format!("failed to build HTTP client: {e}"),
        )
    })?;
    let base_url = descriptor.resolved_base_url();
    debug!(provider = %descriptor.id, kind = %descriptor.kind, base_url = %base_url, "runtime created");
    Ok(ProviderRuntime {
        descriptor,
        client,
        base_url,
    })
}

/// Runtime produced by `create_runtime`.
pub struct ProviderRuntime {
    descriptor: RuntimeDescriptor,
    client: reqwest::Client,
    base_url: String,
}

impl ProviderRuntime {
    pub fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = self.descriptor.api_key.as_deref() {
            request = match &self.descriptor.auth {
                AuthStrategy::Bearer => request.bearer_auth(key),
                AuthStrategy::Header { name } => request.header(name.as_str(), key),
                AuthStrategy::None => request,
            };
        }
        for (name, value) in &self.descriptor.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn validate(&self, payload: &ChatStreamPayload, options: &ChatOptions) -> Result<(), AgentRuntimeError> {
        let provider = &self.descriptor.id;
        if payload.model.trim().is_empty() {
            return Err(AgentRuntimeError::model_not_found(provider.clone(), &payload.model));
        }
        if payload.messages.is_empty() {
            return Err(AgentRuntimeError::biz(provider.clone(), "messages must not be empty"));
        }
        if options.stream_buffer_capacity == 0 {
            return Err(AgentRuntimeError::biz(
                provider.clone(),
                "stream_buffer_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Sends `request` and returns the response once its status is 2xx.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AgentRuntimeError> {
        let provider = &self.descriptor.id;
        let response = request
            .send()
            .await
            .map_err(|e| from_transport(provider, &e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(normalize_http_error(provider, status.as_u16(), &body))
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, AgentRuntimeError> {
        let provider = &self.descriptor.id;
        let text = response.text().await.map_err(|e| from_transport(provider, &e))?;
        serde_json::from_str(&text).map_err(|e| {
            AgentRuntimeError::biz(provider.clone(), format!("invalid response body: {e}"))
                .with_body(Value::String(text))
        })
    }
}

#[async_trait::async_trait]
impl Runtime for ProviderRuntime {
    fn id(&self) -> ProviderId {
        self.descriptor.id.clone()
    }

    async fn chat(
        &self,
        payload: &ChatStreamPayload,
        options: ChatOptions,
    ) -> Result<ChatStream, AgentRuntimeError> {
        self.validate(payload, &options)?;
        let provider = self.descriptor.id.clone();
        let kind = self.descriptor.kind;

        let body_options = BodyOptions {
            include_usage: !self.descriptor.exclude_usage,
            user: options.user.clone(),
        };
        let mut body = kind.build_body(&provider, payload, &body_options)?;
        if let Some(hook) = &self.descriptor.handle_payload {
            hook(&mut body, payload);
        }
        let debug_enabled = options.debug || self.descriptor.debug_enabled();
        if debug_enabled {
            info!(provider = %provider, model = %payload.model, body = %body, "chat request body");
        }

        let mut request = self.authorized(self.client.post(self.url(kind.chat_path()))).json(&body);
        for (name, value) in &options.request_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let abort = options.abort.clone().unwrap_or_default();
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        debug!(provider = %provider, model = %payload.model, stream = payload.stream, "sending chat request");
        let response = guarded(&provider, &abort, deadline, self.send(request)).await?;

        let events: EventStream = if payload.stream {
            let bytes: ByteStream = Box::pin(response.bytes_stream());
            vendor_events(provider.clone(), bytes, kind.framing(), abort.clone())
        } else {
            let value = guarded(&provider, &abort, deadline, self.read_json(response)).await?;
            if debug_enabled {
                info!(provider = %provider, body = %value, "non-streaming response body");
            }
            let events = kind.synthesize_events(&value);
            Box::pin(stream::iter(events.into_iter().map(Ok)))
        };

        Ok(spawn_stream(
            StreamTask {
                provider,
                model: payload.model.clone(),
                kind,
                events,
                deadline,
                debug: debug_enabled,
            },
            abort,
            options.stream_buffer_capacity,
        ))
    }

    async fn models(&self) -> Result<Vec<ModelCard>, AgentRuntimeError> {
        let cards = match &self.descriptor.models_fetcher {
            Some(fetcher) => fetcher.fetch(&self.client, &self.descriptor).await?,
            None => {
                let kind = self.descriptor.kind;
                let request = self.authorized(self.client.get(self.url(kind.models_path())));
                let response = self.send(request).await?;
                kind.parse_models(&self.read_json(response).await?)
            }
        };
        Ok(match &self.descriptor.model_card_transform {
            Some(transform) => cards.into_iter().filter_map(|card| transform(card)).collect(),
            None => cards,
        })
    }

    async fn text_to_image(
        &self,
        payload: &TextToImagePayload,
    ) -> Result<Vec<ImageResult>, AgentRuntimeError> {
        let provider = &self.descriptor.id;
        let Some(path) = self.descriptor.kind.images_path() else {
            return Err(AgentRuntimeError::biz(
                provider.clone(),
                format!("text_to_image is not supported by {}", self.descriptor.kind),
            ));
        };
        let request = self.authorized(self.client.post(self.url(path))).json(payload);
        let response = self.send(request).await?;
        let body = self.read_json(response).await?;
        let images = body
            .get("data")
            .cloned()
            .map(serde_json::from_value::<Vec<ImageResult>>)
            .transpose()
            .map_err(|e| AgentRuntimeError::biz(provider.clone(), format!("invalid image response: {e}")))?
            .unwrap_or_default();
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ChatMessage;

    #[test]
    fn missing_key_is_invalid_api_key() {
        let err = create_runtime(RuntimeDescriptor::new("openai", ProviderKind::OpenAi).api_key("  "))
            .err()
            .expect("missing key");
        assert_eq!(err.error_type, AgentRuntimeErrorType::InvalidApiKey);
        assert_eq!(err.provider, ProviderId::new("openai"));
    }

    #[test]
    fn keyless_dialect_builds_without_key() {
        let runtime = create_runtime(RuntimeDescriptor::new("ollama", ProviderKind::Ollama)).expect("runtime");
        assert_eq!(runtime.id(), ProviderId::new("ollama"));
        assert_eq!(runtime.base_url, "http://127.0.0.1:11434");
    }

    #[test]
    fn base_url_is_trimmed() {
        let descriptor = RuntimeDescriptor::new("proxy", ProviderKind::OpenAi).base_url("http://localhost:8080/v1/");
        assert_eq!(descriptor.resolved_base_url(), "http://localhost:8080/v1");
    }

    #[test]
    fn debug_output_redacts_key() {
        let descriptor = RuntimeDescriptor::new("openai", ProviderKind::OpenAi).api_key("sk-secret");
        let rendered = format!("{descriptor:?}");
        assert!(!rendered.contains("sk-secret"));
    }

    #[tokio::test]
    async fn validation_happens_before_network() {
        let runtime = create_runtime(
            RuntimeDescriptor::new("openai", ProviderKind::OpenAi)
                .api_key("sk-test")
                .base_url("http://127.0.0.1:9"),
        )
        .expect("runtime");

        let empty_messages = ChatStreamPayload::new("gpt-4o-mini", Vec::new());
        let err = runtime
            .chat(&empty_messages, ChatOptions::default())
            .await
            .err()
            .expect("empty messages");
        assert_eq!(err.error_type, AgentRuntimeErrorType::ProviderBizError);

        let empty_model = ChatStreamPayload::new(" ", vec![ChatMessage::user("hi")]);
        let err = runtime
            .chat(&empty_model, ChatOptions::default())
            .await
            .err()
            .expect("empty model");
        assert_eq!(err.error_type, AgentRuntimeErrorType::ModelNotFound);
    }

    #[tokio::test]
    async fn ollama_has_no_image_endpoint() {
        let runtime = create_runtime(RuntimeDescriptor::new("ollama", ProviderKind::Ollama)).expect("runtime");
        let err = runtime
            .text_to_image(&TextToImagePayload::new("sd", "a cat"))
            .await
            .expect_err("unsupported");
        assert_eq!(err.error_type, AgentRuntimeErrorType::ProviderBizError);
    }

    #[tokio::test]
    async fn env_gated_smoke_collect_text_if_key_present() {
        if std::env::var("OPENAI_API_KEY")
            .unwrap_or_default()
            .trim()
            .is_empty()
        {
            eprintln!("skipping OpenAI smoke test (OPENAI_API_KEY missing)");
            return;
        }

        let descriptor = crate::config::ProviderConfig::from_env("openai", ProviderKind::OpenAi)
            .expect("config")
            .into_descriptor()
            .expect("descriptor");
        let runtime = create_runtime(descriptor).expect("runtime");
        let payload = ChatStreamPayload::new(
            "gpt-4o-mini",
            vec![
                ChatMessage::system("Return exactly the word: ok"),
                ChatMessage::user("ok"),
            ],
        );
        let result = runtime
            .chat(&payload, ChatOptions::default().timeout(std::time::Duration::from_secs(30)))
            .await
            .expect("chat")
            .collect()
            .await;
        assert!(result.is_ok(), "OpenAI smoke failed: {result:?}");
    }
}
