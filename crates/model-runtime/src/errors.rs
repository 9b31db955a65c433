use std::fmt;

use crate::model::ProviderId;

/// Closed set of failure kinds surfaced to callers.
///
/// Every vendor failure is mapped onto one of these before it leaves the
/// runtime; `ProviderBizError` is the catch-all and always keeps the raw body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AgentRuntimeErrorType {
    #[serde(rename = "InvalidAPIKey")]
    InvalidApiKey,
    InsufficientQuota,
    QuotaLimitReached,
    ModelNotFound,
    ExceededContextWindow,
    PermissionDenied,
    ServiceUnavailable,
    NetworkError,
    /// The caller's deadline fired before completion.
    Timeout,
    /// The abort signal fired.
    Cancelled,
    /// Opaque vendor failure, also used for protocol violations.
    ProviderBizError,
}

impl AgentRuntimeErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "InvalidAPIKey",
            Self::InsufficientQuota => "InsufficientQuota",
            Self::QuotaLimitReached => "QuotaLimitReached",
            Self::ModelNotFound => "ModelNotFound",
            Self::ExceededContextWindow => "ExceededContextWindow",
            Self::PermissionDenied => "PermissionDenied",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::NetworkError => "NetworkError",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::ProviderBizError => "ProviderBizError",
        }
    }
}

impl fmt::Display for AgentRuntimeErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure returned by every runtime operation and carried by
/// `error` chunks.
///
/// Serializes as `{"errorType", "provider", "body", "message"}`.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{error_type} ({provider}): {message}")]
pub struct AgentRuntimeError {
    #[serde(rename = "errorType")]
    pub error_type: AgentRuntimeErrorType,
    pub provider: ProviderId,
    /// Raw vendor body (parsed JSON when possible, otherwise a string).
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    pub message: String,
}

impl AgentRuntimeError {
    pub fn new(
        error_type: AgentRuntimeErrorType,
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            provider: provider.into(),
            body: None,
            message: message.into(),
        }
    }

    /// Attaches the raw vendor body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Protocol violation or opaque vendor failure.
    pub fn biz(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::new(AgentRuntimeErrorType::ProviderBizError, provider, message)
    }

    pub fn cancelled(provider: impl Into<ProviderId>) -> Self {
        Self::new(AgentRuntimeErrorType::Cancelled, provider, "request aborted")
    }

    pub fn timeout(provider: impl Into<ProviderId>) -> Self {
        Self::new(
            AgentRuntimeErrorType::Timeout,
            provider,
            "deadline elapsed before completion",
        )
    }

    pub fn model_not_found(provider: impl Into<ProviderId>, model: &str) -> Self {
        Self::new(
            AgentRuntimeErrorType::ModelNotFound,
            provider,
            format!("model not found: {model}"),
        )
        .with_body(serde_json::json!({ "model": model }))
    }

    pub fn kind(&self) -> AgentRuntimeErrorType {
        self.error_type
    }
}

/// Startup failures: registration, routing tables, configuration loading.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Two runtimes were registered under the same id.
    #[error("duplicate provider registration: {0}")]
    DuplicateProvider(ProviderId),
    /// A router was created without any route.
    #[error("router {0} has empty providers")]
    EmptyRoutes(ProviderId),
    /// A router references a provider that was never configured.
    #[error("router {router} references unknown provider {provider}")]
    UnknownProvider {
        router: ProviderId,
        provider: ProviderId,
    },
    /// A required environment variable is missing or blank.
    #[error("missing environment variable {0}")]
    MissingEnv(String),
    /// Configuration text could not be parsed.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// A registered descriptor could not be turned into a runtime.
    #[error(transparent)]
    Runtime(#[from] AgentRuntimeError),
}
