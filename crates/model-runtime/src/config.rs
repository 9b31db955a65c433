//! Provider configuration from the environment or a JSON document.

use std::path::Path;
use std::sync::Arc;

use crate::errors::ConfigError;
use crate::factory::{RuntimeDescriptor, create_runtime};
use crate::model::ProviderId;
use crate::registry::RuntimeRegistry;
use crate::router::{ModelMapping, Route, RouteTarget};
use crate::runtime::Runtime;
use crate::transformers::ProviderKind;

/// Configuration for one provider runtime.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub kind: ProviderKind,
    /// Overrides the dialect's default endpoint (proxies, local servers).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key, read when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models served by this provider when it is used as a router route.
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_usage: bool,
    #[serde(default)]
    pub debug: bool,
}

impl ProviderConfig {
    pub fn new(id: impl Into<ProviderId>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            base_url: None,
            api_key: None,
            api_key_env: None,
            models: None,
            exclude_usage: false,
            debug: false,
        }
    }

    /// Builds a config from `<ID>_API_KEY` and `<ID>_BASE_URL`.
    ///
    /// The key is required for dialects that authenticate.
    pub fn from_env(id: impl Into<ProviderId>, kind: ProviderKind) -> Result<Self, ConfigError> {
        let mut config = Self::new(id, kind);
        let prefix = env_prefix(&config.id);
        let key_var = format!("{prefix}_API_KEY");
        let api_key = std::env::var(&key_var).unwrap_or_default();
        if api_key.trim().is_empty() {
            if kind.requires_api_key() {
                return Err(ConfigError::MissingEnv(key_var));
            }
        } else {
            config.api_key = Some(api_key);
        }
        config.base_url = std::env::var(format!("{prefix}_BASE_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty());
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.clone()));
        }
        match &self.api_key_env {
            Some(var) => std::env::var(var)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(Some)
                .ok_or_else(|| ConfigError::MissingEnv(var.clone())),
            None => Ok(None),
        }
    }

    /// Descriptor for `create_runtime`.
    ///
    /// Debug logging is on when `debug` is set or when
    /// `DEBUG_<ID>_CHAT_COMPLETION=1` at call time.
    pub fn into_descriptor(self) -> Result<RuntimeDescriptor, ConfigError> {
        let api_key = self.resolve_api_key()?;
        let debug_var = format!("DEBUG_{}_CHAT_COMPLETION", env_prefix(&self.id));
        let always = self.debug;
        let mut descriptor = RuntimeDescriptor::new(self.id, self.kind)
            .exclude_usage(self.exclude_usage)
            .debug(move || always || std::env::var(&debug_var).is_ok_and(|v| v.trim() == "1"));
        if let Some(base_url) = self.base_url {
            descriptor = descriptor.base_url(base_url);
        }
        if let Some(api_key) = api_key {
            descriptor = descriptor.api_key(api_key);
        }
        Ok(descriptor)
    }
}

/// A router over previously configured providers, tried in order.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RouterConfig {
    pub id: ProviderId,
    pub routes: Vec<ProviderId>,
}

/// Whole-process runtime configuration.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
}

impl RuntimeConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Providers from the environment for every known default id whose key
    /// is present (`OPENAI_*`), plus a local Ollama.
    pub fn from_env() -> Self {
        let mut providers = Vec::new();
        if let Ok(openai) = ProviderConfig::from_env("openai", ProviderKind::OpenAi) {
            providers.push(openai);
        }
        if let Ok(ollama) = ProviderConfig::from_env("ollama", ProviderKind::Ollama) {
            providers.push(ollama);
        }
        Self {
            providers,
            routers: Vec::new(),
        }
    }

    /// Creates every runtime, then every router over them.
    pub fn into_registry(self) -> Result<RuntimeRegistry, ConfigError> {
        let mut builder = RuntimeRegistry::builder();
        let mut built: Vec<(ProviderId, Option<Vec<String>>, Arc<dyn Runtime>)> = Vec::new();
        for provider in self.providers {
            let models = provider.models.clone();
            let runtime: Arc<dyn Runtime> = Arc::new(create_runtime(provider.into_descriptor()?)?);
            builder = builder.register_runtime(runtime.clone());
            built.push((runtime.id(), models, runtime));
        }

        for router in self.routers {
            let mut routes = Vec::with_capacity(router.routes.len());
            for provider in &router.routes {
                let Some((_, models, runtime)) = built.iter().find(|(id, _, _)| id == provider) else {
                    return Err(ConfigError::UnknownProvider {
                        router: router.id.clone(),
                        provider: provider.clone(),
                    });
                };
                let mapping = match models {
                    Some(models) => ModelMapping::Static(models.clone()),
                    None => ModelMapping::Fetched,
                };
                routes.push(Route::new(RouteTarget::Runtime(runtime.clone()), mapping));
            }
            builder = builder.register_router(router.id, routes);
        }
        builder.build()
    }
}

/// `my-proxy` → `MY_PROXY`.
fn env_prefix(id: &ProviderId) -> String {
    id.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "providers": [
            {"id": "openai", "kind": "openai", "api_key": "sk-test", "models": ["gpt-4o-mini"]},
            {"id": "local", "kind": "ollama", "base_url": "http://localhost:11434", "models": ["llama3"]}
        ],
        "routers": [{"id": "auto", "routes": ["openai", "local"]}]
    }"#;

    #[test]
    fn parses_json_document() {
        let config = RuntimeConfig::from_json_str(SAMPLE).expect("config");
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].kind, ProviderKind::Ollama);
        assert!(!config.providers[0].exclude_usage);
        assert_eq!(config.routers[0].routes[1], ProviderId::new("local"));
    }

    #[test]
    fn invalid_json_is_config_error() {
        assert!(matches!(
            RuntimeConfig::from_json_str("{\"providers\": 3}"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn registry_contains_providers_and_routers() {
        let registry = RuntimeConfig::from_json_str(SAMPLE)
            .expect("config")
            .into_registry()
            .expect("registry");
        assert_eq!(registry.len(), 3);
        let router = registry.get(&ProviderId::new("auto")).expect("router");
        let ids: Vec<String> = router
            .models()
            .await
            .expect("models")
            .into_iter()
            .map(|card| card.id)
            .collect();
        assert_eq!(ids, vec!["gpt-4o-mini", "llama3"]);
    }

    #[test]
    fn router_with_unknown_provider_is_rejected() {
        let config = RuntimeConfig {
            providers: Vec::new(),
            routers: vec![RouterConfig {
                id: ProviderId::new("auto"),
                routes: vec![ProviderId::new("ghost")],
            }],
        };
        assert!(matches!(
            config.into_registry(),
            Err(ConfigError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn missing_env_key_is_reported_by_name() {
        let err = ProviderConfig::from_env("unit-test-absent", ProviderKind::OpenAi).expect_err("missing");
        assert_eq!(err, ConfigError::MissingEnv("UNIT_TEST_ABSENT_API_KEY".into()));
    }

    #[test]
    fn descriptor_carries_key_and_base_url() {
        let descriptor = ProviderConfig::new("proxy", ProviderKind::OpenAi)
            .api_key("sk-1")
            .base_url("http://localhost:8080/v1")
            .into_descriptor()
            .expect("descriptor");
        assert_eq!(descriptor.api_key.as_deref(), Some("sk-1"));
        assert_eq!(descriptor.resolved_base_url(), "http://localhost:8080/v1");
    }
}
