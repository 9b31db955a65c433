//! Model-id based dispatch over several sub-runtimes.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{AgentRuntimeError, ConfigError};
use crate::factory::{RuntimeDescriptor, create_runtime};
use crate::model::{ChatOptions, ModelCard, ProviderId};
use crate::payload::{ChatStreamPayload, ImageResult, TextToImagePayload};
use crate::pipeline::ChatStream;
use crate::runtime::Runtime;

/// Where a route's runtime comes from.
#[derive(Clone)]
pub enum RouteTarget {
    /// Built lazily with `create_runtime` on first use.
    Descriptor(RuntimeDescriptor),
    Runtime(Arc<dyn Runtime>),
}

/// Which model ids a route serves.
#[derive(Clone, Debug)]
pub enum ModelMapping {
    Static(Vec<String>),
    /// The sub-runtime's own `models()`, cached after the first success.
    Fetched,
}

pub struct Route {
    target: RouteTarget,
    mapping: ModelMapping,
    runtime: once_cell::sync::OnceCell<Arc<dyn Runtime>>,
    fetched: tokio::sync::OnceCell<Vec<ModelCard>>,
}

impl Route {
    pub fn new(target: RouteTarget, mapping: ModelMapping) -> Self {
        Self {
            target,
            mapping,
            runtime: once_cell::sync::OnceCell::new(),
            fetched: tokio::sync::OnceCell::new(),
        }
    }

    /// Route to a descriptor serving a fixed model list.
    pub fn with_models(descriptor: RuntimeDescriptor, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(
            RouteTarget::Descriptor(descriptor),
            ModelMapping::Static(models.into_iter().map(Into::into).collect()),
        )
    }

    /// Route whose model list is fetched from the runtime itself.
    pub fn fetched(target: RouteTarget) -> Self {
        Self::new(target, ModelMapping::Fetched)
    }

    fn runtime(&self) -> Result<Arc<dyn Runtime>, AgentRuntimeError> {
        self.runtime
            .get_or_try_init(|| match &self.target {
                RouteTarget::Runtime(runtime) => Ok(runtime.clone()),
                RouteTarget::Descriptor(descriptor) => {
                    let runtime = create_runtime(descriptor.clone())?;
                    Ok(Arc::new(runtime) as Arc<dyn Runtime>)
                }
            })
            .cloned()
    }

    async fn cards(&self) -> Result<Vec<ModelCard>, AgentRuntimeError> {
        match &self.mapping {
            ModelMapping::Static(models) => Ok(models.iter().map(ModelCard::new).collect()),
            ModelMapping::Fetched => {
                let runtime = self.runtime()?;
                self.fetched
                    .get_or_try_init(|| async move { runtime.models().await })
                    .await
                    .cloned()
            }
        }
    }

    async fn serves(&self, model: &str) -> bool {
        match &self.mapping {
            ModelMapping::Static(models) => models.iter().any(|m| m == model),
            ModelMapping::Fetched => match self.cards().await {
                Ok(cards) => cards.iter().any(|card| card.id == model),
                Err(err) => {
                    warn!(error = %err, "route model listing failed; skipping route");
                    false
                }
            },
        }
    }
}

/// Runtime that resolves each model id to the first route serving it.
pub struct RouterRuntime {
    id: ProviderId,
    routes: Vec<Route>,
}

impl RouterRuntime {
    /// Fails when `routes` is empty.
    pub fn new(id: impl Into<ProviderId>, routes: Vec<Route>) -> Result<Self, ConfigError> {
        let id = id.into();
        if routes.is_empty() {
            return Err(ConfigError::EmptyRoutes(id));
        }
        Ok(Self { id, routes })
    }

    /// Sub-runtime for `model`, or `ModelNotFound` without any upstream call
    /// for statically mapped routes.
    pub async fn resolve(&self, model: &str) -> Result<Arc<dyn Runtime>, AgentRuntimeError> {
        for (index, route) in self.routes.iter().enumerate() {
            if route.serves(model).await {
                debug!(router = %self.id, model, route = index, "model routed");
                return route.runtime();
            }
        }
        Err(AgentRuntimeError::model_not_found(self.id.clone(), model))
    }
}

#[async_trait::async_trait]
impl Runtime for RouterRuntime {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    async fn chat(
        &self,
        payload: &ChatStreamPayload,
        options: ChatOptions,
    ) -> Result<ChatStream, AgentRuntimeError> {
        self.resolve(&payload.model).await?.chat(payload, options).await
    }

    /// Union of every route's models, first occurrence wins. Routes whose
    /// listing fails are left out.
    async fn models(&self) -> Result<Vec<ModelCard>, AgentRuntimeError> {
        let mut seen = HashSet::new();
        let mut cards = Vec::new();
        for (index, route) in self.routes.iter().enumerate() {
            let route_cards = match route.cards().await {
                Ok(route_cards) => route_cards,
                Err(err) => {
                    warn!(router = %self.id, route = index, error = %err, "route model listing failed");
                    continue;
                }
            };
            for card in route_cards {
                if seen.insert(card.id.clone()) {
                    cards.push(card);
                }
            }
        }
        Ok(cards)
    }

    async fn text_to_image(
        &self,
        payload: &TextToImagePayload,
    ) -> Result<Vec<ImageResult>, AgentRuntimeError> {
        self.resolve(&payload.model).await?.text_to_image(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentRuntimeErrorType;
    use crate::transformers::ProviderKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRuntime {
        id: ProviderId,
        models: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Runtime for CountingRuntime {
        fn id(&self) -> ProviderId {
            self.id.clone()
        }

        async fn chat(
            &self,
            _payload: &ChatStreamPayload,
            _options: ChatOptions,
        ) -> Result<ChatStream, AgentRuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentRuntimeError::biz(self.id.clone(), "not reached in these tests"))
        }

        async fn models(&self) -> Result<Vec<ModelCard>, AgentRuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.models.iter().copied().map(ModelCard::new).collect())
        }

        async fn text_to_image(
            &self,
            _payload: &TextToImagePayload,
        ) -> Result<Vec<ImageResult>, AgentRuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn counting(id: &str, models: Vec<&'static str>) -> (Arc<AtomicUsize>, Arc<dyn Runtime>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = Arc::new(CountingRuntime {
            id: ProviderId::new(id),
            models,
            calls: calls.clone(),
        });
        (calls, runtime)
    }

    #[test]
    fn empty_routes_are_rejected() {
        let err = RouterRuntime::new("router", Vec::new()).err().expect("empty");
        assert!(err.to_string().contains("empty providers"));
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let (first_calls, first) = counting("first", vec![]);
        let (second_calls, second) = counting("second", vec![]);
        let router = RouterRuntime::new(
            "router",
            vec![
                Route::new(RouteTarget::Runtime(first), ModelMapping::Static(vec!["gpt-4o".into()])),
                Route::new(RouteTarget::Runtime(second), ModelMapping::Static(vec!["gpt-4o".into(), "llama3".into()])),
            ],
        )
        .expect("router");

        let resolved = router.resolve("gpt-4o").await.expect("route");
        assert_eq!(resolved.id(), ProviderId::new("first"));
        let resolved = router.resolve("llama3").await.expect("route");
        assert_eq!(resolved.id(), ProviderId::new("second"));
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmapped_model_is_model_not_found_without_upstream_call() {
        let (calls, runtime) = counting("only", vec![]);
        let router = RouterRuntime::new(
            "router",
            vec![Route::new(RouteTarget::Runtime(runtime), ModelMapping::Static(vec!["a".into()]))],
        )
        .expect("router");
        let err = router
            .text_to_image(&TextToImagePayload::new("b", "cat"))
            .await
            .expect_err("unmapped");
        assert_eq!(err.error_type, AgentRuntimeErrorType::ModelNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetched_mapping_is_cached() {
        let (calls, runtime) = counting("fetched", vec!["m1", "m2"]);
        let router = RouterRuntime::new("router", vec![Route::fetched(RouteTarget::Runtime(runtime))])
            .expect("router");
        router.resolve("m1").await.expect("m1");
        router.resolve("m2").await.expect("m2");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn models_are_deduplicated_union() {
        let (_, fetched) = counting("fetched", vec!["shared", "extra"]);
        let router = RouterRuntime::new(
            "router",
            vec![
                Route::with_models(
                    RuntimeDescriptor::new("local", ProviderKind::Ollama),
                    ["llama3", "shared"],
                ),
                Route::fetched(RouteTarget::Runtime(fetched)),
            ],
        )
        .expect("router");
        let ids: Vec<String> = router
            .models()
            .await
            .expect("models")
            .into_iter()
            .map(|card| card.id)
            .collect();
        assert_eq!(ids, vec!["llama3", "shared", "extra"]);
    }

    #[tokio::test]
    async fn descriptor_route_is_built_once() {
        let router = RouterRuntime::new(
            "router",
            vec![Route::with_models(
                RuntimeDescriptor::new("local", ProviderKind::Ollama),
                ["llama3"],
            )],
        )
        .expect("router");
        let a = router.resolve("llama3").await.expect("route");
        let b = router.resolve("llama3").await.expect("route");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
