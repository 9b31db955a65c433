use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{AgentRuntimeError, ConfigError};
use crate::factory::{RuntimeDescriptor, create_runtime};
use crate::model::ProviderId;
use crate::router::{Route, RouterRuntime};
use crate::runtime::Runtime;

/// Runtimes registered at process start, looked up by provider id.
#[derive(Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<ProviderId, Arc<dyn Runtime>>,
    order: Vec<ProviderId>,
}

impl RuntimeRegistry {
    /// Starts a builder for registering descriptors, runtimes, and routers.
    pub fn builder() -> RuntimeRegistryBuilder {
        RuntimeRegistryBuilder::default()
    }

    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn Runtime>> {
        self.runtimes.get(id).cloned()
    }

    /// Like `get`, with a normalized error for unknown ids.
    pub fn runtime(&self, id: &ProviderId) -> Result<Arc<dyn Runtime>, AgentRuntimeError> {
        self.get(id)
            .ok_or_else(|| AgentRuntimeError::biz(id.clone(), format!("provider {id} is not registered")))
    }

    /// Provider ids in registration order.
    pub fn ids(&self) -> &[ProviderId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

enum Registration {
    Descriptor(RuntimeDescriptor),
    Runtime(Arc<dyn Runtime>),
    Router(ProviderId, Vec<Route>),
}

/// Builder used to register runtimes before creating a `RuntimeRegistry`.
#[derive(Default)]
pub struct RuntimeRegistryBuilder {
    registrations: Vec<Registration>,
}

impl RuntimeRegistryBuilder {
    /// Registers a descriptor; the runtime is created in `build`.
    pub fn register(mut self, descriptor: RuntimeDescriptor) -> Self {
        self.registrations.push(Registration::Descriptor(descriptor));
        self
    }

    /// Registers an already constructed runtime.
    pub fn register_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.registrations.push(Registration::Runtime(runtime));
        self
    }

    /// Registers a router under `id`.
    pub fn register_router(mut self, id: impl Into<ProviderId>, routes: Vec<Route>) -> Self {
        self.registrations.push(Registration::Router(id.into(), routes));
        self
    }

    /// Builds every runtime and rejects duplicate ids.
    pub fn build(self) -> Result<RuntimeRegistry, ConfigError> {
        let mut runtimes: HashMap<ProviderId, Arc<dyn Runtime>> = HashMap::new();
        let mut order = Vec::new();
        for registration in self.registrations {
            let runtime: Arc<dyn Runtime> = match registration {
                Registration::Descriptor(descriptor) => Arc::new(create_runtime(descriptor)?),
                Registration::Runtime(runtime) => runtime,
                Registration::Router(id, routes) => Arc::new(RouterRuntime::new(id, routes)?),
            };
            let id = runtime.id();
            if runtimes.contains_key(&id) {
                return Err(ConfigError::DuplicateProvider(id));
            }
            order.push(id.clone());
            runtimes.insert(id, runtime);
        }
        Ok(RuntimeRegistry { runtimes, order })
    }
}
