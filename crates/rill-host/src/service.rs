//! The contract services implement and the scaffolding the host hands them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rill_core::{Clock, ConfigNode, CoreError, Result, Uri, id};

use crate::context::{Access, HandlerFn};
use crate::feature::{Blueprint, FeatureDescriptor, ParamSpec, Stage, Translator};
use crate::plug::{EndpointRouter, Plug};

/// Service keys gating internal and private features.
#[derive(Debug, Clone)]
pub struct AccessKeys {
    pub internal: String,
    pub private: String,
}

impl AccessKeys {
    pub fn generate() -> Self {
        Self {
            internal: id::access_key(),
            private: id::access_key(),
        }
    }

    /// Access level a presented key grants.
    pub fn level_for(&self, key: &str) -> Access {
        if key == self.private {
            Access::Private
        } else if key == self.internal {
            Access::Internal
        } else {
            Access::Public
        }
    }
}

/// Per-service state container handed to the service at start.
#[derive(Clone)]
pub struct ServiceContext {
    pub self_uri: Uri,
    pub owner_uri: Option<Uri>,
    pub config: ConfigNode,
    pub access_keys: AccessKeys,
    /// Plug at the service's private storage mount, when configured.
    pub storage: Option<Plug>,
    router: Arc<EndpointRouter>,
    clock: Arc<dyn Clock>,
}

impl ServiceContext {
    pub fn new(
        self_uri: Uri,
        owner_uri: Option<Uri>,
        config: ConfigNode,
        access_keys: AccessKeys,
        storage: Option<Plug>,
        router: Arc<EndpointRouter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            self_uri,
            owner_uri,
            config,
            access_keys,
            storage,
            router,
            clock,
        }
    }

    pub fn plug(&self, uri: &Uri) -> Plug {
        Plug::new(self.router.clone(), uri.clone())
    }

    /// Plug at the service's own address, carrying its internal key.
    pub fn self_plug(&self) -> Plug {
        Plug::new(self.router.clone(), self.self_uri.clone())
            .with_header(rill_core::headers::SERVICE_KEY, &self.access_keys.internal)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn router(&self) -> Arc<EndpointRouter> {
        self.router.clone()
    }
}

/// A declared feature with its bound handler, collected during setup.
pub struct FeatureDef {
    pub verb: String,
    pub signature: String,
    pub method: String,
    pub access: Access,
    pub handler: HandlerFn,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
}

impl FeatureDef {
    pub fn access(&mut self, access: Access) -> &mut Self {
        self.access = access;
        self
    }

    pub fn describe(&mut self, description: &str) -> &mut Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn param(&mut self, name: &str, description: &str) -> &mut Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            description: Some(description.to_string()),
        });
        self
    }

    pub fn descriptor(&self) -> FeatureDescriptor {
        FeatureDescriptor {
            verb: self.verb.clone(),
            signature: self.signature.clone(),
            method: self.method.clone(),
            access: self.access,
            params: self.params.clone(),
            description: self.description.clone(),
        }
    }
}

/// Collector the host passes to [`Service::setup`].
#[derive(Default)]
pub struct ServiceSetup {
    pub(crate) features: Vec<FeatureDef>,
    pub(crate) prologues: Vec<Stage>,
    pub(crate) epilogues: Vec<Stage>,
    pub(crate) translators: Vec<Translator>,
}

impl ServiceSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a feature. Returns the definition for fluent refinement.
    pub fn feature(
        &mut self,
        verb: &str,
        signature: &str,
        method: &str,
        handler: HandlerFn,
    ) -> &mut FeatureDef {
        self.features.push(FeatureDef {
            verb: verb.to_ascii_uppercase(),
            signature: signature.to_string(),
            method: method.to_string(),
            access: Access::Public,
            handler,
            description: None,
            params: Vec::new(),
        });
        self.features.last_mut().unwrap()
    }

    /// A prologue run before the main stage of every feature of the service.
    pub fn prologue(&mut self, name: &str, access: Access, handler: HandlerFn) {
        self.prologues.push(Stage {
            name: name.to_string(),
            access,
            handler,
        });
    }

    /// An epilogue run after the main stage of every feature of the service.
    pub fn epilogue(&mut self, name: &str, access: Access, handler: HandlerFn) {
        self.epilogues.push(Stage {
            name: name.to_string(),
            access,
            handler,
        });
    }

    /// An exception translator attached to every feature of the service.
    pub fn translator(&mut self, translator: Translator) {
        self.translators.push(translator);
    }
}

/// Contract services implement.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Implementation tag recorded in the blueprint.
    fn class(&self) -> &str;

    /// Service ids this implementation answers to.
    fn sids(&self) -> Vec<Uri> {
        Vec::new()
    }

    /// Declare features and per-service stages.
    fn setup(self: Arc<Self>, setup: &mut ServiceSetup);

    /// Start contract, invoked with the service's context after its
    /// features are installed.
    async fn start(&self, ctx: &ServiceContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn stop(&self) {}
}

/// Factory producing a service instance from its configuration.
pub type ServiceFactory = Arc<dyn Fn(&ConfigNode) -> Result<Arc<dyn Service>> + Send + Sync>;

/// Explicit activator registry: services are registered by sid or class
/// name through an adapter enumerating a known manifest. No runtime
/// scanning.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: RwLock<HashMap<String, ServiceFactory>>,
    manifests: RwLock<HashMap<String, Vec<Blueprint>>>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F>(&self, key: &str, factory: F)
    where
        F: Fn(&ConfigNode) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), Arc::new(factory));
    }

    pub fn create(&self, key: &str, config: &ConfigNode) -> Result<Arc<dyn Service>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("no service registered for '{key}'")))?;
        factory(config)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Register a named manifest of blueprints, loadable via `POST load`.
    pub fn register_manifest(&self, name: &str, blueprints: Vec<Blueprint>) {
        self.manifests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), blueprints);
    }

    pub fn manifest(&self, name: &str) -> Option<Vec<Blueprint>> {
        self.manifests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}
