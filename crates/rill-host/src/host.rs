//! The request host: service registry, admission, reentrancy accounting,
//! alias memoization and dispatch into feature pipelines.

use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use rill_core::{
    Clock, ConfigNode, CoreError, Message, Result, Uri, headers, id, status,
};
use time::OffsetDateTime;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::context::{Access, Context};
use crate::directory::{FeatureDirectory, Resolution};
use crate::feature::{Blueprint, Feature, Signature, Stage};
use crate::host_features::HostService;
use crate::pipeline;
use crate::plug::{Endpoint, EndpointRouter, Plug};
use crate::service::{AccessKeys, Service, ServiceContext, ServiceRegistry, ServiceSetup};
use crate::stages::{CodecRegistry, default_epilogue, default_prologue};

pub const DEFAULT_CONNECT_LIMIT: usize = 64;
pub const DEFAULT_REENTRANCY_LIMIT: usize = 20;

/// A running service recorded by the host.
pub struct ServiceEntry {
    pub path: Vec<String>,
    pub self_uri: Uri,
    pub owner_uri: Option<Uri>,
    pub sid: Option<Uri>,
    pub blueprint: Blueprint,
    pub access_keys: AccessKeys,
    pub storage_uri: Option<Uri>,
    service: Arc<dyn Service>,
}

/// The in-process request host.
///
/// Owns service entries exclusively; services reference the host only
/// through the narrow plumbing in their [`ServiceContext`].
pub struct Host {
    guid: String,
    uri: Uri,
    public_uri: RwLock<Uri>,
    api_key: String,
    admission: Arc<Semaphore>,
    connect_limit: usize,
    reentrancy_limit: usize,
    in_flight: DashMap<String, Vec<Uri>>,
    aliases: RwLock<Vec<Uri>>,
    memorize_aliases: bool,
    directory: RwLock<FeatureDirectory>,
    services: RwLock<Vec<Arc<ServiceEntry>>>,
    blueprints: RwLock<IndexMap<String, Blueprint>>,
    resources: RwLock<IndexMap<String, (String, Vec<u8>)>>,
    registry: Arc<ServiceRegistry>,
    codecs: Arc<CodecRegistry>,
    router: Arc<EndpointRouter>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Sender<bool>,
    started_at: OffsetDateTime,
}

impl Host {
    /// Build a host, register it with the endpoint router and install its
    /// own administration service at `dream.host.path` (default `host`).
    pub async fn start(
        config: ConfigNode,
        registry: Arc<ServiceRegistry>,
        router: Arc<EndpointRouter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let guid = config
            .at("dream.guid")
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(id::host_guid);
        let api_key = config
            .at("dream.apikey")
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(id::access_key);
        let public_uri = match config.at("uri.public").as_str() {
            Some(s) => Uri::parse(s)?,
            None => Uri::parse("http://localhost:8081")?,
        };
        let connect_limit = config.child("connect-limit").u64_or(DEFAULT_CONNECT_LIMIT as u64) as usize;
        let reentrancy_limit =
            config.child("reentrancy-limit").u64_or(DEFAULT_REENTRANCY_LIMIT as u64) as usize;
        let memorize_aliases = config.child("memorize-aliases").bool_or(true);

        let (shutdown, _) = watch::channel(false);
        let host = Arc::new(Self {
            uri: Uri::local(&guid),
            guid: guid.clone(),
            public_uri: RwLock::new(public_uri),
            api_key,
            admission: Arc::new(Semaphore::new(connect_limit)),
            connect_limit,
            reentrancy_limit,
            in_flight: DashMap::new(),
            aliases: RwLock::new(Vec::new()),
            memorize_aliases,
            directory: RwLock::new(FeatureDirectory::new()),
            services: RwLock::new(Vec::new()),
            blueprints: RwLock::new(IndexMap::new()),
            resources: RwLock::new(IndexMap::new()),
            registry,
            codecs: CodecRegistry::new(),
            router: router.clone(),
            clock: clock.clone(),
            shutdown,
            started_at: clock.now(),
        });

        router.register_local(
            &guid,
            Arc::new(HostEndpoint {
                host: Arc::downgrade(&host),
            }),
        );

        let host_path = config
            .at("dream.host.path")
            .as_str()
            .unwrap_or("host")
            .to_string();
        let host_service: Arc<dyn Service> = Arc::new(HostService::new(Arc::downgrade(&host)));
        host.install(&host_path, host_service, ConfigNode::empty(), None, None)
            .await?;

        info!(guid = %host.guid, public = %host.public_uri.read().unwrap_or_else(|e| e.into_inner()), "host started");
        Ok(host)
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// The host's `local://<guid>` root.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn router(&self) -> Arc<EndpointRouter> {
        self.router.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn codecs(&self) -> Arc<CodecRegistry> {
        self.codecs.clone()
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    pub fn public_uri(&self) -> Uri {
        self.public_uri
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// A plug at the host root.
    pub fn self_plug(&self) -> Plug {
        Plug::new(self.router.clone(), self.uri.clone())
    }

    /// Register an embedded resource served under `resources/<name>`.
    pub fn add_resource(&self, name: &str, content_type: &str, bytes: Vec<u8>) {
        self.resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), (content_type.to_string(), bytes));
    }

    pub(crate) fn resource(&self, name: &str) -> Option<(String, Vec<u8>)> {
        self.resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Rewrite a public or transport URI to the host's `local://` form.
    ///
    /// Unknown transport prefixes map by path, which is also what admits the
    /// very first request before any alias is memoized.
    pub fn localize(&self, uri: &Uri) -> Uri {
        if uri.is_local() {
            return uri.clone();
        }
        let mut prefixes = vec![self.public_uri()];
        prefixes.extend(
            self.aliases
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned(),
        );
        for prefix in prefixes {
            if uri.starts_with(&prefix) {
                return self.relocate(uri, prefix.segments().len());
            }
        }
        self.relocate(uri, 0)
    }

    fn relocate(&self, uri: &Uri, skip: usize) -> Uri {
        let mut local = Uri::local(&self.guid)
            .with_segments(uri.segments()[skip.min(uri.segments().len())..].to_vec());
        for (k, v) in uri.query_pairs() {
            local = local.with(k, v);
        }
        local
    }

    /// Memoize an observed transport prefix as an alias of this host.
    pub fn memoize_alias(&self, prefix: &Uri) {
        if !self.memorize_aliases || prefix.is_local() {
            return;
        }
        let prefix = prefix.base();
        let mut aliases = self.aliases.write().unwrap_or_else(|e| e.into_inner());
        if !aliases.contains(&prefix) && prefix != self.public_uri() {
            debug!(alias = %prefix, "memoized alias");
            aliases.push(prefix);
        }
    }

    pub fn aliases(&self) -> Vec<Uri> {
        self.aliases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Canonical public URI for a request, honoring `X-Forwarded-Host`,
    /// `Host`, `Front-End-Https` and the `dream.in.*` query overrides.
    pub fn public_uri_for_request(&self, request: &Message, uri: &Uri) -> Uri {
        if let Some(full) = uri.query("dream.in.uri") {
            if let Ok(parsed) = Uri::parse(full) {
                return parsed;
            }
        }
        let mut public = self.public_uri();
        if let Some(host) = uri
            .query("dream.in.host")
            .or_else(|| request.headers.get(headers::FORWARDED_HOST))
            .or_else(|| request.headers.get(headers::HOST))
        {
            match host.rsplit_once(':').and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p))) {
                Some((h, p)) => public = public.with_host(h).with_port(p),
                None => public = public.with_host(host),
            }
        }
        if let Some(scheme) = uri.query("dream.in.scheme") {
            public = public.with_scheme(scheme);
        } else if request
            .headers
            .get(headers::FRONT_END_HTTPS)
            .is_some_and(|v| v.eq_ignore_ascii_case("on"))
        {
            public = public.with_scheme("https");
        }
        public
    }

    /// Submit a request. Externally originated requests pass admission;
    /// `local://` callers bypass the semaphore.
    pub async fn submit(self: &Arc<Self>, verb: &str, uri: Uri, mut request: Message) -> Message {
        let external = !uri.is_local();
        let local_uri = self.localize(&uri);
        if external {
            // Remember both the transport prefix and the forwarded public
            // form so later requests resolve as local addresses.
            self.memoize_alias(&uri);
            self.memoize_alias(&self.public_uri_for_request(&request, &uri));
        }

        // Admission gate. Queued until a slot frees; shutdown drains the
        // queue with 503s.
        let _permit = if external {
            match self.admission.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return Message::error(status::SERVICE_UNAVAILABLE, "host is shutting down");
                }
            }
        } else {
            None
        };

        let request_id = match request.request_id() {
            Some(existing) => existing.to_string(),
            None => {
                let generated = id::request_id();
                request.set_request_id(&generated);
                generated
            }
        };

        // Reentrancy accounting: a request id may not exceed the hop limit.
        {
            let mut hops = self.in_flight.entry(request_id.clone()).or_default();
            if hops.len() >= self.reentrancy_limit {
                drop(hops);
                warn!(request_id = %request_id, "reentrancy limit exceeded");
                let mut reply = CoreError::Reentrancy(request_id.clone()).response();
                reply.set_request_id(&request_id);
                return reply;
            }
            hops.push(local_uri.clone());
        }

        let mut response = self.dispatch(verb, &local_uri, request).await;

        // Drop this hop; the entry goes away with its last hop.
        if let Some(mut hops) = self.in_flight.get_mut(&request_id) {
            if let Some(pos) = hops.iter().position(|u| u == &local_uri) {
                hops.remove(pos);
            }
            let empty = hops.is_empty();
            drop(hops);
            if empty {
                self.in_flight.remove_if(&request_id, |_, v| v.is_empty());
            }
        }

        response.set_request_id(&request_id);
        response
    }

    async fn dispatch(self: &Arc<Self>, verb: &str, local_uri: &Uri, request: Message) -> Message {
        let resolution = {
            let directory = self.directory.read().unwrap_or_else(|e| e.into_inner());
            directory.resolve(verb, local_uri.segments())
        };

        let feature = match resolution {
            Resolution::Feature(feature) => feature,
            Resolution::Options(allow) => {
                let mut reply = Message::ok_document(serde_json::json!({ "allow": allow }));
                reply.headers.set(headers::ALLOW, allow.join(", "));
                return reply;
            }
            Resolution::MethodNotAllowed(allow) => {
                return CoreError::MethodNotAllowed {
                    verb: verb.to_string(),
                    allow,
                }
                .response();
            }
            Resolution::NotFound => {
                return Message::not_found(&format!("no feature at '{}'", local_uri.path()));
            }
        };

        let access = self.derive_access(&request, local_uri, &feature.service_path);
        let request_id = request.request_id().unwrap_or_default().to_string();
        let mut ctx = Context::new(
            request_id,
            verb.to_ascii_uppercase(),
            local_uri.clone(),
            access,
            self.router.clone(),
            self.clock.clone(),
        );
        ctx.feature_path_len = feature.service_path.len() + feature.signature.segments.len();

        pipeline::run(&feature, &ctx, request).await
    }

    /// Access level of the caller: the master api-key grants `Private`;
    /// otherwise the presented service key decides against the target
    /// service's keys.
    fn derive_access(&self, request: &Message, uri: &Uri, service_path: &[String]) -> Access {
        let presented_api_key = uri
            .query("apikey")
            .or_else(|| request.headers.get(headers::API_KEY));
        if presented_api_key == Some(self.api_key.as_str()) {
            return Access::Private;
        }

        let service_key = request
            .headers
            .get(headers::SERVICE_KEY)
            .map(str::to_string)
            .or_else(|| request.cookie("service-key").map(|c| c.value.clone()));
        if let Some(key) = service_key {
            if let Some(entry) = self.find_service_by_path(service_path) {
                return entry.access_keys.level_for(&key);
            }
        }
        Access::Public
    }

    pub fn find_service_by_path(&self, path: &[String]) -> Option<Arc<ServiceEntry>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.path == path)
            .cloned()
    }

    pub fn find_service(&self, uri: &Uri) -> Option<Arc<ServiceEntry>> {
        let local = self.localize(uri).base();
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.self_uri == local)
            .cloned()
    }

    pub fn service_entries(&self) -> Vec<Arc<ServiceEntry>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Create a service from a configuration document: `{path, sid|class,
    /// owner?, …}`. The whole document is handed to the service's start
    /// contract.
    pub async fn start_service(self: &Arc<Self>, config: ConfigNode) -> Result<Uri> {
        let path = config
            .child("path")
            .as_str()
            .ok_or_else(|| CoreError::input("service config is missing 'path'"))?
            .to_string();
        let sid_node = config.child("sid");
        let class_node = config.child("class");
        let key = sid_node
            .as_str()
            .or_else(|| class_node.as_str())
            .ok_or_else(|| CoreError::input("service config needs 'sid' or 'class'"))?
            .to_string();
        let owner = match config.child("owner").as_str() {
            Some(s) => Some(Uri::parse(s)?),
            None => None,
        };
        let sid = match config.child("sid").as_str() {
            Some(s) => Uri::parse(s).ok(),
            None => None,
        };

        let service = self.registry.create(&key, &config)?;
        self.install(&path, service, config, owner, sid).await
    }

    /// Install a service instance: register features, record the entry and
    /// run the start contract. Partial state rolls back on failure.
    pub async fn install(
        self: &Arc<Self>,
        path: &str,
        service: Arc<dyn Service>,
        config: ConfigNode,
        owner_uri: Option<Uri>,
        sid: Option<Uri>,
    ) -> Result<Uri> {
        let path_segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if path_segments.is_empty() {
            return Err(CoreError::input("service path must not be empty"));
        }
        if self.find_service_by_path(&path_segments).is_some() {
            return Err(CoreError::conflict(
                self.uri.at(path_segments.clone()).to_string(),
            ));
        }

        let self_uri = self.uri.at(path_segments.clone());
        let access_keys = AccessKeys::generate();
        let storage_uri = match config.at("storage.uri").as_str() {
            Some(s) => Some(Uri::parse(s)?),
            None => None,
        };

        let mut setup = ServiceSetup::new();
        service.clone().setup(&mut setup);

        let blueprint = Blueprint {
            sids: sid.iter().cloned().chain(service.sids()).collect(),
            class: service.class().to_string(),
            features: setup.features.iter().map(|def| def.descriptor()).collect(),
        };

        // Assemble each feature's stage array around the default stages.
        let mut features = Vec::new();
        for def in &setup.features {
            let signature = Signature::parse(&def.signature)?;
            let mut stages: Vec<Stage> = Vec::new();
            stages.push(default_prologue(self.codecs.clone()));
            stages.extend(setup.prologues.iter().cloned());
            let main_stage = stages.len();
            stages.push(Stage {
                name: def.method.clone(),
                access: def.access,
                handler: def.handler.clone(),
            });
            stages.extend(setup.epilogues.iter().cloned());
            stages.push(default_epilogue(self.codecs.clone()));

            features.push(Arc::new(Feature::new(
                path_segments.clone(),
                &def.verb,
                signature,
                def.access,
                stages,
                main_stage,
                setup.translators.clone(),
                def.descriptor(),
            )));
        }

        {
            let mut directory = self.directory.write().unwrap_or_else(|e| e.into_inner());
            for feature in features {
                directory.insert(feature);
            }
        }

        let entry = Arc::new(ServiceEntry {
            path: path_segments.clone(),
            self_uri: self_uri.clone(),
            owner_uri,
            sid,
            blueprint: blueprint.clone(),
            access_keys: access_keys.clone(),
            storage_uri: storage_uri.clone(),
            service: service.clone(),
        });
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        self.blueprints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(blueprint.class.clone(), blueprint);

        let ctx = ServiceContext::new(
            self_uri.clone(),
            entry.owner_uri.clone(),
            config,
            access_keys,
            storage_uri.map(|uri| Plug::new(self.router.clone(), uri)),
            self.router.clone(),
            self.clock.clone(),
        );

        if let Err(err) = service.start(&ctx).await {
            warn!(path, error = %err, "service start failed, rolling back");
            self.directory
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove_service(&path_segments);
            self.services
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|e| e.path != path_segments);
            return Err(err);
        }

        info!(path, uri = %self_uri, "service started");
        Ok(self_uri)
    }

    /// Stop a service, then any children whose owner is this service.
    pub async fn stop_service(self: &Arc<Self>, uri: &Uri) -> Result<()> {
        let local = self.localize(uri).base();
        let entry = self
            .find_service(&local)
            .ok_or_else(|| CoreError::not_found(format!("no service at '{uri}'")))?;

        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|e| e.path != entry.path);
        self.directory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_service(&entry.path);
        entry.service.stop().await;
        info!(uri = %entry.self_uri, "service stopped");

        // Children are stopped after their owner, mirroring creation order.
        loop {
            let child = self
                .services
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .find(|e| e.owner_uri.as_ref() == Some(&entry.self_uri))
                .cloned();
            match child {
                Some(child) => {
                    let child_uri = child.self_uri.clone();
                    Box::pin(self.stop_service(&child_uri)).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Blueprint store access.
    pub fn blueprint(&self, key: &str) -> Option<Blueprint> {
        let store = self.blueprints.read().unwrap_or_else(|e| e.into_inner());
        if let Some(found) = store.get(key) {
            return Some(found.clone());
        }
        store
            .values()
            .find(|b| b.sids.iter().any(|s| s.to_string() == key))
            .cloned()
    }

    pub fn blueprints(&self) -> Vec<Blueprint> {
        self.blueprints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn register_blueprint(&self, blueprint: Blueprint) {
        self.blueprints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(blueprint.class.clone(), blueprint);
    }

    pub fn remove_blueprint(&self, key: &str) -> bool {
        let mut store = self.blueprints.write().unwrap_or_else(|e| e.into_inner());
        if store.shift_remove(key).is_some() {
            return true;
        }
        let found = store
            .iter()
            .find(|(_, b)| b.sids.iter().any(|s| s.to_string() == key))
            .map(|(k, _)| k.clone());
        match found {
            Some(k) => store.shift_remove(&k).is_some(),
            None => false,
        }
    }

    /// Load a named manifest of blueprints from the activator registry.
    pub fn load_manifest(&self, name: &str) -> Result<usize> {
        let blueprints = self
            .registry
            .manifest(name)
            .ok_or_else(|| CoreError::not_found(format!("no manifest named '{name}'")))?;
        let count = blueprints.len();
        for blueprint in blueprints {
            self.register_blueprint(blueprint);
        }
        Ok(count)
    }

    /// Diagnostics snapshot for the `status` features.
    pub fn diagnostics(&self) -> serde_json::Value {
        let uptime = (self.clock.now() - self.started_at).whole_seconds();
        serde_json::json!({
            "guid": self.guid,
            "uptime-seconds": uptime,
            "public-uri": self.public_uri().to_string(),
            "connect-limit": self.connect_limit,
            "available-slots": self.admission.available_permits(),
            "services": self.services.read().unwrap_or_else(|e| e.into_inner()).len(),
            "requests-in-flight": self.in_flight.len(),
        })
    }

    pub fn activities(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        for entry in self.in_flight.iter() {
            doc.insert(
                entry.key().clone(),
                serde_json::Value::Array(
                    entry
                        .value()
                        .iter()
                        .map(|u| serde_json::Value::String(u.to_string()))
                        .collect(),
                ),
            );
        }
        serde_json::Value::Object(doc)
    }

    pub fn feature_stats(&self) -> serde_json::Value {
        let directory = self.directory.read().unwrap_or_else(|e| e.into_inner());
        serde_json::Value::Array(
            directory
                .list()
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "verb": f.verb,
                        "service": f.service_path.join("/"),
                        "signature": f.descriptor.signature,
                        "access": f.access.as_str(),
                        "hits": f.hits(),
                    })
                })
                .collect(),
        )
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop accepting external work, stop services in reverse start order
    /// and unregister from the router.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!(guid = %self.guid, "host shutting down");
        self.admission.close();

        let entries: Vec<Arc<ServiceEntry>> = {
            let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
            services.drain(..).collect()
        };
        for entry in entries.into_iter().rev() {
            self.directory
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove_service(&entry.path);
            entry.service.stop().await;
        }
        self.router.unregister_local(&self.guid);
    }
}

/// In-process endpoint adapter dispatching into the host.
struct HostEndpoint {
    host: Weak<Host>,
}

#[async_trait]
impl Endpoint for HostEndpoint {
    async fn invoke(&self, verb: &str, uri: &Uri, request: Message) -> Result<Message> {
        match self.host.upgrade() {
            Some(host) => Ok(host.submit(verb, uri.clone(), request).await),
            None => Err(CoreError::internal("host is gone")),
        }
    }
}
