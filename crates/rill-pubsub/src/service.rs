//! REST façade over the dispatcher: subscription-set CRUD and `publish`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use rill_core::{Cookie, Message, Result as CoreResult, Uri, headers, status, uri as uri_scheme};
use rill_host::{
    HostError, Service, ServiceContext, ServiceRegistry, ServiceSetup, handler, verb,
};

use crate::dispatcher::{Dispatcher, Registration};
use crate::queue::{DEFAULT_BACKOFF_STEP, DispatchEvent, QueueRepository};

/// Class tag the service registers under.
pub const CLASS: &str = "rill.pubsub";

/// The pub/sub service. The dispatcher is built at start, once the host has
/// handed over the service context.
pub struct PubSubService {
    dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl PubSubService {
    pub fn new() -> Self {
        Self {
            dispatcher: OnceLock::new(),
        }
    }

    /// Register the factory with a service activator registry.
    pub fn register(registry: &ServiceRegistry) {
        registry.register(CLASS, |_config| {
            Ok(Arc::new(PubSubService::new()) as Arc<dyn Service>)
        });
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.get().cloned()
    }

    fn ready(&self) -> Result<Arc<Dispatcher>, HostError> {
        self.dispatcher
            .get()
            .cloned()
            .ok_or_else(|| HostError::internal("pub/sub service is not started"))
    }
}

impl Default for PubSubService {
    fn default() -> Self {
        Self::new()
    }
}

/// Access key presented via query or the scoped cookie.
fn presented_key(uri: &Uri, msg: &Message) -> String {
    uri.query("access-key")
        .map(str::to_string)
        .or_else(|| msg.cookie("access-key").map(|c| c.value.clone()))
        .unwrap_or_default()
}

#[async_trait]
impl Service for PubSubService {
    fn class(&self) -> &str {
        CLASS
    }

    fn sids(&self) -> Vec<Uri> {
        vec![Uri::parse("sid://rill/2026/pubsub").expect("static sid")]
    }

    fn setup(self: Arc<Self>, setup: &mut ServiceSetup) {
        let service = self.clone();
        setup
            .feature(
                verb::GET,
                "subscribers",
                "get_combined_set",
                handler(move |_ctx, _msg| {
                    let service = service.clone();
                    async move {
                        let dispatcher = service.ready()?;
                        Ok(Message::ok_document(dispatcher.combined_document()))
                    }
                }),
            )
            .describe("the combined set across all live subscription sets");

        let service = self.clone();
        setup
            .feature(
                verb::POST,
                "subscribers",
                "register_set",
                handler(move |ctx, msg: Message| {
                    let service = service.clone();
                    async move {
                        let dispatcher = service.ready()?;
                        let doc = msg
                            .document()
                            .ok_or_else(|| HostError::input("subscription set document required"))?;
                        let location_hint = msg.headers.get(headers::SET_LOCATION_KEY);
                        let access_key_hint = msg.headers.get(headers::SET_ACCESS_KEY);
                        match dispatcher.register(&doc, location_hint, access_key_hint)? {
                            Registration::Created(set) => {
                                let location_uri = ctx.uri.base().at([set.location.clone()]);
                                let mut reply = Message::ok_document(json!({
                                    "location": set.location.clone(),
                                    "access-key": set.access_key.clone(),
                                }));
                                reply.status = status::CREATED;
                                reply
                                    .headers
                                    .set(headers::LOCATION, location_uri.to_string());
                                reply.add_cookie(Cookie::access_key(
                                    set.access_key.clone(),
                                    location_uri.path(),
                                ));
                                Ok(reply)
                            }
                            Registration::Existing(set) => {
                                let location_uri = ctx.uri.base().at([set.location.clone()]);
                                let mut reply = Message::error(
                                    status::CONFLICT,
                                    "owner already has a subscription set",
                                );
                                reply.set_document(json!({
                                    "location": set.location.clone(),
                                    "access-key": set.access_key.clone(),
                                }));
                                reply
                                    .headers
                                    .set(headers::CONTENT_LOCATION, location_uri.to_string());
                                Ok(reply)
                            }
                        }
                    }
                }),
            )
            .describe("register a subscription set; 409 echoes the existing location");

        let service = self.clone();
        setup.feature(
            verb::GET,
            "subscribers/*",
            "get_set",
            handler(move |ctx, msg: Message| {
                let service = service.clone();
                async move {
                    let dispatcher = service.ready()?;
                    let location = ctx.uri.last_segment().unwrap_or_default().to_string();
                    let set = dispatcher.set(&location, &presented_key(&ctx.uri, &msg))?;
                    Ok(Message::ok_document(set.to_document()))
                }
            }),
        );

        let service = self.clone();
        setup.feature(
            verb::PUT,
            "subscribers/*",
            "replace_set",
            handler(move |ctx, msg: Message| {
                let service = service.clone();
                async move {
                    let dispatcher = service.ready()?;
                    let location = ctx.uri.last_segment().unwrap_or_default().to_string();
                    let doc = msg
                        .document()
                        .ok_or_else(|| HostError::input("subscription set document required"))?;
                    let rotate_key = msg.headers.get(headers::SET_ACCESS_KEY);
                    let set = dispatcher.replace(
                        &location,
                        &doc,
                        &presented_key(&ctx.uri, &msg),
                        rotate_key,
                    )?;
                    Ok(Message::ok_document(json!({
                        "location": set.location.clone(),
                        "access-key": set.access_key.clone(),
                    })))
                }
            }),
        );

        let service = self.clone();
        setup.feature(
            verb::DELETE,
            "subscribers/*",
            "delete_set",
            handler(move |ctx, msg: Message| {
                let service = service.clone();
                async move {
                    let dispatcher = service.ready()?;
                    let location = ctx.uri.last_segment().unwrap_or_default().to_string();
                    dispatcher
                        .delete(&location, &presented_key(&ctx.uri, &msg))
                        .await?;
                    Ok(Message::ok())
                }
            }),
        );

        let service = self.clone();
        setup
            .feature(
                verb::POST,
                "publish",
                "publish",
                handler(move |_ctx, msg: Message| {
                    let service = service.clone();
                    async move {
                        let dispatcher = service.ready()?;
                        let event = DispatchEvent::from_message(&msg)?;
                        if event.channel.scheme() == uri_scheme::SCHEME_PUBSUB {
                            return Ok(Message::forbidden(
                                "the pubsub channel scheme is reserved",
                            ));
                        }
                        let dispatched = dispatcher.dispatch(event)?;
                        Ok(Message::ok_document(json!({ "dispatched": dispatched })))
                    }
                }),
            )
            .describe("accept an event for dispatch; pubsub:// channels are refused");

        let service = self.clone();
        setup.feature(
            verb::POST,
            "downstream",
            "ingest_combined_set",
            handler(move |_ctx, msg: Message| {
                let service = service.clone();
                async move {
                    let dispatcher = service.ready()?;
                    let owner = msg
                        .headers
                        .get(headers::EVENT_ORIGIN)
                        .ok_or_else(|| HostError::input("combined-set push lacks an origin"))?;
                    let owner = Uri::parse(owner).map_err(HostError::Core)?;
                    let doc = msg
                        .document()
                        .ok_or_else(|| HostError::input("combined-set document required"))?;
                    dispatcher.ingest_combined(&owner, &doc)?;
                    Ok(Message::ok())
                }
            }),
        );
    }

    async fn start(&self, ctx: &ServiceContext) -> CoreResult<()> {
        let clock = ctx.clock();
        let backoff_step = ctx
            .config
            .child("backoff-step-ms")
            .as_u64()
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BACKOFF_STEP);

        let repository = match ctx.config.at("dream.storage.path").as_str() {
            Some(path) => QueueRepository::persistent(path.into(), clock.clone(), backoff_step),
            None => QueueRepository::in_memory(clock.clone(), backoff_step),
        };

        let dispatcher = Dispatcher::start(
            ctx.self_uri.clone(),
            repository,
            ctx.router(),
            clock,
            &ctx.config,
        )
        .await
        .map_err(|e| rill_core::CoreError::internal(format!("dispatcher start failed: {e}")))?;

        self.dispatcher
            .set(dispatcher)
            .map_err(|_| rill_core::CoreError::internal("pub/sub service started twice"))?;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.shutdown().await;
        }
    }
}
