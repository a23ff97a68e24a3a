//! The host's own administration service: version, blueprints, service
//! lifecycle, script execution, diagnostics and the test echo.

use std::sync::{Arc, Weak};

use serde_json::json;
use rill_core::{ConfigNode, Message, Uri, headers, status};

use crate::context::{Access, handler};
use crate::error::{HostError, HostResult};
use crate::feature::{Blueprint, verb};
use crate::host::Host;
use crate::script;
use crate::service::{Service, ServiceSetup};

/// Administration service installed at `dream.host.path` on every host.
pub struct HostService {
    host: Weak<Host>,
}

impl HostService {
    pub fn new(host: Weak<Host>) -> Self {
        Self { host }
    }
}

fn host_of(weak: &Weak<Host>) -> HostResult<Arc<Host>> {
    weak.upgrade()
        .ok_or_else(|| HostError::internal("host is gone"))
}

#[async_trait::async_trait]
impl Service for HostService {
    fn class(&self) -> &str {
        "rill.host"
    }

    fn sids(&self) -> Vec<Uri> {
        vec![Uri::parse("sid://rill/2026/host").expect("static sid")]
    }

    fn setup(self: Arc<Self>, setup: &mut ServiceSetup) {
        let weak = self.host.clone();
        setup
            .feature(
                verb::GET,
                "version",
                "get_version",
                handler(move |_ctx, _msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let services: Vec<String> = host
                            .service_entries()
                            .iter()
                            .map(|e| e.path.join("/"))
                            .collect();
                        Ok(Message::ok_document(json!({
                            "name": "rill",
                            "version": env!("CARGO_PKG_VERSION"),
                            "services": services,
                        })))
                    }
                }),
            )
            .describe("manifest of the host and its loaded services");

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "blueprints",
            "list_blueprints",
            handler(move |_ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    let doc = serde_json::to_value(host.blueprints())?;
                    Ok(Message::ok_document(json!({ "blueprints": doc })))
                }
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "blueprints/*",
            "get_blueprint",
            handler(move |ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    let key = ctx.uri.last_segment().unwrap_or_default();
                    match host.blueprint(key) {
                        Some(blueprint) => {
                            Ok(Message::ok_document(serde_json::to_value(blueprint)?))
                        }
                        None => Ok(Message::not_found(&format!("no blueprint '{key}'"))),
                    }
                }
            }),
        );

        let weak = self.host.clone();
        setup
            .feature(
                verb::POST,
                "blueprints",
                "register_blueprint",
                handler(move |_ctx, msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let doc = msg
                            .document()
                            .ok_or_else(|| HostError::input("blueprint document required"))?;
                        let blueprint: Blueprint = serde_json::from_value(doc)
                            .map_err(|e| HostError::input(format!("malformed blueprint: {e}")))?;
                        host.register_blueprint(blueprint);
                        Ok(Message::with_status(status::CREATED))
                    }
                }),
            )
            .access(Access::Private);

        let weak = self.host.clone();
        setup
            .feature(
                verb::DELETE,
                "blueprints/*",
                "delete_blueprint",
                handler(move |ctx, _msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let key = ctx.uri.last_segment().unwrap_or_default();
                        if host.remove_blueprint(key) {
                            Ok(Message::ok())
                        } else {
                            Ok(Message::not_found(&format!("no blueprint '{key}'")))
                        }
                    }
                }),
            )
            .access(Access::Private);

        let weak = self.host.clone();
        setup
            .feature(
                verb::POST,
                "load",
                "load_manifest",
                handler(move |ctx, _msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let name = ctx
                            .uri
                            .query("name")
                            .ok_or_else(|| HostError::input("missing 'name' parameter"))?;
                        let count = host.load_manifest(name)?;
                        Ok(Message::ok_document(json!({ "loaded": count })))
                    }
                }),
            )
            .access(Access::Private)
            .param("name", "manifest to load");

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "services",
            "list_services",
            handler(move |_ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    let services: Vec<_> = host
                        .service_entries()
                        .iter()
                        .map(|e| {
                            json!({
                                "path": e.path.join("/"),
                                "uri": e.self_uri.to_string(),
                                "class": e.blueprint.class,
                                "sid": e.sid.as_ref().map(|s| s.to_string()),
                                "owner": e.owner_uri.as_ref().map(|o| o.to_string()),
                            })
                        })
                        .collect();
                    Ok(Message::ok_document(json!({ "services": services })))
                }
            }),
        );

        let weak = self.host.clone();
        setup
            .feature(
                verb::POST,
                "services",
                "create_service",
                handler(move |_ctx, msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let doc = msg
                            .document()
                            .ok_or_else(|| HostError::input("service config required"))?;
                        let uri = host.start_service(ConfigNode::new(doc)).await?;
                        let mut reply =
                            Message::ok_document(json!({ "uri": uri.to_string() }));
                        reply.status = status::CREATED;
                        reply.headers.set(headers::LOCATION, uri.to_string());
                        Ok(reply)
                    }
                }),
            )
            .access(Access::Private);

        let weak = self.host.clone();
        setup
            .feature(
                verb::POST,
                "stop",
                "stop_service",
                handler(move |_ctx, msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let doc = msg
                            .document()
                            .ok_or_else(|| HostError::input("stop document required"))?;
                        let uri = doc
                            .get("uri")
                            .and_then(|u| u.as_str())
                            .ok_or_else(|| HostError::input("stop document needs 'uri'"))?;
                        let uri = Uri::parse(uri)?;
                        host.stop_service(&uri).await?;
                        Ok(Message::ok())
                    }
                }),
            )
            .access(Access::Private);

        let weak = self.host.clone();
        setup
            .feature(
                verb::POST,
                "execute",
                "execute_script",
                handler(move |_ctx, msg| {
                    let weak = weak.clone();
                    async move {
                        let host = host_of(&weak)?;
                        let doc = msg
                            .document()
                            .ok_or_else(|| HostError::input("script document required"))?;
                        let replies = script::execute(&host, host.api_key(), &doc).await?;
                        Ok(Message::ok_document(replies))
                    }
                }),
            )
            .access(Access::Private);

        setup.feature(
            verb::POST,
            "convert",
            "convert",
            handler(|_ctx, msg: Message| async move {
                // Echo the body; the default epilogue applies the requested
                // output shaping.
                let mut reply = Message::ok();
                reply.body = msg.body.clone();
                if let Some(content_type) = msg.content_type() {
                    reply.headers.set(headers::CONTENT_TYPE, content_type);
                }
                Ok(reply)
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "status",
            "get_status",
            handler(move |_ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    Ok(Message::ok_document(host.diagnostics()))
                }
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "status/aliases",
            "get_aliases",
            handler(move |_ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    let aliases: Vec<String> =
                        host.aliases().iter().map(|a| a.to_string()).collect();
                    Ok(Message::ok_document(json!({ "aliases": aliases })))
                }
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "status/activities",
            "get_activities",
            handler(move |_ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    Ok(Message::ok_document(host.activities()))
                }
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "status/features",
            "get_features",
            handler(move |_ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    Ok(Message::ok_document(host.feature_stats()))
                }
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "status/timers",
            "get_timers",
            handler(move |ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let _host = host_of(&weak)?;
                    let now = ctx
                        .clock()
                        .now()
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default();
                    Ok(Message::ok_document(json!({ "now": now })))
                }
            }),
        );

        setup.feature(
            verb::GET,
            "status/threads",
            "get_threads",
            handler(|_ctx, _msg| async move {
                let workers = tokio::runtime::Handle::current().metrics().num_workers();
                Ok(Message::ok_document(json!({ "workers": workers })))
            }),
        );

        let weak = self.host.clone();
        setup.feature(
            verb::GET,
            "resources/*",
            "get_resource",
            handler(move |ctx, _msg| {
                let weak = weak.clone();
                async move {
                    let host = host_of(&weak)?;
                    let name = ctx.uri.last_segment().unwrap_or_default();
                    match host.resource(name) {
                        Some((content_type, bytes)) => {
                            let mut reply = Message::ok();
                            reply.set_bytes(bytes, &content_type);
                            Ok(reply)
                        }
                        None => Ok(Message::not_found(&format!("no resource '{name}'"))),
                    }
                }
            }),
        );

        setup.feature(
            verb::ANY,
            "test",
            "test_echo",
            handler(|ctx, msg: Message| async move {
                let mut doc = serde_json::Map::new();
                doc.insert("verb".to_string(), json!(ctx.verb));
                doc.insert("path".to_string(), json!(ctx.uri.path()));
                if let Some(body) = msg.document() {
                    doc.insert("body".to_string(), body);
                } else if let Some(text) = msg.text() {
                    if !text.is_empty() {
                        doc.insert("body".to_string(), json!(text));
                    }
                }
                Ok(Message::ok_document(serde_json::Value::Object(doc)))
            }),
        );
    }
}
