//! Default pipeline stages: input normalization and output shaping.
//!
//! The built-in formats cover `xpost`, `json` and `base64`; anything else is
//! resolved through the [`CodecRegistry`], the seam where out-of-scope body
//! codecs plug in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rill_core::{Message, Result, headers, message, uri};
use serde_json::{Map, Value};

use crate::context::{Access, handler};
use crate::error::HostError;
use crate::feature::Stage;

/// Query keys steering the default stages.
pub mod query {
    pub const IN_FORMAT: &str = "dream.in.format";
    pub const OUT_FORMAT: &str = "dream.out.format";
    pub const OUT_SELECT: &str = "dream.out.select";
    pub const OUT_TYPE: &str = "dream.out.type";
    pub const OUT_SAVE_AS: &str = "dream.out.saveas";
    pub const OUT_CALLBACK: &str = "dream.out.callback";
}

/// External body codec: named decode/encode between bytes and documents.
pub trait DocumentCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8], content_type: Option<&str>) -> Result<Value>;

    /// Encode a document; returns the bytes and their content type.
    fn encode(&self, doc: &Value) -> Result<(Vec<u8>, String)>;
}

/// Registry of pluggable codecs keyed by format name.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn DocumentCodec>>>,
}

impl CodecRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, codec: Arc<dyn DocumentCodec>) {
        self.codecs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(codec.name().to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DocumentCodec>> {
        self.codecs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// The default prologue: normalize the request body per `dream.in.format`.
pub fn default_prologue(codecs: Arc<CodecRegistry>) -> Stage {
    Stage {
        name: "default-prologue".into(),
        access: Access::Public,
        handler: handler(move |ctx, mut msg: Message| {
            let codecs = codecs.clone();
            async move {
                let Some(format) = ctx.uri.query(query::IN_FORMAT).map(str::to_string) else {
                    return Ok(msg);
                };
                match format.as_str() {
                    "json" => {
                        let doc: Value = serde_json::from_slice(&msg.bytes()).map_err(|e| {
                            HostError::input(format!("request body is not json: {e}"))
                        })?;
                        msg.set_document(doc);
                    }
                    "xpost" => {
                        let text = msg.text().ok_or_else(|| {
                            HostError::input("request body is not utf-8 form data")
                        })?;
                        msg.set_document(parse_form(&text)?);
                    }
                    "base64" => {
                        let decoded = BASE64.decode(msg.bytes()).map_err(|e| {
                            HostError::input(format!("invalid base64 body: {e}"))
                        })?;
                        let content_type = msg
                            .content_type()
                            .unwrap_or(message::MIME_OCTET_STREAM)
                            .to_string();
                        msg.set_bytes(decoded, &content_type);
                    }
                    other => match codecs.get(other) {
                        Some(codec) => {
                            let doc = codec.decode(&msg.bytes(), msg.content_type())?;
                            msg.set_document(doc);
                        }
                        None => {
                            return Err(HostError::input(format!(
                                "unknown input format '{other}'"
                            )));
                        }
                    },
                }
                Ok(msg)
            }
        }),
    }
}

/// The default epilogue: apply selection, output format, content-type
/// override and save-as disposition.
pub fn default_epilogue(codecs: Arc<CodecRegistry>) -> Stage {
    Stage {
        name: "default-epilogue".into(),
        access: Access::Public,
        handler: handler(move |ctx, mut msg: Message| {
            let codecs = codecs.clone();
            async move {
                if let Some(select) = ctx.uri.query(query::OUT_SELECT) {
                    if let Some(doc) = msg.document() {
                        msg.set_document(select_path(&doc, select));
                    }
                }

                if let Some(format) = ctx.uri.query(query::OUT_FORMAT).map(str::to_string) {
                    match format.as_str() {
                        "json" => {
                            if let Some(doc) = msg.document() {
                                msg.set_document(doc);
                            }
                        }
                        "jsonp" => {
                            if let Some(doc) = msg.document() {
                                let callback = ctx
                                    .uri
                                    .query(query::OUT_CALLBACK)
                                    .unwrap_or("callback");
                                let body = format!("{callback}({doc});");
                                msg.set_bytes(body.into_bytes(), "application/javascript");
                            }
                        }
                        other => {
                            if let (Some(codec), Some(doc)) = (codecs.get(other), msg.document()) {
                                let (bytes, content_type) = codec.encode(&doc)?;
                                msg.set_bytes(bytes, &content_type);
                            }
                        }
                    }
                }

                if let Some(content_type) = ctx.uri.query(query::OUT_TYPE) {
                    msg.headers.set(headers::CONTENT_TYPE, content_type);
                }
                if let Some(name) = ctx.uri.query(query::OUT_SAVE_AS) {
                    msg.headers.set(
                        headers::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{name}\""),
                    );
                }
                Ok(msg)
            }
        }),
    }
}

/// Parse `a=1&b=two` into a flat document; repeated keys collect into
/// arrays.
fn parse_form(text: &str) -> Result<Value> {
    let mut map = Map::new();
    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (uri::decode_component(k)?, uri::decode_component(v)?),
            None => (uri::decode_component(pair)?, String::new()),
        };
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    Ok(Value::Object(map))
}

/// Walk a dotted path into a document; a miss selects nothing.
fn select_path(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rill_core::{Clock, SystemClock, Uri};
    use serde_json::json;

    use super::*;
    use crate::context::Context;
    use crate::plug::EndpointRouter;

    fn ctx(uri: &str) -> Context {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Context::new(
            "rid".into(),
            "POST".into(),
            Uri::parse(uri).unwrap(),
            Access::Public,
            EndpointRouter::new(),
            clock,
        )
    }

    #[tokio::test]
    async fn xpost_normalizes_form_bodies() {
        let stage = default_prologue(CodecRegistry::new());
        let request = Message::request_bytes(b"a=1&b=two".to_vec(), message::MIME_FORM_URLENCODED);
        let out = (stage.handler)(ctx("local://g/host/test?dream.in.format=xpost"), request)
            .await
            .unwrap();
        assert_eq!(out.document(), Some(json!({"a": "1", "b": "two"})));
    }

    #[tokio::test]
    async fn xpost_collects_repeated_keys() {
        let stage = default_prologue(CodecRegistry::new());
        let request = Message::request_bytes(b"k=1&k=2&k=3".to_vec(), message::MIME_FORM_URLENCODED);
        let out = (stage.handler)(ctx("local://g/x?dream.in.format=xpost"), request)
            .await
            .unwrap();
        assert_eq!(out.document(), Some(json!({"k": ["1", "2", "3"]})));
    }

    #[tokio::test]
    async fn base64_decodes_body_bytes() {
        let stage = default_prologue(CodecRegistry::new());
        let encoded = BASE64.encode(b"payload");
        let request = Message::request_bytes(encoded.into_bytes(), message::MIME_TEXT);
        let out = (stage.handler)(ctx("local://g/x?dream.in.format=base64"), request)
            .await
            .unwrap();
        assert_eq!(out.bytes(), b"payload");
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let stage = default_prologue(CodecRegistry::new());
        let request = Message::request_bytes(b"x".to_vec(), message::MIME_TEXT);
        let err = (stage.handler)(ctx("local://g/x?dream.in.format=versit"), request)
            .await
            .unwrap_err();
        match err {
            HostError::Core(core) => assert_eq!(core.status(), 400),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn epilogue_selects_and_formats() {
        let stage = default_epilogue(CodecRegistry::new());
        let reply = Message::ok_document(json!({"outer": {"inner": 42}}));
        let out = (stage.handler)(
            ctx("local://g/x?dream.out.select=outer.inner&dream.out.format=jsonp&dream.out.callback=cb"),
            reply,
        )
        .await
        .unwrap();
        assert_eq!(out.text().unwrap(), "cb(42);");
        assert_eq!(out.content_type(), Some("application/javascript"));
    }

    #[tokio::test]
    async fn epilogue_applies_type_override_and_save_as() {
        let stage = default_epilogue(CodecRegistry::new());
        let reply = Message::ok_document(json!({"a": 1}));
        let out = (stage.handler)(
            ctx("local://g/x?dream.out.type=text/x-data&dream.out.saveas=data.json"),
            reply,
        )
        .await
        .unwrap();
        assert_eq!(out.content_type(), Some("text/x-data"));
        assert_eq!(
            out.headers.get(headers::CONTENT_DISPOSITION),
            Some("attachment; filename=\"data.json\"")
        );
    }
}
