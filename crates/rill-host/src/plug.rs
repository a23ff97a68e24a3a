//! Plugs: URI-bound client handles.
//!
//! A plug holds only a URI (plus headers, cookies and a timeout) and resolves
//! the actual endpoint through the [`EndpointRouter`] at invoke time:
//! `local://` addresses dispatch in-process into the owning host, `http`/
//! `https` addresses go out through the reqwest adapter. No service
//! references are held, so plugs never form cycles.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rill_core::{Cookie, CoreError, Headers, Message, Result, Uri, headers, uri};
use tracing::debug;

/// Default timeout for outbound invokes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A resolvable request target.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn invoke(&self, verb: &str, uri: &Uri, request: Message) -> Result<Message>;
}

/// Endpoint backed by a plain async closure; the building block for tests
/// and in-process shims.
pub struct CallbackEndpoint {
    callback: Box<
        dyn Fn(String, Uri, Message) -> BoxFuture<'static, Result<Message>> + Send + Sync,
    >,
}

impl CallbackEndpoint {
    pub fn new<F, Fut>(f: F) -> Arc<Self>
    where
        F: Fn(String, Uri, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message>> + Send + 'static,
    {
        Arc::new(Self {
            callback: Box::new(move |verb, uri, msg| Box::pin(f(verb, uri, msg))),
        })
    }
}

#[async_trait]
impl Endpoint for CallbackEndpoint {
    async fn invoke(&self, verb: &str, uri: &Uri, request: Message) -> Result<Message> {
        (self.callback)(verb.to_string(), uri.clone(), request).await
    }
}

/// Maps URI schemes/authorities to endpoints.
///
/// `local://<guid>` authorities are registered by their owning hosts;
/// everything `http(s)` falls through to the HTTP adapter.
pub struct EndpointRouter {
    local: RwLock<HashMap<String, Arc<dyn Endpoint>>>,
    http: Arc<dyn Endpoint>,
}

impl EndpointRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            http: Arc::new(HttpEndpoint::new()),
        })
    }

    /// Router with a custom HTTP adapter (tests stub the network here).
    pub fn with_http(http: Arc<dyn Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            http,
        })
    }

    pub fn register_local(&self, guid: &str, endpoint: Arc<dyn Endpoint>) {
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(guid.to_ascii_lowercase(), endpoint);
    }

    pub fn unregister_local(&self, guid: &str) {
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&guid.to_ascii_lowercase());
    }

    pub fn resolve(&self, target: &Uri) -> Result<Arc<dyn Endpoint>> {
        match target.scheme() {
            uri::SCHEME_LOCAL => self
                .local
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(target.host())
                .cloned()
                .ok_or_else(|| {
                    CoreError::not_found(format!("no host registered for '{target}'"))
                }),
            "http" | "https" => Ok(self.http.clone()),
            other => Err(CoreError::input(format!(
                "no endpoint for scheme '{other}'"
            ))),
        }
    }
}

/// Client handle bound to a URI. Immutable; all derivations return a new
/// plug.
#[derive(Clone)]
pub struct Plug {
    router: Arc<EndpointRouter>,
    uri: Uri,
    headers: Headers,
    cookies: Vec<Cookie>,
    timeout: Duration,
}

impl Plug {
    pub fn new(router: Arc<EndpointRouter>, uri: Uri) -> Self {
        Self {
            router,
            uri,
            headers: Headers::new(),
            cookies: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn at<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut plug = self.clone();
        plug.uri = plug.uri.at(segments);
        plug
    }

    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut plug = self.clone();
        plug.uri = plug.uri.with(key, value);
        plug
    }

    pub fn with_header(&self, name: &str, value: &str) -> Self {
        let mut plug = self.clone();
        plug.headers.add(name, value);
        plug
    }

    pub fn with_cookie(&self, cookie: Cookie) -> Self {
        let mut plug = self.clone();
        plug.cookies.push(cookie);
        plug
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut plug = self.clone();
        plug.timeout = timeout;
        plug
    }

    pub async fn get(&self) -> Result<Message> {
        self.invoke("GET", Message::request()).await
    }

    pub async fn head(&self) -> Result<Message> {
        self.invoke("HEAD", Message::request()).await
    }

    pub async fn delete(&self) -> Result<Message> {
        self.invoke("DELETE", Message::request()).await
    }

    pub async fn post(&self, request: Message) -> Result<Message> {
        self.invoke("POST", request).await
    }

    pub async fn put(&self, request: Message) -> Result<Message> {
        self.invoke("PUT", request).await
    }

    /// Resolve the endpoint and perform the invoke under this plug's
    /// timeout. Transport failures surface as errors; HTTP-level failures
    /// come back as non-success replies.
    pub async fn invoke(&self, verb: &str, mut request: Message) -> Result<Message> {
        for (name, value) in &self.headers {
            request.headers.add(name, value);
        }
        for cookie in &self.cookies {
            request.add_cookie(cookie.clone());
        }

        let endpoint = self.router.resolve(&self.uri)?;
        debug!(verb, uri = %self.uri, "plug invoke");
        match tokio::time::timeout(self.timeout, endpoint.invoke(verb, &self.uri, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::timeout(self.uri.to_string())),
        }
    }
}

/// Narrow adapter around reqwest for `http`/`https` egress.
pub struct HttpEndpoint {
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    async fn invoke(&self, verb: &str, target: &Uri, request: Message) -> Result<Message> {
        let url = url::Url::parse(&target.to_string())
            .map_err(|e| CoreError::input(format!("invalid outbound url '{target}': {e}")))?;
        let method = reqwest::Method::from_bytes(verb.as_bytes())
            .map_err(|_| CoreError::input(format!("invalid verb '{verb}'")))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case(headers::CONTENT_LENGTH) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie_header = request
                .cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("Cookie", cookie_header);
        }
        let body = request.bytes();
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::timeout(target.to_string())
            } else {
                CoreError::internal(format!("outbound call to '{target}' failed: {e}"))
            }
        })?;

        let mut reply = Message::with_status(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                reply.headers.add(name.as_str(), value);
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::internal(format!("reading reply from '{target}': {e}")))?;
        if !bytes.is_empty() {
            reply.body = rill_core::Body::Bytes(bytes.to_vec());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn plug_routes_local_scheme_to_registered_host() {
        let router = EndpointRouter::new();
        router.register_local(
            "abc",
            CallbackEndpoint::new(|verb, uri, _msg| async move {
                Ok(Message::ok_document(json!({
                    "verb": verb,
                    "path": uri.path(),
                })))
            }),
        );

        let plug = Plug::new(router, Uri::parse("local://abc/svc").unwrap());
        let reply = plug.at(["items"]).get().await.unwrap();
        assert_eq!(reply.document().unwrap()["path"], "/svc/items");
        assert_eq!(reply.document().unwrap()["verb"], "GET");
    }

    #[tokio::test]
    async fn unknown_local_authority_is_not_found() {
        let router = EndpointRouter::new();
        let plug = Plug::new(router, Uri::parse("local://missing/svc").unwrap());
        let err = plug.get().await.unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_input_error() {
        let router = EndpointRouter::new();
        let plug = Plug::new(router, Uri::parse("channel:///foo").unwrap());
        let err = plug.get().await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_with_timeout_error() {
        let router = EndpointRouter::new();
        router.register_local(
            "slow",
            CallbackEndpoint::new(|_verb, _uri, _msg| async {
                // Never completes inside the plug's timeout.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Message::ok())
            }),
        );

        let plug = Plug::new(router, Uri::parse("local://slow/x").unwrap())
            .with_timeout(Duration::from_millis(50));
        let err = plug.get().await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn plug_headers_and_cookies_are_attached() {
        let router = EndpointRouter::new();
        router.register_local(
            "echo",
            CallbackEndpoint::new(|_verb, _uri, msg| async move {
                let cookie = msg.cookie("access-key").map(|c| c.value.clone());
                Ok(Message::ok_document(json!({
                    "auth": msg.headers.get("Authorization"),
                    "cookie": cookie,
                })))
            }),
        );

        let plug = Plug::new(router, Uri::parse("local://echo/x").unwrap())
            .with_header("Authorization", "Bearer t")
            .with_cookie(Cookie::new("access-key", "k"));
        let reply = plug.get().await.unwrap();
        let doc = reply.document().unwrap();
        assert_eq!(doc["auth"], "Bearer t");
        assert_eq!(doc["cookie"], "k");
    }
}
