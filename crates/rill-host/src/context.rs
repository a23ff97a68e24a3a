//! Per-request context threaded through every pipeline stage.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rill_core::{Clock, Message, Uri};

use crate::error::HostResult;
use crate::plug::{EndpointRouter, Plug};

/// Access level of a caller or a stage. Ordered: `Private` callers may invoke
/// `Internal` and `Public` stages, but not the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Public,
    Internal,
    Private,
}

impl Default for Access {
    fn default() -> Self {
        Self::Public
    }
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Private => "private",
        }
    }
}

/// Boxed async stage handler: `(context, request) -> response`.
pub type HandlerFn =
    Arc<dyn Fn(Context, Message) -> BoxFuture<'static, HostResult<Message>> + Send + Sync>;

/// Wrap an async closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HostResult<Message>> + Send + 'static,
{
    Arc::new(move |ctx, msg| Box::pin(f(ctx, msg)))
}

/// Context visible to every stage of one request.
///
/// Suspending stages carry the context across await points, so epilogues
/// observe the same instance the prologues saw.
#[derive(Clone)]
pub struct Context {
    pub request_id: String,
    pub verb: String,
    /// Localized request URI (`local://<guid>/…`).
    pub uri: Uri,
    /// Access level derived from the caller's keys.
    pub access: Access,
    /// Segment count of the feature's registered path, for tail extraction.
    pub feature_path_len: usize,
    router: Arc<EndpointRouter>,
    clock: Arc<dyn Clock>,
}

impl Context {
    pub fn new(
        request_id: String,
        verb: String,
        uri: Uri,
        access: Access,
        router: Arc<EndpointRouter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            request_id,
            verb,
            uri,
            access,
            feature_path_len: 0,
            router,
            clock,
        }
    }

    /// A plug bound to `uri`, resolving through this host's endpoint router.
    pub fn plug(&self, uri: &Uri) -> Plug {
        Plug::new(self.router.clone(), uri.clone())
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn router(&self) -> Arc<EndpointRouter> {
        self.router.clone()
    }

    /// Request path segments beyond the feature's registered path.
    pub fn tail(&self) -> &[String] {
        let segments = self.uri.segments();
        &segments[self.feature_path_len.min(segments.len())..]
    }

    /// Sleep on the host's clock (test-controllable).
    pub async fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration).await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("verb", &self.verb)
            .field("uri", &self.uri.to_string())
            .field("access", &self.access)
            .finish()
    }
}
