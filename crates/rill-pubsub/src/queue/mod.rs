//! Per-subscription-set dispatch queues: strict FIFO, at-least-once, with
//! additive backoff between failed delivery attempts.

mod memory;
mod persistent;
mod repository;

pub use memory::MemoryDispatchQueue;
pub use persistent::{PersistentDispatchQueue, deserialize_item, serialize_item};
pub use repository::QueueRepository;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rill_core::{Clock, Uri};
use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::error::Result;

/// Default backoff step between failed deliveries.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(1);
/// The additive backoff grows up to this many steps, then stays capped.
pub const MAX_BACKOFF_STEPS: u32 = 10;

/// The event carried by a dispatch item.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub id: String,
    pub channel: Uri,
    pub resource: Option<Uri>,
    pub origins: Vec<Uri>,
    pub recipients: Vec<Uri>,
    pub via: Vec<Uri>,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// One unit of work: an event bound for one destination, owned by one set's
/// queue. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchItem {
    pub destination: Uri,
    pub location: String,
    pub event: DispatchEvent,
}

/// Delivery callback: `true` removes the item, `false` leaves it at the
/// head for a retry after backoff.
pub type DequeueHandler = Arc<dyn Fn(DispatchItem) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap an async closure into a [`DequeueHandler`].
pub fn dequeue_handler<F, Fut>(f: F) -> DequeueHandler
where
    F: Fn(DispatchItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |item| Box::pin(f(item)))
}

/// Queue contract shared by the in-memory and persistent variants.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Append an item; returns immediately.
    fn enqueue(&self, item: DispatchItem) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the worker. Persistent queues keep their pending items for the
    /// next start; memory queues lose them.
    async fn dispose(&self);

    /// Stop the worker and erase any persisted state.
    async fn delete_and_dispose(&self);
}

/// Shared in-memory FIFO state.
pub(crate) struct QueueState {
    items: Mutex<VecDeque<DispatchItem>>,
    notify: Notify,
}

impl QueueState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub(crate) fn push(&self, item: DispatchItem) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
        self.notify.notify_one();
    }

    pub(crate) fn head(&self) -> Option<DispatchItem> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .cloned()
    }

    pub(crate) fn pop(&self) -> Option<DispatchItem> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Drain loop shared by both queue variants.
///
/// On success `on_success` runs before the next item (the persistent
/// variant advances its head index there). On failure the item stays at the
/// head and the worker sleeps `step × min(consecutive, MAX_BACKOFF_STEPS)`.
pub(crate) async fn drain(
    state: Arc<QueueState>,
    handler: DequeueHandler,
    clock: Arc<dyn Clock>,
    backoff_step: Duration,
    mut shutdown: watch::Receiver<bool>,
    on_success: Box<dyn Fn(&DispatchItem) + Send + Sync>,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let Some(item) = state.head() else {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = state.notify.notified() => continue,
            }
        };

        if (handler)(item.clone()).await {
            state.pop();
            on_success(&item);
            consecutive_failures = 0;
        } else {
            consecutive_failures = consecutive_failures.saturating_add(1);
            let backoff = backoff_step * consecutive_failures.min(MAX_BACKOFF_STEPS);
            debug!(
                destination = %item.destination,
                location = %item.location,
                consecutive_failures,
                backoff_ms = backoff.as_millis() as u64,
                "delivery failed, backing off"
            );
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = clock.sleep(backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use rill_core::SystemClock;

    fn item(n: u32) -> DispatchItem {
        DispatchItem {
            destination: Uri::parse("http://sink/inbox").unwrap(),
            location: "loc".to_string(),
            event: DispatchEvent {
                id: format!("e{n}"),
                channel: Uri::parse("channel:///t").unwrap(),
                resource: None,
                origins: Vec::new(),
                recipients: Vec::new(),
                via: Vec::new(),
                content_type: "application/json".to_string(),
                body: n.to_le_bytes().to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn drain_preserves_fifo_order() {
        let state = QueueState::new();
        for n in 0..5 {
            state.push(item(n));
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        let handler = dequeue_handler(move |item: DispatchItem| {
            let seen = seen_c.clone();
            async move {
                seen.lock().unwrap().push(item.event.id.clone());
                true
            }
        });
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(drain(
            state.clone(),
            handler,
            Arc::new(SystemClock),
            Duration::from_millis(1),
            rx,
            Box::new(|_| {}),
        ));

        while state.len() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["e0", "e1", "e2", "e3", "e4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_head_retries_with_additive_backoff() {
        let state = QueueState::new();
        state.push(item(1));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_c = attempts.clone();
        let handler = dequeue_handler(move |_item| {
            let attempts = attempts_c.clone();
            async move { attempts.fetch_add(1, Ordering::SeqCst) >= 3 }
        });
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(drain(
            state.clone(),
            handler,
            Arc::new(SystemClock),
            Duration::from_secs(1),
            rx,
            Box::new(|_| {}),
        ));

        // Paused tokio time auto-advances through the sleeps; backoffs are
        // 1s, 2s, 3s before the fourth attempt succeeds.
        while state.len() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
