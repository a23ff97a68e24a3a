//! In-process dispatch queue; pending items are lost on dispose.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rill_core::Clock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{DequeueHandler, DispatchItem, DispatchQueue, QueueState, drain};
use crate::error::Result;

pub struct MemoryDispatchQueue {
    state: Arc<QueueState>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryDispatchQueue {
    pub fn start(
        handler: DequeueHandler,
        clock: Arc<dyn Clock>,
        backoff_step: Duration,
    ) -> Arc<Self> {
        let state = QueueState::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(drain(
            state.clone(),
            handler,
            clock,
            backoff_step,
            shutdown_rx,
            Box::new(|_| {}),
        ));
        Arc::new(Self {
            state,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    async fn stop_worker(&self) {
        let _ = self.shutdown.send(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    fn enqueue(&self, item: DispatchItem) -> Result<()> {
        self.state.push(item);
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.len()
    }

    async fn dispose(&self) {
        self.stop_worker().await;
    }

    async fn delete_and_dispose(&self) {
        self.stop_worker().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rill_core::{SystemClock, Uri};

    use super::*;
    use crate::queue::{DispatchEvent, dequeue_handler};

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
                body: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn delivers_enqueued_items_in_order() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered_c = delivered.clone();
        let queue = MemoryDispatchQueue::start(
            dequeue_handler(move |item: DispatchItem| {
                let delivered = delivered_c.clone();
                async move {
                    delivered.lock().unwrap().push(item.event.id.clone());
                    true
                }
            }),
            Arc::new(SystemClock),
            Duration::from_millis(1),
        );

        for n in 0..3 {
            queue.enqueue(item(n)).unwrap();
        }
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue.dispose().await;
        assert_eq!(*delivered.lock().unwrap(), vec!["e0", "e1", "e2"]);
    }

    #[tokio::test]
    async fn dispose_stops_the_worker() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_c = attempts.clone();
        let queue = MemoryDispatchQueue::start(
            dequeue_handler(move |_item| {
                let attempts = attempts_c.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    true
                }
            }),
            Arc::new(SystemClock),
            Duration::from_millis(1),
        );
        queue.dispose().await;
        queue.enqueue(item(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
