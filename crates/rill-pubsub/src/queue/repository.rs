//! Repository owning the per-set dispatch queues and their persisted
//! descriptors.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rill_core::Clock;
use tracing::{info, warn};

use super::{
    DequeueHandler, DispatchQueue, MemoryDispatchQueue, PersistentDispatchQueue,
};
use crate::error::{PubSubError, Result};
use crate::subscription::SubscriptionSet;

const DESCRIPTOR_SUFFIX: &str = ".json";

/// Owns every queue of a pub/sub service instance.
///
/// With a root path, each set persists a descriptor `<location>.json` next
/// to a `<location>/` directory holding the queue log; without one,
/// everything lives in memory.
pub struct QueueRepository {
    root: Option<PathBuf>,
    backoff_step: Duration,
    clock: Arc<dyn Clock>,
    queues: DashMap<String, Arc<dyn DispatchQueue>>,
    handler: Mutex<Option<DequeueHandler>>,
}

impl QueueRepository {
    pub fn in_memory(clock: Arc<dyn Clock>, backoff_step: Duration) -> Arc<Self> {
        Arc::new(Self {
            root: None,
            backoff_step,
            clock,
            queues: DashMap::new(),
            handler: Mutex::new(None),
        })
    }

    pub fn persistent(root: PathBuf, clock: Arc<dyn Clock>, backoff_step: Duration) -> Arc<Self> {
        Arc::new(Self {
            root: Some(root),
            backoff_step,
            clock,
            queues: DashMap::new(),
            handler: Mutex::new(None),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.root.is_some()
    }

    /// Install the dequeue handler, scan the root for persisted set
    /// descriptors, resume their queues and return the sets so the caller
    /// can rehydrate its subscription data.
    pub fn initialize(&self, handler: DequeueHandler) -> Result<Vec<SubscriptionSet>> {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);

        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(root)?;

        let mut sets = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(location) = name.strip_suffix(DESCRIPTOR_SUFFIX) else {
                continue;
            };
            let raw = std::fs::read(entry.path())?;
            let doc: serde_json::Value = match serde_json::from_slice(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(file = %entry.path().display(), error = %err, "skipping unreadable set descriptor");
                    continue;
                }
            };
            match SubscriptionSet::from_document(&doc) {
                Ok(set) => {
                    self.ensure_queue(location)?;
                    sets.push(set);
                }
                Err(err) => {
                    warn!(file = %entry.path().display(), error = %err, "skipping invalid set descriptor");
                }
            }
        }
        if !sets.is_empty() {
            info!(count = sets.len(), "resumed persisted subscription sets");
        }
        Ok(sets)
    }

    /// Persist (or refresh) a set descriptor and make sure its queue runs.
    pub fn register_or_update(&self, set: &SubscriptionSet) -> Result<()> {
        if let Some(root) = &self.root {
            std::fs::create_dir_all(root)?;
            let path = root.join(format!("{}{}", set.location, DESCRIPTOR_SUFFIX));
            std::fs::write(&path, serde_json::to_vec_pretty(&set.to_document())?)?;
        }
        self.ensure_queue(&set.location)?;
        Ok(())
    }

    /// Drop the set's descriptor and erase its queue.
    pub async fn delete(&self, location: &str) -> Result<()> {
        if let Some((_, queue)) = self.queues.remove(location) {
            queue.delete_and_dispose().await;
        }
        if let Some(root) = &self.root {
            let path = root.join(format!("{location}{DESCRIPTOR_SUFFIX}"));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// The queue owning `location`, when one is running.
    pub fn get(&self, location: &str) -> Option<Arc<dyn DispatchQueue>> {
        self.queues.get(location).map(|q| q.clone())
    }

    /// Stop every queue without losing persisted state.
    pub async fn dispose_all(&self) {
        let queues: Vec<Arc<dyn DispatchQueue>> = self
            .queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.queues.clear();
        for queue in queues {
            queue.dispose().await;
        }
    }

    fn ensure_queue(&self, location: &str) -> Result<Arc<dyn DispatchQueue>> {
        if let Some(queue) = self.queues.get(location) {
            return Ok(queue.clone());
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                PubSubError::Core(rill_core::CoreError::internal(
                    "queue repository is not initialized",
                ))
            })?;

        let queue: Arc<dyn DispatchQueue> = match &self.root {
            Some(root) => PersistentDispatchQueue::start(
                &root.join(location),
                handler,
                self.clock.clone(),
                self.backoff_step,
            )?,
            None => MemoryDispatchQueue::start(handler, self.clock.clone(), self.backoff_step),
        };
        self.queues.insert(location.to_string(), queue.clone());
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use rill_core::{SystemClock, Uri};
    use serde_json::json;

    use super::*;
    use crate::queue::dequeue_handler;

    fn set(location: &str, owner: &str) -> SubscriptionSet {
        SubscriptionSet {
            location: location.to_string(),
            owner: Uri::parse(owner).unwrap(),
            access_key: "k".to_string(),
            version: None,
            max_failures: 0,
            max_failure_duration: None,
            subscriptions: vec![serde_json::from_value(json!({
                "channels": ["channel:///t"],
                "recipients": [{ "uri": "http://sink/a" }]
            }))
            .unwrap()],
        }
    }

    #[tokio::test]
    async fn registration_requires_initialization() {
        let repo = QueueRepository::in_memory(Arc::new(SystemClock), Duration::from_millis(1));
        assert!(repo.register_or_update(&set("s1", "http://o/1")).is_err());

        repo.initialize(dequeue_handler(|_| async { true })).unwrap();
        repo.register_or_update(&set("s1", "http://o/1")).unwrap();
        assert!(repo.get("s1").is_some());
        assert!(repo.get("other").is_none());
    }

    #[tokio::test]
    async fn persisted_descriptors_are_rehydrated() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let repo = QueueRepository::persistent(
            root.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(1),
        );
        repo.initialize(dequeue_handler(|_| async { true })).unwrap();
        repo.register_or_update(&set("s1", "http://o/1")).unwrap();
        repo.register_or_update(&set("s2", "http://o/2")).unwrap();
        repo.dispose_all().await;

        let repo = QueueRepository::persistent(root, Arc::new(SystemClock), Duration::from_millis(1));
        let mut sets = repo
            .initialize(dequeue_handler(|_| async { true }))
            .unwrap();
        sets.sort_by(|a, b| a.location.cmp(&b.location));
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].location, "s1");
        assert_eq!(sets[1].location, "s2");
        assert!(repo.get("s1").is_some());
        repo.dispose_all().await;
    }

    #[tokio::test]
    async fn delete_removes_descriptor_and_queue() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let repo = QueueRepository::persistent(
            root.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(1),
        );
        repo.initialize(dequeue_handler(|_| async { true })).unwrap();
        repo.register_or_update(&set("s1", "http://o/1")).unwrap();
        repo.delete("s1").await.unwrap();
        assert!(repo.get("s1").is_none());
        assert!(!root.join("s1.json").exists());
        assert!(!root.join("s1").exists());
    }
}
