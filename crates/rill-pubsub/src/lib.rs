//! The Rill publish/subscribe fabric.
//!
//! Federates event delivery across hosts: owners register subscription
//! sets, the dispatcher merges them into a combined set, matches published
//! events against channel and resource patterns, and hands dispatch items
//! to persistent, retrying per-set queues. Failing sets are expired or
//! kicked; upstream and downstream peers chain through combined-set pushes.

pub mod combined;
pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod queue;
pub mod service;
pub mod subscription;

pub use combined::{CombinedSet, CombinedSubscription};
pub use dispatcher::{Dispatcher, Registration};
pub use error::{PubSubError, Result};
pub use queue::{
    DEFAULT_BACKOFF_STEP, DequeueHandler, DispatchEvent, DispatchItem, DispatchQueue,
    MemoryDispatchQueue, PersistentDispatchQueue, QueueRepository, dequeue_handler,
};
pub use service::PubSubService;
pub use subscription::{Recipient, Subscription, SubscriptionSet};
