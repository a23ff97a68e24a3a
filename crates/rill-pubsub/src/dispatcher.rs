//! The dispatcher: maintains subscription sets, computes the combined set,
//! matches published events, feeds per-set queues and chains with peer
//! dispatchers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::json;
use time::OffsetDateTime;
use rill_core::{Clock, ConfigNode, Cookie, Message, Uri, headers, id, uri as uri_scheme};
use rill_host::{EndpointRouter, Plug};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::combined::{CombinedSet, CombinedSubscription};
use crate::error::{PubSubError, Result};
use crate::matcher::{any_channel_matches, filter_recipients, uri_matches};
use crate::queue::{
    DispatchEvent, DispatchItem, DispatchQueue as _, QueueRepository, dequeue_handler,
};
use crate::subscription::{Recipient, Subscription, SubscriptionSet};

/// Outcome of a registration attempt.
pub enum Registration {
    Created(Arc<SubscriptionSet>),
    /// The owner already has a live set; its location and key are returned.
    Existing(Arc<SubscriptionSet>),
}

struct FailureState {
    consecutive: u64,
    failing_since: OffsetDateTime,
}

struct ChainLink {
    location: String,
    access_key: String,
}

pub struct Dispatcher {
    /// This dispatcher's service URI; appears in `via` and owns chained
    /// registrations at peers.
    service_uri: Uri,
    publish_uri: Uri,
    ingest_uri: Uri,
    sets: RwLock<HashMap<String, Arc<SubscriptionSet>>>,
    combined: ArcSwap<CombinedSet>,
    revision: AtomicU64,
    dirty: Arc<Notify>,
    repository: Arc<QueueRepository>,
    router: Arc<EndpointRouter>,
    clock: Arc<dyn Clock>,
    failures: DashMap<String, FailureState>,
    downstream: Vec<Uri>,
    upstream: Vec<Uri>,
    chain_links: tokio::sync::Mutex<HashMap<String, ChainLink>>,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    /// Build the dispatcher, rehydrate persisted sets, start the
    /// combined-set maintenance task and register with configured peers.
    ///
    /// `config` honors `downstream/uri` and `upstream/uri` entries.
    pub async fn start(
        service_uri: Uri,
        repository: Arc<QueueRepository>,
        router: Arc<EndpointRouter>,
        clock: Arc<dyn Clock>,
        config: &ConfigNode,
    ) -> Result<Arc<Self>> {
        let downstream = parse_peer_uris(config, "downstream")?;
        let upstream = parse_peer_uris(config, "upstream")?;

        let (shutdown, _) = watch::channel(false);
        let dispatcher = Arc::new(Self {
            publish_uri: service_uri.at(["publish"]),
            ingest_uri: service_uri.at(["downstream"]),
            service_uri,
            sets: RwLock::new(HashMap::new()),
            combined: ArcSwap::from_pointee(CombinedSet::default()),
            revision: AtomicU64::new(0),
            dirty: Arc::new(Notify::new()),
            repository: repository.clone(),
            router,
            clock,
            failures: DashMap::new(),
            downstream,
            upstream,
            chain_links: tokio::sync::Mutex::new(HashMap::new()),
            shutdown,
        });

        // The dequeue handler holds only a weak reference; a dropped
        // dispatcher drains its queues without delivering.
        let weak = Arc::downgrade(&dispatcher);
        let handler = dequeue_handler(move |item: DispatchItem| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(dispatcher) => dispatcher.deliver(item).await,
                    None => true,
                }
            }
        });
        let persisted = repository.initialize(handler)?;
        if !persisted.is_empty() {
            let mut sets = dispatcher.sets.write().unwrap_or_else(|e| e.into_inner());
            for set in persisted {
                sets.insert(set.location.clone(), Arc::new(set));
            }
        }

        dispatcher.spawn_maintenance();
        dispatcher.register_at_upstreams().await;
        dispatcher.mark_dirty();
        Ok(dispatcher)
    }

    pub fn service_uri(&self) -> &Uri {
        &self.service_uri
    }

    pub fn publish_uri(&self) -> &Uri {
        &self.publish_uri
    }

    /// Register a new subscription set. A second registration for the same
    /// owner returns the existing set untouched.
    pub fn register(
        &self,
        doc: &serde_json::Value,
        location_hint: Option<&str>,
        access_key_hint: Option<&str>,
    ) -> Result<Registration> {
        let mut set = SubscriptionSet::from_document(doc)?;

        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = sets.values().find(|s| s.owner == set.owner) {
            return Ok(Registration::Existing(existing.clone()));
        }

        set.location = match location_hint {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => id::location_id(),
        };
        if sets.contains_key(&set.location) {
            return Err(PubSubError::DuplicateOwner(set.location.clone()));
        }
        set.access_key = match access_key_hint {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => id::access_key(),
        };

        let set = Arc::new(set);
        self.repository.register_or_update(&set)?;
        sets.insert(set.location.clone(), set.clone());
        drop(sets);

        info!(location = %set.location, owner = %set.owner, "subscription set registered");
        self.mark_dirty();
        Ok(Registration::Created(set))
    }

    /// Replace a set's content. Requires the matching access key; the owner
    /// must not change and stale versions are refused.
    pub fn replace(
        &self,
        location: &str,
        doc: &serde_json::Value,
        presented_key: &str,
        rotate_key: Option<&str>,
    ) -> Result<Arc<SubscriptionSet>> {
        let incoming = SubscriptionSet::from_document(doc)?;

        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        let current = sets
            .get(location)
            .ok_or_else(|| PubSubError::SetNotFound(location.to_string()))?;
        if presented_key != current.access_key {
            return Err(PubSubError::AccessDenied);
        }

        let mut updated = (**current).clone();
        updated.replace_from(incoming)?;
        if let Some(new_key) = rotate_key {
            if !new_key.is_empty() {
                updated.access_key = new_key.to_string();
            }
        }

        let updated = Arc::new(updated);
        self.repository.register_or_update(&updated)?;
        sets.insert(location.to_string(), updated.clone());
        drop(sets);

        debug!(location, "subscription set replaced");
        self.mark_dirty();
        Ok(updated)
    }

    /// Fetch a set, gated by its access key.
    pub fn set(&self, location: &str, presented_key: &str) -> Result<Arc<SubscriptionSet>> {
        let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
        let set = sets
            .get(location)
            .ok_or_else(|| PubSubError::SetNotFound(location.to_string()))?;
        if presented_key != set.access_key {
            return Err(PubSubError::AccessDenied);
        }
        Ok(set.clone())
    }

    /// Delete a set, gated by its access key; its queue is torn down.
    pub async fn delete(&self, location: &str, presented_key: &str) -> Result<()> {
        {
            let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
            let set = sets
                .get(location)
                .ok_or_else(|| PubSubError::SetNotFound(location.to_string()))?;
            if presented_key != set.access_key {
                return Err(PubSubError::AccessDenied);
            }
        }
        self.remove_set(location).await;
        Ok(())
    }

    pub fn combined_document(&self) -> serde_json::Value {
        self.combined.load().to_document()
    }

    pub fn live_set_count(&self) -> usize {
        self.sets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Match an event against the combined set and enqueue one dispatch
    /// item per `(destination, subscription)` pair. Returns the number of
    /// items enqueued.
    pub fn dispatch(&self, event: DispatchEvent) -> Result<usize> {
        if event.via.iter().any(|v| v == &self.service_uri) {
            return Err(PubSubError::LoopDetected);
        }

        let combined = self.combined.load();
        let mut enqueued = 0usize;
        for entry in &combined.entries {
            if !any_channel_matches(&entry.channels, &event.channel) {
                continue;
            }
            if let Some(pattern) = &entry.resource {
                match &event.resource {
                    Some(resource) if uri_matches(pattern, resource) => {}
                    _ => continue,
                }
            }
            let Some(forwarded) = filter_recipients(&event.recipients, &entry.recipients) else {
                continue;
            };

            let mut outgoing = event.clone();
            outgoing.via.push(self.service_uri.clone());
            if !event.recipients.is_empty() {
                outgoing.recipients = forwarded;
            } else if entry.proxy.is_some() {
                // A proxy stands in for the recipients, which travel on the
                // event-recipients header instead.
                outgoing.recipients = entry.recipients.iter().map(|r| r.uri.clone()).collect();
            }

            let destinations = self.destinations_for(entry, &event.recipients);
            let Some(queue) = self.repository.get(&entry.location) else {
                warn!(location = %entry.location, "no queue for live set, skipping");
                continue;
            };
            for destination in destinations {
                queue.enqueue(DispatchItem {
                    destination,
                    location: entry.location.clone(),
                    event: outgoing.clone(),
                })?;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// The destinations a matched entry dispatches to: its proxy when one
    /// is declared, otherwise each (matching) recipient individually.
    fn destinations_for(&self, entry: &CombinedSubscription, event_recipients: &[Uri]) -> Vec<Uri> {
        if let Some(proxy) = &entry.proxy {
            return vec![proxy.clone()];
        }
        let mut destinations: Vec<Uri> = Vec::new();
        for recipient in &entry.recipients {
            let applies = event_recipients.is_empty()
                || event_recipients
                    .iter()
                    .any(|er| er.is_descendant_of(&recipient.uri));
            if applies && !destinations.contains(&recipient.uri) {
                destinations.push(recipient.uri.clone());
            }
        }
        destinations
    }

    /// Deliver one item; the return value feeds the queue's retry logic.
    async fn deliver(self: &Arc<Self>, item: DispatchItem) -> bool {
        let set = {
            let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
            sets.get(&item.location).cloned()
        };
        // The set is gone; drain its leftovers without delivering.
        let Some(set) = set else {
            return true;
        };

        let mut plug = Plug::new(self.router.clone(), item.destination.clone())
            .with_timeout(Duration::from_secs(30));
        if let Some((cookie, token)) = self.delivery_credentials(&set, &item.destination) {
            if let Some(cookie) = cookie {
                plug = plug.with_cookie(Cookie::access_key(cookie, item.destination.path()));
            }
            if let Some(token) = token {
                plug = plug.with_header("X-Auth-Token", &token);
            }
        }

        let reply = plug.post(item.event.to_message()).await;
        let succeeded = matches!(&reply, Ok(msg) if msg.is_success());
        if succeeded {
            self.failures.remove(&item.location);
            debug!(destination = %item.destination, event = %item.event.id, "delivered");
            return true;
        }

        match &reply {
            Ok(msg) => warn!(
                destination = %item.destination,
                status = msg.status,
                event = %item.event.id,
                "recipient refused event"
            ),
            Err(err) => warn!(
                destination = %item.destination,
                error = %err,
                event = %item.event.id,
                "delivery failed"
            ),
        }
        self.record_failure(&set).await;
        false
    }

    /// Failure accounting. Non-expiring sets are kicked once consecutive
    /// failures exceed `max-failures`; expiring sets retry until the oldest
    /// failure is older than `max-failure-duration`.
    async fn record_failure(self: &Arc<Self>, set: &SubscriptionSet) {
        let now = self.clock.now();
        let (consecutive, failing_since) = {
            let mut state = self
                .failures
                .entry(set.location.clone())
                .or_insert_with(|| FailureState {
                    consecutive: 0,
                    failing_since: now,
                });
            state.consecutive += 1;
            (state.consecutive, state.failing_since)
        };

        let kick = match set.max_failure_duration {
            Some(window) => {
                let age = (now - failing_since).whole_seconds().max(0) as u64;
                age > window
            }
            None => consecutive > set.max_failures,
        };
        if kick {
            warn!(
                location = %set.location,
                owner = %set.owner,
                consecutive,
                "kicking failing subscription set"
            );
            // The removal must not run on the queue worker that called us:
            // tearing the queue down joins that worker.
            let dispatcher = self.clone();
            let location = set.location.clone();
            tokio::spawn(async move {
                dispatcher.remove_set(&location).await;
            });
        }
    }

    async fn remove_set(&self, location: &str) {
        let removed = {
            let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
            sets.remove(location)
        };
        if removed.is_none() {
            return;
        }
        self.failures.remove(location);
        if let Err(err) = self.repository.delete(location).await {
            warn!(location, error = %err, "failed to tear down queue");
        }
        info!(location, "subscription set removed");
        self.mark_dirty();
    }

    /// Upsert a peer's combined set under its owner identity (upstream
    /// chaining ingest). Revisions are monotone; stale pushes are ignored.
    pub fn ingest_combined(&self, owner: &Uri, doc: &serde_json::Value) -> Result<()> {
        let revision = doc.get("revision").and_then(|r| r.as_u64());
        let subscriptions: Vec<Subscription> = doc
            .get("subscriptions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| PubSubError::invalid(format!("malformed combined set: {e}")))?
            .unwrap_or_default();

        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        let existing = sets.values().find(|s| &s.owner == owner).cloned();
        let set = match existing {
            Some(current) => {
                if let (Some(new), Some(stored)) = (revision, current.version) {
                    if new < stored {
                        debug!(owner = %owner, "ignoring stale combined-set push");
                        return Ok(());
                    }
                }
                let mut updated = (*current).clone();
                updated.version = revision;
                updated.subscriptions = subscriptions;
                Arc::new(updated)
            }
            None => Arc::new(SubscriptionSet {
                location: id::location_id(),
                owner: owner.clone(),
                access_key: id::access_key(),
                version: revision,
                max_failures: 0,
                max_failure_duration: None,
                subscriptions,
            }),
        };
        self.repository.register_or_update(&set)?;
        sets.insert(set.location.clone(), set);
        drop(sets);
        self.mark_dirty();
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Single-flight maintenance loop: recompute the combined set, emit the
    /// internal update event and refresh chained peers. Bursts of mutations
    /// coalesce into one recomputation.
    fn spawn_maintenance(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let dirty = self.dirty.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = dirty.notified() => {}
                }
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                dispatcher.recompute().await;
            }
        });
    }

    async fn recompute(self: &Arc<Self>) {
        let snapshot: Vec<Arc<SubscriptionSet>> = {
            let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
            sets.values().cloned().collect()
        };
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let combined = CombinedSet::build(&snapshot, revision);
        debug!(revision, entries = combined.entries.len(), "combined set recomputed");
        self.combined.store(Arc::new(combined));

        self.emit_set_update();
        self.push_to_downstreams().await;
    }

    /// Emit the internal update event; listener subscriptions (channel
    /// `pubsub://*/*`) receive the new combined set through their queues.
    fn emit_set_update(self: &Arc<Self>) {
        let channel = match Uri::parse(&format!(
            "{}://{}/set/update",
            uri_scheme::SCHEME_PUBSUB,
            self.service_uri.authority()
        )) {
            Ok(channel) => channel,
            Err(_) => return,
        };
        let body = self.combined_document();
        let event = DispatchEvent {
            id: id::event_id(),
            channel,
            resource: None,
            origins: vec![self.service_uri.clone()],
            recipients: Vec::new(),
            via: Vec::new(),
            content_type: rill_core::message::MIME_JSON.to_string(),
            body: serde_json::to_vec(&body).unwrap_or_default(),
        };
        match self.dispatch(event) {
            Ok(0) => {}
            Ok(count) => debug!(count, "combined-set update dispatched to listeners"),
            Err(err) => warn!(error = %err, "failed to dispatch combined-set update"),
        }
    }

    /// Mirror this dispatcher's combined set to each configured downstream:
    /// every matched event over there should come back to our publish
    /// endpoint.
    async fn push_to_downstreams(self: &Arc<Self>) {
        if self.downstream.is_empty() {
            return;
        }
        let revision = self.revision.load(Ordering::SeqCst);
        let mirror = self.mirror_document(revision);
        for peer in self.downstream.clone() {
            if let Err(err) = self.push_mirror(&peer, &mirror).await {
                warn!(peer = %peer, error = %err, "downstream push failed");
            }
        }
    }

    fn mirror_document(&self, revision: u64) -> serde_json::Value {
        let combined = self.combined.load();
        let subscriptions: Vec<serde_json::Value> = combined
            .entries
            .iter()
            .filter(|entry| {
                !entry
                    .channels
                    .iter()
                    .any(|c| c.scheme() == uri_scheme::SCHEME_PUBSUB)
            })
            .map(|entry| {
                let mut sub = serde_json::Map::new();
                sub.insert(
                    "channels".to_string(),
                    json!(entry.channels.iter().map(Uri::to_string).collect::<Vec<_>>()),
                );
                if let Some(resource) = &entry.resource {
                    sub.insert("resource".to_string(), json!(resource.to_string()));
                }
                sub.insert(
                    "recipients".to_string(),
                    json!([{ "uri": self.publish_uri.to_string() }]),
                );
                serde_json::Value::Object(sub)
            })
            .collect();
        json!({
            "owner": self.service_uri.to_string(),
            "version": revision,
            "subscriptions": subscriptions,
        })
    }

    async fn push_mirror(&self, peer: &Uri, mirror: &serde_json::Value) -> Result<()> {
        let subscribers = peer.at(["subscribers"]);
        let mut links = self.chain_links.lock().await;
        let link = links.get(&peer.to_string());
        match link {
            Some(link) => {
                let plug = Plug::new(
                    self.router.clone(),
                    subscribers.at([link.location.clone()]),
                )
                .with("access-key", &link.access_key);
                let reply = plug
                    .put(Message::request_document(mirror.clone()))
                    .await
                    .map_err(PubSubError::Core)?;
                // 304 means the peer already has this revision.
                if !reply.is_success() && reply.status != rill_core::status::NOT_MODIFIED {
                    links.remove(&peer.to_string());
                    return Err(PubSubError::invalid(format!(
                        "downstream refused mirror update with {}",
                        reply.status
                    )));
                }
            }
            None => {
                let plug = Plug::new(self.router.clone(), subscribers);
                let reply = plug
                    .post(Message::request_document(mirror.clone()))
                    .await
                    .map_err(PubSubError::Core)?;
                match reply.status {
                    // A 409 means our earlier registration is still live at
                    // the peer; adopt its location and key.
                    rill_core::status::CREATED | rill_core::status::CONFLICT => {
                        let location_header = if reply.status == rill_core::status::CREATED {
                            headers::LOCATION
                        } else {
                            headers::CONTENT_LOCATION
                        };
                        let location = reply
                            .headers
                            .get(location_header)
                            .and_then(|l| Uri::parse(l).ok())
                            .and_then(|u| u.last_segment().map(str::to_string))
                            .ok_or_else(|| {
                                PubSubError::invalid("downstream reply lacks a location")
                            })?;
                        let access_key = reply
                            .document()
                            .and_then(|d| {
                                d.get("access-key").and_then(|k| k.as_str().map(str::to_string))
                            })
                            .ok_or_else(|| {
                                PubSubError::invalid("downstream reply lacks an access key")
                            })?;
                        links.insert(peer.to_string(), ChainLink {
                            location,
                            access_key,
                        });
                        info!(peer = %peer, "chained to downstream");
                    }
                    other => {
                        return Err(PubSubError::invalid(format!(
                            "downstream registration failed with {other}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Register a listener subscription at each configured upstream so its
    /// combined set flows to our ingest endpoint.
    async fn register_at_upstreams(self: &Arc<Self>) {
        for peer in &self.upstream {
            let listener = json!({
                "owner": self.service_uri.to_string(),
                "subscriptions": [{
                    "channels": [format!("{}://*/**", uri_scheme::SCHEME_PUBSUB)],
                    "recipients": [{ "uri": self.ingest_uri.to_string() }],
                }],
            });
            let plug = Plug::new(self.router.clone(), peer.at(["subscribers"]));
            match plug.post(Message::request_document(listener)).await {
                Ok(reply) if reply.status == rill_core::status::CREATED => {
                    info!(peer = %peer, "listening to upstream");
                }
                Ok(reply) => {
                    warn!(peer = %peer, status = reply.status, "upstream registration refused");
                }
                Err(err) => {
                    warn!(peer = %peer, error = %err, "upstream registration failed");
                }
            }
        }
    }

    /// Stop maintenance and drain the queues without losing persisted
    /// state.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.repository.dispose_all().await;
        info!(service = %self.service_uri, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn parse_peer_uris(config: &ConfigNode, section: &str) -> Result<Vec<Uri>> {
    let mut uris = Vec::new();
    for node in config.child(section).list("uri") {
        if let Some(raw) = node.as_str() {
            uris.push(Uri::parse(raw).map_err(PubSubError::Core)?);
        }
    }
    Ok(uris)
}

impl DispatchEvent {
    /// Render the event as the outbound request delivered to a recipient.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::request_bytes(self.body.clone(), &self.content_type);
        msg.headers.set(headers::EVENT_ID, &self.id);
        msg.headers.set(headers::EVENT_CHANNEL, self.channel.to_string());
        if let Some(resource) = &self.resource {
            msg.headers.set(headers::EVENT_RESOURCE, resource.to_string());
        }
        for origin in &self.origins {
            msg.headers.add(headers::EVENT_ORIGIN, origin.to_string());
        }
        for recipient in &self.recipients {
            msg.headers.add(headers::EVENT_RECIPIENTS, recipient.to_string());
        }
        for via in &self.via {
            msg.headers.add(headers::EVENT_VIA, via.to_string());
        }
        msg
    }

    /// Parse an event from a publish request.
    pub fn from_message(msg: &Message) -> std::result::Result<Self, PubSubError> {
        let channel = msg
            .headers
            .get(headers::EVENT_CHANNEL)
            .ok_or_else(|| PubSubError::invalid("publish request lacks an event channel"))?;
        let channel = Uri::parse(channel).map_err(PubSubError::Core)?;
        let parse_list = |name: &str| -> std::result::Result<Vec<Uri>, PubSubError> {
            msg.headers
                .get_all(name)
                .into_iter()
                .map(|raw| Uri::parse(raw).map_err(PubSubError::Core))
                .collect()
        };
        let resource = match msg.headers.get(headers::EVENT_RESOURCE) {
            Some(raw) => Some(Uri::parse(raw).map_err(PubSubError::Core)?),
            None => None,
        };
        Ok(Self {
            id: msg
                .headers
                .get(headers::EVENT_ID)
                .map(str::to_string)
                .unwrap_or_else(id::event_id),
            channel,
            resource,
            origins: parse_list(headers::EVENT_ORIGIN)?,
            recipients: parse_list(headers::EVENT_RECIPIENTS)?,
            via: parse_list(headers::EVENT_VIA)?,
            content_type: msg
                .content_type()
                .unwrap_or(rill_core::message::MIME_OCTET_STREAM)
                .to_string(),
            body: msg.bytes(),
        })
    }
}

impl Dispatcher {
    fn delivery_credentials(
        &self,
        set: &SubscriptionSet,
        destination: &Uri,
    ) -> Option<(Option<String>, Option<String>)> {
        for sub in &set.subscriptions {
            if sub.proxy.as_ref() == Some(destination) {
                return Some((sub.set_cookie.clone(), None));
            }
            if let Some(recipient) = recipient_for(sub, destination) {
                return Some((sub.set_cookie.clone(), recipient.auth_token.clone()));
            }
        }
        None
    }
}

fn recipient_for<'a>(sub: &'a Subscription, destination: &Uri) -> Option<&'a Recipient> {
    sub.recipients.iter().find(|r| &r.uri == destination)
}
