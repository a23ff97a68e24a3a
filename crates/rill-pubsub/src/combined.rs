//! The dispatcher's merged view across all live subscription sets.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use rill_core::Uri;

use crate::subscription::{Recipient, Subscription, SubscriptionSet};

/// One matchable entry of the combined view. Entries keep their owning
/// set's location so dispatch items land on that set's queue, and the
/// set-cookie travels with deliveries.
#[derive(Debug, Clone)]
pub struct CombinedSubscription {
    pub location: String,
    pub channels: Vec<Uri>,
    pub resource: Option<Uri>,
    pub proxy: Option<Uri>,
    pub recipients: Vec<Recipient>,
    pub set_cookie: Option<String>,
}

/// Immutable snapshot of the combined set, swapped atomically on every
/// recomputation.
#[derive(Debug, Default)]
pub struct CombinedSet {
    pub entries: Vec<CombinedSubscription>,
    /// Monotone revision, bumped per recomputation; the most recent
    /// revision wins when pushes coalesce.
    pub revision: u64,
}

impl CombinedSet {
    /// Merge the live sets. Within a set, subscriptions sharing
    /// `(channels, resource, proxy)` collapse into one entry with their
    /// recipients deduplicated by URI.
    pub fn build(sets: &[Arc<SubscriptionSet>], revision: u64) -> Self {
        let mut merged: BTreeMap<(String, String), CombinedSubscription> = BTreeMap::new();
        for set in sets {
            for sub in &set.subscriptions {
                let key = (set.location.clone(), subscription_key(sub));
                match merged.get_mut(&key) {
                    Some(entry) => merge_recipients(&mut entry.recipients, &sub.recipients),
                    None => {
                        merged.insert(
                            key,
                            CombinedSubscription {
                                location: set.location.clone(),
                                channels: sub.channels.clone(),
                                resource: sub.resource.clone(),
                                proxy: sub.proxy.clone(),
                                recipients: sub.recipients.clone(),
                                set_cookie: sub.set_cookie.clone(),
                            },
                        );
                    }
                }
            }
        }
        Self {
            entries: merged.into_values().collect(),
            revision,
        }
    }

    /// External document view: entries collapse across sets by
    /// `(channels, resource, proxy-or-destination)` with recipients
    /// deduplicated by URI.
    pub fn to_document(&self) -> Value {
        let mut merged: BTreeMap<String, (Vec<Uri>, Option<Uri>, Option<Uri>, Vec<Recipient>)> =
            BTreeMap::new();
        for entry in &self.entries {
            let key = format!(
                "{}|{}|{}",
                normalized_channels(&entry.channels).join(","),
                entry.resource.as_ref().map(Uri::to_string).unwrap_or_default(),
                entry.proxy.as_ref().map(Uri::to_string).unwrap_or_default(),
            );
            match merged.get_mut(&key) {
                Some((_, _, _, recipients)) => merge_recipients(recipients, &entry.recipients),
                None => {
                    merged.insert(
                        key,
                        (
                            entry.channels.clone(),
                            entry.resource.clone(),
                            entry.proxy.clone(),
                            entry.recipients.clone(),
                        ),
                    );
                }
            }
        }

        let subscriptions: Vec<Value> = merged
            .into_values()
            .map(|(channels, resource, proxy, recipients)| {
                let mut sub = serde_json::Map::new();
                sub.insert(
                    "channels".to_string(),
                    json!(channels.iter().map(Uri::to_string).collect::<Vec<_>>()),
                );
                if let Some(resource) = resource {
                    sub.insert("resource".to_string(), json!(resource.to_string()));
                }
                if let Some(proxy) = proxy {
                    sub.insert("proxy".to_string(), json!(proxy.to_string()));
                }
                sub.insert(
                    "recipients".to_string(),
                    json!(
                        recipients
                            .iter()
                            .map(|r| json!({ "uri": r.uri.to_string() }))
                            .collect::<Vec<_>>()
                    ),
                );
                Value::Object(sub)
            })
            .collect();

        json!({
            "revision": self.revision,
            "subscriptions": subscriptions,
        })
    }
}

fn subscription_key(sub: &Subscription) -> String {
    format!(
        "{}|{}|{}",
        normalized_channels(&sub.channels).join(","),
        sub.resource.as_ref().map(Uri::to_string).unwrap_or_default(),
        sub.proxy.as_ref().map(Uri::to_string).unwrap_or_default(),
    )
}

fn normalized_channels(channels: &[Uri]) -> Vec<String> {
    let mut out: Vec<String> = channels.iter().map(Uri::to_string).collect();
    out.sort();
    out.dedup();
    out
}

fn merge_recipients(into: &mut Vec<Recipient>, from: &[Recipient]) {
    for recipient in from {
        if !into.iter().any(|r| r.uri == recipient.uri) {
            into.push(recipient.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(location: &str, owner: &str, subs: Value) -> Arc<SubscriptionSet> {
        Arc::new(
            SubscriptionSet::from_document(&json!({
                "owner": owner,
                "subscriptions": subs,
            }))
            .map(|mut set| {
                set.location = location.to_string();
                set
            })
            .unwrap(),
        )
    }

    #[test]
    fn entries_keep_their_set_location() {
        let a = set(
            "loc-a",
            "http://o/1",
            json!([{ "channels": ["channel:///foo/*"], "recipients": [{ "uri": "http://r/1" }] }]),
        );
        let b = set(
            "loc-b",
            "http://o/2",
            json!([{ "channels": ["channel:///foo/*"], "recipients": [{ "uri": "http://r/2" }] }]),
        );
        let combined = CombinedSet::build(&[a, b], 1);
        assert_eq!(combined.entries.len(), 2);
        let locations: Vec<&str> = combined
            .entries
            .iter()
            .map(|e| e.location.as_str())
            .collect();
        assert!(locations.contains(&"loc-a"));
        assert!(locations.contains(&"loc-b"));
    }

    #[test]
    fn duplicate_subscriptions_within_a_set_merge_recipients() {
        let a = set(
            "loc-a",
            "http://o/1",
            json!([
                { "channels": ["channel:///foo/*"], "recipients": [{ "uri": "http://r/1" }] },
                { "channels": ["channel:///foo/*"], "recipients": [{ "uri": "http://r/2" }, { "uri": "http://r/1" }] }
            ]),
        );
        let combined = CombinedSet::build(&[a], 1);
        assert_eq!(combined.entries.len(), 1);
        assert_eq!(combined.entries[0].recipients.len(), 2);
    }

    #[test]
    fn document_view_merges_across_sets() {
        let a = set(
            "loc-a",
            "http://o/1",
            json!([{ "channels": ["channel:///foo/*"], "recipients": [{ "uri": "http://r/1" }] }]),
        );
        let b = set(
            "loc-b",
            "http://o/2",
            json!([{ "channels": ["channel:///foo/*"], "recipients": [{ "uri": "http://r/2" }] }]),
        );
        let doc = CombinedSet::build(&[a, b], 7).to_document();
        assert_eq!(doc["revision"], 7);
        let subs = doc["subscriptions"].as_array().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0]["recipients"].as_array().unwrap().len(), 2);
    }
}
