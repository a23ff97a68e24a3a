//! Subscription sets: an owner's complete, versioned list of subscriptions.

use serde::{Deserialize, Serialize};
use rill_core::{Uri, id};

use crate::error::{PubSubError, Result};

/// A delivery target of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Recipient {
    pub uri: Uri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Recipient {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            auth_token: None,
        }
    }
}

/// One subscription: channels plus optional resource filter, recipients and
/// an optional proxy destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Subscription {
    #[serde(default = "id::event_id")]
    pub id: String,
    pub channels: Vec<Uri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Uri>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Uri>,
    /// Cookie value presented to recipients on delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_cookie: Option<String>,
}

impl Subscription {
    /// A subscription is a listener when one of its channels uses the
    /// `pubsub` scheme; listeners receive combined-set pushes.
    pub fn is_listener(&self) -> bool {
        self.channels
            .iter()
            .any(|c| c.scheme() == rill_core::uri::SCHEME_PUBSUB)
    }
}

/// An owner's registered set of subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubscriptionSet {
    #[serde(default)]
    pub location: String,
    pub owner: Uri,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key: String,
    /// Monotone version; replacements with a lower version are refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Consecutive delivery failures tolerated before the set is kicked.
    #[serde(default)]
    pub max_failures: u64,
    /// When present the set is *expiring*: deliveries retry indefinitely but
    /// the set is dropped once the oldest failure is older than this many
    /// seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failure_duration: Option<u64>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Parse and validate a registration document.
    pub fn from_document(doc: &serde_json::Value) -> Result<Self> {
        let set: SubscriptionSet = serde_json::from_value(doc.clone())
            .map_err(|e| PubSubError::invalid(format!("malformed subscription set: {e}")))?;
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        for sub in &self.subscriptions {
            if sub.channels.is_empty() {
                return Err(PubSubError::invalid(format!(
                    "subscription '{}' declares no channels",
                    sub.id
                )));
            }
            if sub.recipients.is_empty() && sub.proxy.is_none() {
                return Err(PubSubError::invalid(format!(
                    "subscription '{}' has neither recipients nor a proxy",
                    sub.id
                )));
            }
        }
        Ok(())
    }

    pub fn is_expiring(&self) -> bool {
        self.max_failure_duration.is_some()
    }

    /// Does this set contain a listener subscription (combined-set push
    /// target)?
    pub fn has_listener(&self) -> bool {
        self.subscriptions.iter().any(Subscription::is_listener)
    }

    /// Apply a replacement document, enforcing owner identity and version
    /// monotonicity. The incoming version field is adopted verbatim: a
    /// replacement without a version clears the stored one, which is how
    /// clients force an overwrite.
    pub fn replace_from(&mut self, incoming: SubscriptionSet) -> Result<()> {
        if incoming.owner != self.owner {
            return Err(PubSubError::OwnerMismatch);
        }
        if let (Some(new), Some(stored)) = (incoming.version, self.version) {
            if new < stored {
                return Err(PubSubError::StaleVersion);
            }
        }
        self.version = incoming.version;
        self.max_failures = incoming.max_failures;
        self.max_failure_duration = incoming.max_failure_duration;
        self.subscriptions = incoming.subscriptions;
        Ok(())
    }

    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
