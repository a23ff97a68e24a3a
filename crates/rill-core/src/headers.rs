//! Case-insensitive header multimap preserving insertion order per key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Request id assigned by the host on admission and echoed on the reply.
pub const REQUEST_ID: &str = "X-Request-Id";
/// Unique id of a published event.
pub const EVENT_ID: &str = "X-Event-Id";
/// Channel the event was published on.
pub const EVENT_CHANNEL: &str = "X-Event-Channel";
/// Resource the event refers to, if any.
pub const EVENT_RESOURCE: &str = "X-Event-Resource";
/// Ordered origins of the event (repeated header).
pub const EVENT_ORIGIN: &str = "X-Event-Origin";
/// Ordered recipient URIs of the event (repeated header).
pub const EVENT_RECIPIENTS: &str = "X-Event-Recipients";
/// Ordered dispatcher URIs the event already traversed (repeated header).
pub const EVENT_VIA: &str = "X-Event-Via";
pub const FORWARDED_HOST: &str = "X-Forwarded-Host";
pub const FRONT_END_HTTPS: &str = "Front-End-Https";
pub const HOST: &str = "Host";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const ALLOW: &str = "Allow";
pub const LOCATION: &str = "Location";
pub const CONTENT_LOCATION: &str = "Content-Location";
/// Desired opaque location id on subscription-set registration.
pub const SET_LOCATION_KEY: &str = "X-Set-Location-Key";
/// Desired (or rotated) access key on subscription-set registration.
pub const SET_ACCESS_KEY: &str = "X-Set-Access-Key";
/// Service key presented by internal callers.
pub const SERVICE_KEY: &str = "X-Service-Key";
/// Master api key presented to host administration features.
pub const API_KEY: &str = "X-ApiKey";

/// Ordered multimap of header name → values.
///
/// Lookup is case-insensitive; names keep the casing they were first added
/// with, and values for a repeated name keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value for `name` with a single value. The entry keeps
    /// the position of the first prior occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(pos) = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            self.entries
                .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            self.entries.insert(pos.min(self.entries.len()), (name.to_string(), value));
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Append a value for `name`, preserving prior values.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            writeln!(f, "{k}: {v}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn repeated_names_preserve_order() {
        let mut headers = Headers::new();
        headers.add(EVENT_ORIGIN, "http://a");
        headers.add("other", "x");
        headers.add(EVENT_ORIGIN, "http://b");
        assert_eq!(headers.get_all(EVENT_ORIGIN), vec!["http://a", "http://b"]);
        assert_eq!(headers.get(EVENT_ORIGIN), Some("http://a"));
    }

    #[test]
    fn set_replaces_all_values_in_place() {
        let mut headers = Headers::new();
        headers.add("a", "1");
        headers.add("b", "2");
        headers.add("A", "3");
        headers.set("a", "replaced");
        assert_eq!(headers.get_all("a"), vec!["replaced"]);
        // keeps the slot of the first occurrence
        assert_eq!(headers.iter().next(), Some(("a", "replaced")));
    }

    #[test]
    fn remove_drops_every_occurrence() {
        let mut headers = Headers::new();
        headers.add("x", "1");
        headers.add("X", "2");
        headers.remove("x");
        assert!(headers.is_empty());
    }
}
