//! Typed accessors over free-form configuration documents.
//!
//! Configuration reaches hosts and services as a JSON document; callers read
//! it through [`ConfigNode`] with named child accessors returning optional
//! typed values. Unknown keys are preserved and ignored.

use serde_json::Value;

/// An immutable view into a configuration document.
#[derive(Debug, Clone, Default)]
pub struct ConfigNode {
    value: Value,
}

impl ConfigNode {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// A node with no content; every accessor returns `None`.
    pub fn empty() -> Self {
        Self { value: Value::Null }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_null()
    }

    /// The named child, or an empty node.
    pub fn child(&self, name: &str) -> ConfigNode {
        match self.value.get(name) {
            Some(v) => ConfigNode::new(v.clone()),
            None => ConfigNode::empty(),
        }
    }

    /// Walk a dotted path, e.g. `at("dream.env.debug")`. A flat key holding
    /// the full dotted name shadows the nested walk. Never panics.
    pub fn at(&self, dotted: &str) -> ConfigNode {
        if let Some(flat) = self.value.get(dotted) {
            return ConfigNode::new(flat.clone());
        }
        let mut node = self.clone();
        for part in dotted.split('.') {
            node = node.child(part);
        }
        node
    }

    /// Children of a named key, treating a single value as a one-entry list.
    ///
    /// Both `{"uri": "http://a"}` and `{"uri": ["http://a", "http://b"]}`
    /// yield nodes for each uri.
    pub fn list(&self, name: &str) -> Vec<ConfigNode> {
        match self.value.get(name) {
            Some(Value::Array(items)) => {
                items.iter().map(|v| ConfigNode::new(v.clone())).collect()
            }
            Some(v) => vec![ConfigNode::new(v.clone())],
            None => Vec::new(),
        }
    }

    /// Named entries of an object node, in document order.
    pub fn entries(&self) -> Vec<(String, ConfigNode)> {
        match &self.value {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), ConfigNode::new(v.clone())))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Booleans accept JSON booleans plus `"true"`/`"false"`/`"on"`/`"off"`.
    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" => Some(true),
                "false" | "off" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn str_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.as_str().unwrap_or(default)
    }

    pub fn i64_or(&self, default: i64) -> i64 {
        self.as_i64().unwrap_or(default)
    }

    pub fn u64_or(&self, default: u64) -> u64 {
        self.as_u64().unwrap_or(default)
    }

    pub fn bool_or(&self, default: bool) -> bool {
        self.as_bool().unwrap_or(default)
    }
}

impl From<Value> for ConfigNode {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ConfigNode {
        ConfigNode::new(json!({
            "connect-limit": 8,
            "reentrancy-limit": "20",
            "memorize-aliases": "on",
            "dream": { "env": { "debug": "debugger-only" } },
            "downstream": { "uri": ["http://b/pubsub", "http://c/pubsub"] },
            "upstream": { "uri": "http://a/pubsub" },
            "unknown-key": { "nested": true }
        }))
    }

    #[test]
    fn typed_getters_coerce_strings() {
        let cfg = sample();
        assert_eq!(cfg.child("connect-limit").as_i64(), Some(8));
        assert_eq!(cfg.child("reentrancy-limit").as_i64(), Some(20));
        assert_eq!(cfg.child("memorize-aliases").as_bool(), Some(true));
        assert_eq!(cfg.child("missing").as_i64(), None);
    }

    #[test]
    fn dotted_path_walks_nested_objects() {
        let cfg = sample();
        assert_eq!(cfg.at("dream.env.debug").as_str(), Some("debugger-only"));
        assert!(cfg.at("dream.env.missing.deeper").is_empty());
    }

    #[test]
    fn flat_dotted_keys_shadow_the_nested_walk() {
        let cfg = ConfigNode::new(json!({
            "dream.apikey": "flat-key",
            "dream": { "apikey": "nested-key" }
        }));
        assert_eq!(cfg.at("dream.apikey").as_str(), Some("flat-key"));
        assert_eq!(cfg.at("dream.missing").as_str(), None);
    }

    #[test]
    fn list_wraps_single_values() {
        let cfg = sample();
        let down: Vec<_> = cfg
            .child("downstream")
            .list("uri")
            .iter()
            .filter_map(|n| n.as_str().map(str::to_string))
            .collect();
        assert_eq!(down, vec!["http://b/pubsub", "http://c/pubsub"]);

        let up = cfg.child("upstream").list("uri");
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].as_str(), Some("http://a/pubsub"));
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let cfg = sample();
        assert_eq!(cfg.at("unknown-key.nested").as_bool(), Some(true));
    }
}
