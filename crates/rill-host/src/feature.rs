//! Feature definitions: declared request handlers keyed by verb and path
//! pattern, with their pipeline stages and blueprint descriptors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use rill_core::{CoreError, Result, Uri};

use crate::context::{Access, HandlerFn};

/// Request verbs. Features may be declared with [`verb::ANY`] to match all.
pub mod verb {
    pub const GET: &str = "GET";
    pub const POST: &str = "POST";
    pub const PUT: &str = "PUT";
    pub const DELETE: &str = "DELETE";
    pub const HEAD: &str = "HEAD";
    pub const OPTIONS: &str = "OPTIONS";
    pub const ANY: &str = "*";
}

/// One segment of a feature's path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    Literal(String),
    /// `*`: matches exactly one request segment.
    Wildcard,
}

/// A parsed feature signature.
///
/// Signatures are slash-separated segments; `*` matches any single segment
/// and a `??` suffix marks a trailing optional segment, e.g.
/// `subscribers/*` or `status/detail??`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub segments: Vec<PatternSegment>,
    pub optional: usize,
}

impl Signature {
    pub fn parse(signature: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut optional = 0;
        for raw in signature.split('/').filter(|s| !s.is_empty()) {
            let (name, is_optional) = match raw.strip_suffix("??") {
                Some(stripped) => (stripped, true),
                None => (raw, false),
            };
            if is_optional {
                optional += 1;
            } else if optional > 0 {
                return Err(CoreError::input(format!(
                    "optional segments must be trailing in signature '{signature}'"
                )));
            }
            if !is_optional {
                segments.push(match name {
                    "*" => PatternSegment::Wildcard,
                    _ => PatternSegment::Literal(name.to_string()),
                });
            }
        }
        Ok(Self { segments, optional })
    }

    /// Count of literal segments, used for resolution tie-breaks.
    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, PatternSegment::Literal(_)))
            .count()
    }
}

/// Declared parameter of a feature, carried in the blueprint for callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Blueprint entry describing one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub verb: String,
    pub signature: String,
    pub method: String,
    pub access: Access,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Blueprint of a service: its ids and the features it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sids: Vec<Uri>,
    /// Implementation hint (registered class name).
    pub class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<FeatureDescriptor>,
}

/// One pipeline stage: an access gate around a handler.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub access: Access,
    pub handler: HandlerFn,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("access", &self.access)
            .finish()
    }
}

/// Exception translator: first one returning a message wins.
pub type Translator = Arc<
    dyn Fn(&crate::context::Context, &CoreError) -> Option<rill_core::Message> + Send + Sync,
>;

/// An installed feature: service path + signature, resolved stages and
/// bookkeeping. Stages are ordered `[default prologues…, service prologues…,
/// main, service epilogues…, default epilogues…]`.
pub struct Feature {
    pub service_path: Vec<String>,
    pub verb: String,
    pub signature: Signature,
    pub access: Access,
    pub stages: Vec<Stage>,
    pub main_stage: usize,
    pub translators: Vec<Translator>,
    pub descriptor: FeatureDescriptor,
    hits: AtomicU64,
}

impl Feature {
    pub fn new(
        service_path: Vec<String>,
        verb: &str,
        signature: Signature,
        access: Access,
        stages: Vec<Stage>,
        main_stage: usize,
        translators: Vec<Translator>,
        descriptor: FeatureDescriptor,
    ) -> Self {
        Self {
            service_path,
            verb: verb.to_ascii_uppercase(),
            signature,
            access,
            stages,
            main_stage,
            translators,
            descriptor,
            hits: AtomicU64::new(0),
        }
    }

    /// Full trie path: service path followed by the signature's required
    /// segments.
    pub fn trie_path(&self) -> Vec<PatternSegment> {
        let mut path: Vec<PatternSegment> = self
            .service_path
            .iter()
            .map(|s| PatternSegment::Literal(s.clone()))
            .collect();
        path.extend(self.signature.segments.iter().cloned());
        path
    }

    pub fn literal_count(&self) -> usize {
        self.service_path.len() + self.signature.literal_count()
    }

    pub fn optional_segments(&self) -> usize {
        self.signature.optional
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("verb", &self.verb)
            .field("service_path", &self.service_path)
            .field("signature", &self.descriptor.signature)
            .field("hits", &self.hits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_signature() {
        let sig = Signature::parse("subscribers/next").unwrap();
        assert_eq!(sig.segments.len(), 2);
        assert_eq!(sig.optional, 0);
        assert_eq!(sig.literal_count(), 2);
    }

    #[test]
    fn parses_wildcard_and_optional() {
        let sig = Signature::parse("subscribers/*/detail??").unwrap();
        assert_eq!(
            sig.segments,
            vec![
                PatternSegment::Literal("subscribers".into()),
                PatternSegment::Wildcard
            ]
        );
        assert_eq!(sig.optional, 1);
        assert_eq!(sig.literal_count(), 1);
    }

    #[test]
    fn rejects_non_trailing_optional() {
        assert!(Signature::parse("a??/b").is_err());
    }

    #[test]
    fn empty_signature_matches_service_root() {
        let sig = Signature::parse("").unwrap();
        assert!(sig.segments.is_empty());
        assert_eq!(sig.optional, 0);
    }
}
