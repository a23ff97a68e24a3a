//! Trie of path segments → verb-grouped features, and the resolution rules
//! that pick exactly one feature for a request.

use std::collections::HashMap;
use std::sync::Arc;

use crate::feature::{Feature, PatternSegment, verb};

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    wildcard: Option<Box<Node>>,
    features: Vec<(u64, Arc<Feature>)>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.wildcard.is_none() && self.features.is_empty()
    }
}

/// Outcome of resolving `(verb, path)` against the directory.
#[derive(Debug)]
pub enum Resolution {
    /// Exactly one feature selected.
    Feature(Arc<Feature>),
    /// `OPTIONS` with no explicit feature: reply 200 with these verbs.
    Options(Vec<String>),
    /// Path resolves but the verb does not; alphabetized distinct verbs.
    MethodNotAllowed(Vec<String>),
    /// No candidate at the deepest matching node.
    NotFound,
}

/// Registry of installed features.
#[derive(Default)]
pub struct FeatureDirectory {
    root: Node,
    next_registration: u64,
}

impl FeatureDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: Arc<Feature>) {
        let order = self.next_registration;
        self.next_registration += 1;

        let mut node = &mut self.root;
        for segment in feature.trie_path() {
            node = match segment {
                PatternSegment::Literal(name) => node.children.entry(name).or_default(),
                PatternSegment::Wildcard => node.wildcard.get_or_insert_with(Box::default),
            };
        }
        node.features.push((order, feature));
    }

    /// Remove every feature installed under `service_path`, pruning nodes
    /// left empty.
    pub fn remove_service(&mut self, service_path: &[String]) {
        fn prune(node: &mut Node, service_path: &[String]) {
            node.features
                .retain(|(_, f)| f.service_path != service_path);
            for child in node.children.values_mut() {
                prune(child, service_path);
            }
            node.children.retain(|_, c| !c.is_empty());
            if let Some(wildcard) = node.wildcard.as_mut() {
                prune(wildcard, service_path);
                if wildcard.is_empty() {
                    node.wildcard = None;
                }
            }
        }
        prune(&mut self.root, service_path);
    }

    /// All installed features, for diagnostics.
    pub fn list(&self) -> Vec<Arc<Feature>> {
        fn walk(node: &Node, out: &mut Vec<(u64, Arc<Feature>)>) {
            out.extend(node.features.iter().cloned());
            for child in node.children.values() {
                walk(child, out);
            }
            if let Some(wildcard) = &node.wildcard {
                walk(wildcard, out);
            }
        }
        let mut all = Vec::new();
        walk(&self.root, &mut all);
        all.sort_by_key(|(order, _)| *order);
        all.into_iter().map(|(_, f)| f).collect()
    }

    /// Resolve a request. See the selection rules on [`Resolution`].
    pub fn resolve(&self, request_verb: &str, segments: &[String]) -> Resolution {
        let request_verb = request_verb.to_ascii_uppercase();

        // Deepest node reachable along the request path; literal children
        // preferred over the wildcard on equal depth.
        fn deepest<'a>(node: &'a Node, segments: &[String], depth: usize) -> (&'a Node, usize) {
            if let Some(next) = segments.first() {
                let mut best = (node, depth);
                if let Some(child) = node.children.get(next) {
                    let candidate = deepest(child, &segments[1..], depth + 1);
                    if candidate.1 > best.1 {
                        best = candidate;
                    }
                }
                if let Some(wildcard) = &node.wildcard {
                    let candidate = deepest(wildcard, &segments[1..], depth + 1);
                    if candidate.1 > best.1 {
                        best = candidate;
                    }
                }
                best
            } else {
                (node, depth)
            }
        }

        let (node, level) = deepest(&self.root, segments, 0);
        let slack = segments.len() - level;

        let candidates: Vec<&(u64, Arc<Feature>)> = node
            .features
            .iter()
            .filter(|(_, f)| f.optional_segments() >= slack)
            .collect();

        if candidates.is_empty() {
            return Resolution::NotFound;
        }

        let select = |wanted: &str| -> Option<Arc<Feature>> {
            let mut matched: Vec<&(u64, Arc<Feature>)> = candidates
                .iter()
                .filter(|(_, f)| f.verb == wanted)
                .copied()
                .collect();
            if matched.is_empty() {
                matched = candidates
                    .iter()
                    .filter(|(_, f)| f.verb == verb::ANY)
                    .copied()
                    .collect();
            }
            // Largest literal segment count wins; ties go to the earliest
            // registration.
            matched
                .into_iter()
                .max_by(|(ao, a), (bo, b)| {
                    a.literal_count()
                        .cmp(&b.literal_count())
                        .then(bo.cmp(ao))
                })
                .map(|(_, f)| f.clone())
        };

        if let Some(feature) = select(&request_verb) {
            return Resolution::Feature(feature);
        }
        if request_verb == verb::HEAD {
            if let Some(feature) = select(verb::GET) {
                return Resolution::Feature(feature);
            }
        }

        let allowed = Self::allowed_verbs(&candidates);
        if request_verb == verb::OPTIONS {
            return Resolution::Options(allowed);
        }
        Resolution::MethodNotAllowed(allowed)
    }

    fn allowed_verbs(candidates: &[&(u64, Arc<Feature>)]) -> Vec<String> {
        let mut verbs: Vec<String> = candidates
            .iter()
            .map(|(_, f)| f.verb.clone())
            .filter(|v| v != verb::ANY)
            .collect();
        verbs.sort();
        verbs.dedup();
        verbs
    }
}
