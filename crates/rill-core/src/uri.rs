//! Normalized absolute references used throughout the host and fabric.
//!
//! A [`Uri`] is immutable; all derivations (`at`, `with`, `without_query`, …)
//! return a new value. Two URIs compare equal after normalization: the scheme
//! and host are lower-cased, percent-encoded unreserved octets are decoded,
//! and an empty path canonicalizes to `/`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, Result};

/// Scheme used for in-process service addresses (`local://<guid>/…`).
pub const SCHEME_LOCAL: &str = "local";
/// Scheme used for event channels (`channel:///deck/cards/*`).
pub const SCHEME_CHANNEL: &str = "channel";
/// Scheme used for fabric-internal channels (`pubsub://<host>/set/update`).
pub const SCHEME_PUBSUB: &str = "pubsub";

/// An absolute reference with ordered path segments and ordered query pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: String,
    host: String,
    port: Option<u16>,
    segments: Vec<String>,
    query: Vec<(String, String)>,
    fragment: Option<String>,
}

impl Uri {
    /// Parse and normalize an absolute reference.
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input.trim();
        let (scheme, rest) = rest
            .split_once("://")
            .ok_or_else(|| CoreError::input(format!("missing scheme in uri '{input}'")))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
            return Err(CoreError::input(format!("invalid scheme in uri '{input}'")));
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((r, f)) => (r, Some(percent_decode(f)?)),
            None => (rest, None),
        };
        let (rest, query_str) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| CoreError::input(format!("invalid port in uri '{input}'")))?;
                (h, Some(port))
            }
            Some((h, _)) => (h, None),
            None => (authority, None),
        };

        let mut segments = Vec::new();
        for seg in path.split('/') {
            if seg.is_empty() {
                continue;
            }
            segments.push(percent_decode(seg)?);
        }

        let mut query = Vec::new();
        if let Some(q) = query_str {
            for pair in q.split('&') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((k, v)) => query.push((percent_decode(k)?, percent_decode(v)?)),
                    None => query.push((percent_decode(pair)?, String::new())),
                }
            }
        }

        let scheme = scheme.to_ascii_lowercase();
        let port = normalize_port(&scheme, port);
        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            segments,
            query,
            fragment,
        })
    }

    /// An in-process service address rooted at the host guid.
    pub fn local(guid: &str) -> Self {
        Self {
            scheme: SCHEME_LOCAL.to_string(),
            host: guid.to_ascii_lowercase(),
            port: None,
            segments: Vec::new(),
            query: Vec::new(),
            fragment: None,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host` or `host:port` when a non-default port is present.
    pub fn authority(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The canonical path, `/` when empty.
    pub fn path(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            out.push_str(&encode(seg, ENCODE_SEGMENT));
        }
        out
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// First value for `key`, if any.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order.
    pub fn query_all(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn is_local(&self) -> bool {
        self.scheme == SCHEME_LOCAL
    }

    /// Append path segments.
    pub fn at<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut uri = self.clone();
        uri.segments.extend(segments.into_iter().map(Into::into));
        uri
    }

    /// Append a single query pair. Duplicates are preserved in order.
    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut uri = self.clone();
        uri.query.push((key.to_string(), value.to_string()));
        uri
    }

    /// Drop every query pair.
    pub fn without_query(&self) -> Self {
        let mut uri = self.clone();
        uri.query.clear();
        uri
    }

    /// Drop every query pair whose key equals `key`.
    pub fn without(&self, key: &str) -> Self {
        let mut uri = self.clone();
        uri.query.retain(|(k, _)| k != key);
        uri
    }

    pub fn with_fragment(&self, fragment: &str) -> Self {
        let mut uri = self.clone();
        uri.fragment = Some(fragment.to_string());
        uri
    }

    pub fn without_fragment(&self) -> Self {
        let mut uri = self.clone();
        uri.fragment = None;
        uri
    }

    pub fn with_scheme(&self, scheme: &str) -> Self {
        let mut uri = self.clone();
        uri.scheme = scheme.to_ascii_lowercase();
        uri.port = normalize_port(&uri.scheme, uri.port);
        uri
    }

    pub fn with_host(&self, host: &str) -> Self {
        let mut uri = self.clone();
        uri.host = host.to_ascii_lowercase();
        uri
    }

    pub fn with_port(&self, port: u16) -> Self {
        let mut uri = self.clone();
        uri.port = normalize_port(&uri.scheme, Some(port));
        uri
    }

    /// Replace the path entirely.
    pub fn with_segments<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut uri = self.clone();
        uri.segments = segments.into_iter().map(Into::into).collect();
        uri
    }

    /// Strip the first `count` segments, e.g. when re-rooting under a service.
    pub fn skip_segments(&self, count: usize) -> Self {
        let mut uri = self.clone();
        uri.segments = uri.segments.split_off(count.min(uri.segments.len()));
        uri
    }

    /// Scheme, authority and segment-prefix containment test.
    ///
    /// `http://a/x/y` starts with `http://a/x`; query and fragment are
    /// ignored on both sides.
    pub fn starts_with(&self, prefix: &Uri) -> bool {
        self.scheme == prefix.scheme
            && self.host == prefix.host
            && self.port == prefix.port
            && self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Equal-or-descendant test used by recipient filtering.
    pub fn is_descendant_of(&self, ancestor: &Uri) -> bool {
        self.starts_with(ancestor)
    }

    /// The reference without query or fragment.
    pub fn base(&self) -> Self {
        let mut uri = self.clone();
        uri.query.clear();
        uri.fragment = None;
        uri
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for seg in &self.segments {
            write!(f, "/{}", encode(seg, ENCODE_SEGMENT))?;
        }
        if !self.query.is_empty() {
            f.write_str("?")?;
            for (i, (k, v)) in self.query.iter().enumerate() {
                if i > 0 {
                    f.write_str("&")?;
                }
                if v.is_empty() {
                    write!(f, "{}", encode(k, ENCODE_QUERY))?;
                } else {
                    write!(f, "{}={}", encode(k, ENCODE_QUERY), encode(v, ENCODE_QUERY))?;
                }
            }
        }
        if let Some(ref frag) = self.fragment {
            write!(f, "#{}", encode(frag, ENCODE_QUERY))?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uri::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn normalize_port(scheme: &str, port: Option<u16>) -> Option<u16> {
    match (scheme, port) {
        ("http", Some(80)) | ("https", Some(443)) => None,
        _ => port,
    }
}

// Characters that stay literal inside a path segment.
const ENCODE_SEGMENT: &[u8] = b"-._~!$&'()*+,;=:@";
// Characters that stay literal inside query values and fragments.
const ENCODE_QUERY: &[u8] = b"-._~!$'()*+,;:@/?";

fn encode(input: &str, keep: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || keep.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Percent-decode a single URI component (`+` decodes to space).
pub fn decode_component(input: &str) -> Result<String> {
    percent_decode(input)
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .ok_or_else(|| CoreError::input(format!("truncated escape in '{input}'")))?;
                let value = u8::from_str_radix(hex, 16)
                    .map_err(|_| CoreError::input(format!("invalid escape '%{hex}' in '{input}'")))?;
                out.push(value);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| CoreError::input(format!("non-utf8 escape in '{input}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_reference() {
        let uri = Uri::parse("HTTP://Example.COM:8081/a/b%20c?x=1&x=2&flag#frag").unwrap();
        assert_eq!(uri.scheme(), "http");
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), Some(8081));
        assert_eq!(uri.segments(), &["a".to_string(), "b c".to_string()]);
        assert_eq!(uri.query("x"), Some("1"));
        assert_eq!(uri.query_all("x"), vec!["1", "2"]);
        assert_eq!(uri.query("flag"), Some(""));
        assert_eq!(uri.fragment(), Some("frag"));
    }

    #[test]
    fn normalization_makes_equivalent_uris_equal() {
        let a = Uri::parse("http://HOST/p%61th").unwrap();
        let b = Uri::parse("http://host/path").unwrap();
        assert_eq!(a, b);

        let c = Uri::parse("http://host:80/path").unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn empty_path_canonicalizes_to_slash() {
        let uri = Uri::parse("http://host").unwrap();
        assert!(uri.segments().is_empty());
        assert_eq!(uri.path(), "/");
        assert_eq!(Uri::parse("http://host/").unwrap(), uri);
    }

    #[test]
    fn channel_uris_have_empty_host() {
        let uri = Uri::parse("channel:///deck/cards/*").unwrap();
        assert_eq!(uri.scheme(), SCHEME_CHANNEL);
        assert_eq!(uri.host(), "");
        assert_eq!(uri.segments(), &["deck", "cards", "*"]);
    }

    #[test]
    fn fluent_derivations_do_not_mutate() {
        let base = Uri::parse("local://guid/svc").unwrap();
        let derived = base.at(["items", "1"]).with("verbose", "true");
        assert_eq!(base.path(), "/svc");
        assert_eq!(derived.path(), "/svc/items/1");
        assert_eq!(derived.query("verbose"), Some("true"));
        assert!(derived.without_query().query_pairs().is_empty());
    }

    #[test]
    fn starts_with_ignores_query() {
        let prefix = Uri::parse("http://a/x").unwrap();
        assert!(Uri::parse("http://a/x/y?q=1").unwrap().starts_with(&prefix));
        assert!(Uri::parse("http://a/x").unwrap().starts_with(&prefix));
        assert!(!Uri::parse("http://a/z").unwrap().starts_with(&prefix));
        assert!(!Uri::parse("https://a/x/y").unwrap().starts_with(&prefix));
    }

    #[test]
    fn display_round_trips() {
        let uri = Uri::parse("http://host/a%20b?k=v%26w").unwrap();
        let reparsed = Uri::parse(&uri.to_string()).unwrap();
        assert_eq!(uri, reparsed);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Uri::parse("host/path").is_err());
        assert!(Uri::parse("://host").is_err());
    }

    #[test]
    fn skip_segments_reroots() {
        let uri = Uri::parse("local://g/host/test/extra").unwrap();
        assert_eq!(uri.skip_segments(2).segments(), &["extra".to_string()]);
        assert!(uri.skip_segments(9).segments().is_empty());
    }
}
