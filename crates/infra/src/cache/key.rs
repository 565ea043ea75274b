//! Hierarchical cache keys.
//!
//! A key is a non-empty list of segments. Its textual form percent-encodes
//! each segment and joins them with `/`, so prefix matching always falls on
//! segment boundaries: scope `page/en` covers `page/en` and `page/en/home`,
//! never `page/english`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::CacheError;

/// Longest encoded segment accepted (keeps filesystem path components legal).
pub const MAX_SEGMENT_LEN: usize = 200;

/// Top-level key namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Rendered page payloads: `page/<path>/<language>/<variant>`.
    Page,
    /// Collection query results: `query/<collection>/<fingerprint>`.
    Query,
    /// Token lookups: `session/<token id>`.
    Session,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Page => "page",
            CacheTier::Query => "query",
            CacheTier::Session => "session",
        }
    }
}

/// Fully qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    segments: Vec<String>,
}

/// Prefix of the key space. The empty scope covers every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CacheScope {
    segments: Vec<String>,
}

impl CacheKey {
    pub fn new<I, S>(segments: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = validated(segments)?;
        if segments.is_empty() {
            return Err(CacheError::InvalidKey("cache key needs at least one segment".into()));
        }
        Ok(Self { segments })
    }

    /// Parse the encoded form produced by `Display`.
    pub fn parse(encoded: &str) -> Result<Self, CacheError> {
        Self::new(decode_segments(encoded)?)
    }

    /// Cached render of `path` for one language and variant.
    pub fn page(path: &str, language: &str, variant: &str) -> Result<Self, CacheError> {
        Self::new([CacheTier::Page.as_str(), path, language, variant])
    }

    /// Cached result of a query against `collection`, identified by a
    /// fingerprint of the query parameters.
    pub fn query(collection: &str, fingerprint: &str) -> Result<Self, CacheError> {
        Self::new([CacheTier::Query.as_str(), collection, fingerprint])
    }

    pub fn session(token_id: impl fmt::Display) -> Result<Self, CacheError> {
        Self::new([CacheTier::Session.as_str().to_string(), token_id.to_string()])
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Encoded segments, ready for use as path components.
    pub fn encoded_segments(&self) -> impl Iterator<Item = String> + '_ {
        self.segments.iter().map(|s| encode_segment(s))
    }

    pub fn is_within(&self, scope: &CacheScope) -> bool {
        self.segments.starts_with(&scope.segments)
    }

    /// The scope consisting of exactly this key and everything under it.
    pub fn as_scope(&self) -> CacheScope {
        CacheScope {
            segments: self.segments.clone(),
        }
    }
}

impl CacheScope {
    /// The scope covering every key.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(segments: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            segments: validated(segments)?,
        })
    }

    /// Parse an encoded prefix; the empty string is the all-keys scope.
    pub fn parse(encoded: &str) -> Result<Self, CacheError> {
        if encoded.is_empty() {
            return Ok(Self::all());
        }
        Self::new(decode_segments(encoded)?)
    }

    pub fn tier(tier: CacheTier) -> Self {
        Self {
            segments: vec![tier.as_str().to_string()],
        }
    }

    /// Every language and variant of one page.
    pub fn page(path: &str) -> Result<Self, CacheError> {
        Self::new([CacheTier::Page.as_str(), path])
    }

    /// Every cached query against one collection.
    pub fn collection(collection: &str) -> Result<Self, CacheError> {
        Self::new([CacheTier::Query.as_str(), collection])
    }

    pub fn is_all(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn encoded_segments(&self) -> impl Iterator<Item = String> + '_ {
        self.segments.iter().map(|s| encode_segment(s))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        key.is_within(self)
    }
}

fn validated<I, S>(segments: I) -> Result<Vec<String>, CacheError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    segments
        .into_iter()
        .map(|s| {
            let s = s.into();
            if s.is_empty() {
                return Err(CacheError::InvalidKey("empty key segment".into()));
            }
            if s == "." || s == ".." {
                return Err(CacheError::InvalidKey(format!("reserved key segment '{s}'")));
            }
            if encode_segment(&s).len() > MAX_SEGMENT_LEN {
                return Err(CacheError::InvalidKey(format!(
                    "key segment longer than {MAX_SEGMENT_LEN} encoded bytes"
                )));
            }
            Ok(s)
        })
        .collect()
}

/// Percent-encode everything outside `[A-Za-z0-9-._~]`, including `/` and `@`.
pub(crate) fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

fn decode_segments(encoded: &str) -> Result<Vec<String>, CacheError> {
    encoded
        .split('/')
        .map(|part| {
            urlencoding::decode(part)
                .map(|s| s.into_owned())
                .map_err(|e| CacheError::InvalidKey(format!("bad key encoding '{part}': {e}")))
        })
        .collect()
}

fn join_encoded(segments: &[String], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            f.write_str("/")?;
        }
        f.write_str(&encode_segment(segment))?;
    }
    Ok(())
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        join_encoded(&self.segments, f)
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        join_encoded(&self.segments, f)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CacheKey::parse(&s).map_err(serde::de::Error::custom)
    }
}
