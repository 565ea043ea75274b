//! Redis-backed shared cache.
//!
//! ## Layout
//!
//! - **Entry key**: `<namespace>:<encoded cache key>`
//! - **Entry value**: 8-byte big-endian write version followed by the payload
//! - **Version counter**: `<namespace>@version` (`INCR`), outside the entry pattern
//!
//! TTLs are native (`SET ... PX`). Prefix deletion walks `SCAN MATCH
//! <namespace>:<scope>/*` and deletes in batches, plus the exact scope key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use super::{CacheBackend, CacheEntry, CacheError, CacheKey, CacheScope};

const VERSION_BYTES: usize = 8;
const SCAN_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct RedisCacheBackend {
    client: Arc<redis::Client>,
    namespace: String,
}

impl RedisCacheBackend {
    /// Connect to `redis_url`; verifies the server answers `PING`.
    pub fn connect(redis_url: &str, namespace: impl Into<String>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let backend = Self {
            client: Arc::new(client),
            namespace: namespace.into(),
        };
        let mut conn = backend.connection()?;
        let _: String = redis::cmd("PING").query(&mut conn).map_err(unavailable)?;
        Ok(backend)
    }

    fn connection(&self) -> Result<redis::Connection, CacheError> {
        self.client.get_connection().map_err(unavailable)
    }

    fn entry_key(&self, key: &CacheKey) -> String {
        entry_key(&self.namespace, key)
    }

    fn version_key(&self) -> String {
        format!("{}@version", self.namespace)
    }

    fn scan_delete(&self, conn: &mut redis::Connection, pattern: &str) -> Result<u64, CacheError> {
        let mut cursor: u64 = 0;
        let mut removed = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query(conn)
                .map_err(unavailable)?;
            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query(conn).map_err(unavailable)?;
                removed += deleted;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_shared(&self) -> bool {
        true
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.connection()?;
        let storage_key = self.entry_key(key);
        let (raw, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&storage_key)
            .cmd("PTTL")
            .arg(&storage_key)
            .query(&mut conn)
            .map_err(unavailable)?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let (version, value) = decode_envelope(&raw).ok_or_else(|| CacheError::Corrupt {
            key: key.to_string(),
            reason: "value shorter than version header".into(),
        })?;
        let expires_at = (pttl >= 0).then(|| Utc::now() + chrono::Duration::milliseconds(pttl));

        Ok(Some(CacheEntry {
            value: value.to_vec(),
            version,
            expires_at,
        }))
    }

    fn set(&self, key: &CacheKey, value: &[u8], ttl: Option<Duration>) -> Result<u64, CacheError> {
        let mut conn = self.connection()?;
        let version: u64 = redis::cmd("INCR")
            .arg(self.version_key())
            .query(&mut conn)
            .map_err(unavailable)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(self.entry_key(key)).arg(encode_envelope(version, value));
        if let Some(ms) = ttl.and_then(expire_millis) {
            cmd.arg("PX").arg(ms);
        }
        let _: () = cmd.query(&mut conn).map_err(unavailable)?;
        Ok(version)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut conn = self.connection()?;
        let deleted: u64 = redis::cmd("DEL")
            .arg(self.entry_key(key))
            .query(&mut conn)
            .map_err(unavailable)?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), fields(scope = %scope), err)]
    fn delete_by_prefix(&self, scope: &CacheScope) -> Result<u64, CacheError> {
        let mut conn = self.connection()?;
        let (exact, pattern) = scope_patterns(&self.namespace, scope);

        let mut removed = 0;
        if let Some(exact) = exact {
            let deleted: u64 = redis::cmd("DEL").arg(exact).query(&mut conn).map_err(unavailable)?;
            removed += deleted;
        }
        removed += self.scan_delete(&mut conn, &pattern)?;
        debug!(removed, "redis prefix delete complete");
        Ok(removed)
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(format!("redis: {err}"))
}

fn entry_key(namespace: &str, key: &CacheKey) -> String {
    format!("{namespace}:{key}")
}

/// Exact key for the scope itself (if any) and the glob for keys beneath it.
fn scope_patterns(namespace: &str, scope: &CacheScope) -> (Option<String>, String) {
    let ns = escape_glob(namespace);
    if scope.is_all() {
        return (None, format!("{ns}:*"));
    }
    let exact = format!("{namespace}:{scope}");
    let pattern = format!("{ns}:{}/*", escape_glob(&scope.to_string()));
    (Some(exact), pattern)
}

fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn encode_envelope(version: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERSION_BYTES + value.len());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_envelope(raw: &[u8]) -> Option<(u64, &[u8])> {
    if raw.len() < VERSION_BYTES {
        return None;
    }
    let (head, value) = raw.split_at(VERSION_BYTES);
    let version = u64::from_be_bytes(head.try_into().ok()?);
    Some((version, value))
}

/// `PX` argument for `ttl`, or `None` when the expiry lies past the range the
/// other backends represent; such entries are stored without expiry.
fn expire_millis(ttl: Duration) -> Option<u64> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))?;
    u64::try_from(ttl.as_millis()).ok().map(|ms| ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_version_ahead_of_payload() {
        let raw = encode_envelope(42, b"payload");
        assert_eq!(raw.len(), VERSION_BYTES + 7);
        assert_eq!(decode_envelope(&raw), Some((42, &b"payload"[..])));
        assert_eq!(decode_envelope(b"short"), None);
    }

    #[test]
    fn scope_patterns_stay_on_segment_boundaries() {
        let scope = CacheScope::parse("page/en").unwrap();
        let (exact, pattern) = scope_patterns("folio", &scope);

        assert_eq!(exact.as_deref(), Some("folio:page/en"));
        assert_eq!(pattern, "folio:page/en/*");
    }

    #[test]
    fn all_scope_matches_whole_namespace_but_not_version_counter() {
        let (exact, pattern) = scope_patterns("folio", &CacheScope::all());
        assert_eq!(exact, None);
        assert_eq!(pattern, "folio:*");
        assert!(!"folio@version".starts_with("folio:"));
    }

    #[test]
    fn glob_metacharacters_in_namespace_are_escaped() {
        assert_eq!(escape_glob("site[1]*"), "site\\[1\\]\\*");
    }

    #[test]
    fn entry_keys_use_encoded_form() {
        let key = CacheKey::page("/about us", "en", "default").unwrap();
        assert_eq!(entry_key("folio", &key), "folio:page/%2Fabout%20us/en/default");
    }

    #[test]
    fn expire_argument_stays_in_range() {
        assert_eq!(expire_millis(Duration::from_secs(30)), Some(30_000));
        assert_eq!(expire_millis(Duration::from_micros(10)), Some(1));
        assert_eq!(expire_millis(Duration::MAX), None);
        assert_eq!(expire_millis(Duration::from_millis(1 << 63)), None);
    }
}
