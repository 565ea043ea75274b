//! Cache layer: hierarchical keys over a pluggable storage backend.
//!
//! ## Backends
//!
//! - `FilesystemCacheBackend`: one directory tree per process host. Only valid
//!   for single-instance deployments.
//! - `RedisCacheBackend` (feature `redis`): shared by every instance.
//! - `InMemoryCacheBackend`: tests/dev.
//!
//! The backend is chosen once at startup; everything else talks to [`Cache`].
//! `delete_by_prefix` removes all keys within a scope at segment boundaries.
//! Once it returns, a later `get` of any covered key misses.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod filesystem;
pub mod invalidator;
pub mod key;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use filesystem::FilesystemCacheBackend;
pub use invalidator::{CacheInvalidator, ContentEvent, Invalidation, InvalidationReport};
pub use key::{CacheKey, CacheScope, CacheTier};
pub use memory::InMemoryCacheBackend;
#[cfg(feature = "redis")]
pub use redis_store::RedisCacheBackend;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(String),
}

impl CacheError {
    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        CacheError::Unavailable(format!("{context}: {err}"))
    }
}

/// A stored value with its write version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    /// Strictly increasing per backend; a later write has a larger version.
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Storage contract shared by all cache backends.
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether every application instance sees the same entries.
    fn is_shared(&self) -> bool;

    /// Fetch a live entry. Expired entries are reported as misses.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `value` under `key`, replacing any previous entry. Returns the
    /// version assigned to the write.
    fn set(&self, key: &CacheKey, value: &[u8], ttl: Option<Duration>) -> Result<u64, CacheError>;

    /// Returns `true` if an entry was removed.
    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Remove every entry within `scope`. Returns the number removed where the
    /// backend can count them.
    fn delete_by_prefix(&self, scope: &CacheScope) -> Result<u64, CacheError>;
}

impl<B> CacheBackend for Arc<B>
where
    B: CacheBackend + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn is_shared(&self) -> bool {
        (**self).is_shared()
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        (**self).get(key)
    }

    fn set(&self, key: &CacheKey, value: &[u8], ttl: Option<Duration>) -> Result<u64, CacheError> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        (**self).delete(key)
    }

    fn delete_by_prefix(&self, scope: &CacheScope) -> Result<u64, CacheError> {
        (**self).delete_by_prefix(scope)
    }
}

/// Issues write versions that increase even if the clock stalls.
#[derive(Debug, Default)]
pub struct VersionSource {
    last: AtomicU64,
}

impl VersionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version: the clock in microseconds, bumped past the last issued value.
    pub fn next(&self, now: DateTime<Utc>) -> u64 {
        let candidate = u64::try_from(now.timestamp_micros()).unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Cache facade used by the rest of the system.
#[derive(Debug, Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn CacheBackend {
        self.backend.as_ref()
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.backend.get(key)
    }

    pub fn set(&self, key: &CacheKey, value: &[u8], ttl: Option<Duration>) -> Result<u64, CacheError> {
        self.backend.set(key, value, ttl)
    }

    pub fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.backend.delete(key)
    }

    pub fn delete_by_prefix(&self, scope: &CacheScope) -> Result<u64, CacheError> {
        self.backend.delete_by_prefix(scope)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<u64, CacheError> {
        self.backend.delete_by_prefix(&CacheScope::all())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        match self.backend.get(key)? {
            Some(entry) => serde_json::from_slice(&entry.value)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<u64, CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.backend.set(key, &bytes, ttl)
    }
}
