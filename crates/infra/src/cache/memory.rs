//! In-memory cache backend for tests/dev.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use folio_core::{Clock, SystemClock};

use super::{CacheBackend, CacheEntry, CacheError, CacheKey, CacheScope, VersionSource};

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local cache. Share one instance through `Arc` to model a cache
/// that several simulated instances see.
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    entries: RwLock<BTreeMap<CacheKey, Stored>>,
    clock: Arc<dyn Clock>,
    versions: VersionSource,
}

impl InMemoryCacheBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
            versions: VersionSource::new(),
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("in-memory cache lock poisoned".into())
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_shared(&self) -> bool {
        false
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .get(key)
            .filter(|stored| stored.expires_at.is_none_or(|at| now < at))
            .map(|stored| CacheEntry {
                value: stored.value.clone(),
                version: stored.version,
                expires_at: stored.expires_at,
            }))
    }

    fn set(&self, key: &CacheKey, value: &[u8], ttl: Option<Duration>) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
        });
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let version = self.versions.next(now);
        entries.insert(
            key.clone(),
            Stored {
                value: value.to_vec(),
                version,
                expires_at,
            },
        );
        Ok(version)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        Ok(entries.remove(key).is_some())
    }

    fn delete_by_prefix(&self, scope: &CacheScope) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let before = entries.len();
        entries.retain(|key, _| !scope.contains(key));
        Ok((before - entries.len()) as u64)
    }
}
