//! Filesystem cache backend.
//!
//! Layout: every key maps to a directory built from its encoded segments, and
//! the value lives in a file named `@entry` inside it. Because `@` is always
//! percent-encoded in segments, entry files and scratch names can never
//! collide with a key directory.
//!
//! ```text
//! <root>/page/%2Fabout/en/default/@entry
//! <root>/session/0193.../@entry
//! ```
//!
//! The entry file is a one-line JSON header followed by the raw value.
//! Its mtime is set to the write instant, and the TTL is evaluated against it
//! on read. Writes go to a scratch file that is renamed into place, so readers
//! see the old or the new value, never a partial one.
//!
//! Prefix deletion renames the scope directory to a scratch name and removes
//! it afterwards. Once the rename returns, no key under the scope resolves.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use folio_core::Clock;

use super::{CacheBackend, CacheEntry, CacheError, CacheKey, CacheScope, VersionSource};

const ENTRY_FILE: &str = "@entry";
const TMP_PREFIX: &str = "@tmp-";
const TRASH_PREFIX: &str = "@trash-";

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
}

#[derive(Debug)]
pub struct FilesystemCacheBackend {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    versions: VersionSource,
}

impl FilesystemCacheBackend {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io("create cache root", e))?;
        let backend = Self {
            root,
            clock,
            versions: VersionSource::new(),
        };
        backend.sweep_trash();
        Ok(backend)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &CacheKey) -> PathBuf {
        let mut dir = self.root.clone();
        dir.extend(key.encoded_segments());
        dir
    }

    fn scope_dir(&self, scope: &CacheScope) -> PathBuf {
        let mut dir = self.root.clone();
        dir.extend(scope.encoded_segments());
        dir
    }

    fn scratch_name(prefix: &str) -> String {
        format!("{prefix}{}", Uuid::new_v4().simple())
    }

    /// Remove leftovers of interrupted deletes and writes.
    fn sweep_trash(&self) {
        let Ok(children) = fs::read_dir(&self.root) else {
            return;
        };
        for child in children.flatten() {
            let name = child.file_name();
            if name.to_string_lossy().starts_with(TRASH_PREFIX) {
                if let Err(err) = fs::remove_dir_all(child.path()) {
                    warn!(path = %child.path().display(), error = %err, "could not remove cache trash");
                }
            }
        }
    }

    /// Move `dir` out of the key space, then delete it. Returns the number of
    /// entries it held.
    fn discard_dir(&self, dir: &Path) -> Result<u64, CacheError> {
        let trash = self.root.join(Self::scratch_name(TRASH_PREFIX));
        match fs::rename(dir, &trash) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io("detach cache scope", e)),
        }

        let removed = WalkDir::new(&trash)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == ENTRY_FILE)
            .count() as u64;

        if let Err(err) = fs::remove_dir_all(&trash) {
            // The scope is already unreachable; leftovers are swept on next open.
            warn!(path = %trash.display(), error = %err, "could not remove detached cache scope");
        }
        Ok(removed)
    }

    fn read_entry(&self, key: &CacheKey, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io("open cache entry", e)),
        };
        let modified = file
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| CacheError::io("stat cache entry", e))?;

        let corrupt = |reason: String| CacheError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let mut reader = BufReader::new(file);
        let mut header_line = String::new();
        reader
            .read_line(&mut header_line)
            .map_err(|e| CacheError::io("read cache entry", e))?;
        let header: EntryHeader =
            serde_json::from_str(header_line.trim_end()).map_err(|e| corrupt(e.to_string()))?;

        let written_at = DateTime::<Utc>::from(modified);
        // A TTL beyond chrono's range never expires, as in the memory backend.
        let expires_at = header
            .ttl_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|ttl| written_at.checked_add_signed(ttl));
        if expires_at.is_some_and(|at| self.clock.now() >= at) {
            debug!(key = %key, "cache entry expired");
            return Ok(None);
        }

        let mut value = Vec::new();
        reader
            .read_to_end(&mut value)
            .map_err(|e| CacheError::io("read cache entry", e))?;

        Ok(Some(CacheEntry {
            value,
            version: header.version,
            expires_at,
        }))
    }
}

impl CacheBackend for FilesystemCacheBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn is_shared(&self) -> bool {
        false
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.key_dir(key).join(ENTRY_FILE);
        self.read_entry(key, &path)
    }

    fn set(&self, key: &CacheKey, value: &[u8], ttl: Option<Duration>) -> Result<u64, CacheError> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io("create cache directory", e))?;

        let now = self.clock.now();
        let version = self.versions.next(now);
        let header = EntryHeader {
            version,
            ttl_ms: ttl.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };
        let header = serde_json::to_vec(&header).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let tmp = dir.join(Self::scratch_name(TMP_PREFIX));
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&header)?;
            file.write_all(b"\n")?;
            file.write_all(value)?;
            file.set_modified(SystemTime::from(now))?;
            Ok(())
        };
        if let Err(e) = write().and_then(|()| fs::rename(&tmp, dir.join(ENTRY_FILE))) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::io("write cache entry", e));
        }
        Ok(version)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        match fs::remove_file(self.key_dir(key).join(ENTRY_FILE)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io("delete cache entry", e)),
        }
    }

    fn delete_by_prefix(&self, scope: &CacheScope) -> Result<u64, CacheError> {
        if !scope.is_all() {
            return self.discard_dir(&self.scope_dir(scope));
        }

        let children = fs::read_dir(&self.root).map_err(|e| CacheError::io("list cache root", e))?;
        let mut removed = 0;
        for child in children {
            let child = child.map_err(|e| CacheError::io("list cache root", e))?;
            if child.file_name().to_string_lossy().starts_with('@') {
                continue;
            }
            removed += self.discard_dir(&child.path())?;
        }
        self.sweep_trash();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use folio_core::ManualClock;
    use tempfile::TempDir;

    use super::*;

    fn backend(clock: &ManualClock) -> (TempDir, FilesystemCacheBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemCacheBackend::open(dir.path().join("cache"), Arc::new(clock.clone())).unwrap();
        (dir, backend)
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    #[test]
    fn set_then_get_returns_value_and_version() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);

        let version = cache.set(&key("page/%2F/en/default"), b"<h1>home</h1>", None).unwrap();
        let entry = cache.get(&key("page/%2F/en/default")).unwrap().unwrap();

        assert_eq!(entry.value, b"<h1>home</h1>");
        assert_eq!(entry.version, version);
        assert_eq!(entry.expires_at, None);
    }

    #[test]
    fn prefix_delete_removes_scope_and_keeps_siblings() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);
        for k in ["page/en/home", "page/de/home", "page/en/about", "page/en"] {
            cache.set(&key(k), b"x", None).unwrap();
        }

        let removed = cache.delete_by_prefix(&CacheScope::parse("page/en").unwrap()).unwrap();

        assert_eq!(removed, 3);
        assert!(cache.get(&key("page/en/home")).unwrap().is_none());
        assert!(cache.get(&key("page/en/about")).unwrap().is_none());
        assert!(cache.get(&key("page/en")).unwrap().is_none());
        assert!(cache.get(&key("page/de/home")).unwrap().is_some());
    }

    #[test]
    fn ttl_is_measured_from_write_time() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);
        cache.set(&key("session/t1"), b"{}", Some(Duration::from_secs(30))).unwrap();

        clock.advance(Duration::from_secs(29));
        assert!(cache.get(&key("session/t1")).unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get(&key("session/t1")).unwrap().is_none());
    }

    #[test]
    fn oversized_ttl_means_no_expiry() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);
        cache.set(&key("page/en/home"), b"a", Some(Duration::MAX)).unwrap();
        cache.set(&key("page/en/about"), b"b", Some(Duration::from_millis(1 << 63))).unwrap();

        clock.advance(Duration::from_secs(365 * 24 * 3600));

        let home = cache.get(&key("page/en/home")).unwrap().unwrap();
        let about = cache.get(&key("page/en/about")).unwrap().unwrap();
        assert_eq!((home.value, home.expires_at), (b"a".to_vec(), None));
        assert_eq!((about.value, about.expires_at), (b"b".to_vec(), None));
    }

    #[test]
    fn clear_removes_everything_and_cache_stays_usable() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);
        cache.set(&key("page/en/home"), b"x", None).unwrap();
        cache.set(&key("query/articles/q1"), b"y", None).unwrap();

        assert_eq!(cache.delete_by_prefix(&CacheScope::all()).unwrap(), 2);
        assert!(cache.get(&key("query/articles/q1")).unwrap().is_none());

        cache.set(&key("query/articles/q1"), b"z", None).unwrap();
        assert_eq!(cache.get(&key("query/articles/q1")).unwrap().unwrap().value, b"z");
        let leftovers: Vec<_> = fs::read_dir(cache.root())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with('@'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn delete_of_missing_key_is_not_an_error() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);
        assert!(!cache.delete(&key("page/en/nothing")).unwrap());
        assert_eq!(cache.delete_by_prefix(&CacheScope::parse("page/fr").unwrap()).unwrap(), 0);
    }

    #[test]
    fn truncated_header_is_reported_as_corrupt() {
        let clock = ManualClock::starting_now();
        let (_dir, cache) = backend(&clock);
        let k = key("query/articles/q1");
        cache.set(&k, b"y", None).unwrap();
        fs::write(cache.root().join("query/articles/q1").join(ENTRY_FILE), b"{\"vers").unwrap();

        assert!(matches!(cache.get(&k), Err(CacheError::Corrupt { .. })));
    }
}
