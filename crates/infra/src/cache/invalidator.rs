//! Cache invalidation: maps content changes and admin requests to scopes and
//! removes them.
//!
//! Invalidation is synchronous. When `invalidate` returns `Ok`, no covered key
//! is served from the cache any more; when it returns `Err`, some scopes may
//! not have been removed and the caller must report the failure.

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{Cache, CacheError, CacheScope, CacheTier};

/// Collection whose changes affect route resolution for every page.
pub const REDIRECTS_COLLECTION: &str = "redirects";

/// What to invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every cached entry.
    All,
    /// Every page render.
    Pages,
    /// Every language and variant of one page path.
    Page { path: String },
    /// Every cached query against one collection.
    Collection { collection: String },
    /// An explicit key prefix.
    Scope(CacheScope),
}

impl Invalidation {
    /// Parse an admin request: `scope` is one of `all`, `pages`, `page`,
    /// `collection` or `prefix`; the latter three require an identifier.
    pub fn parse(scope: &str, identifier: Option<&str>) -> Result<Self, CacheError> {
        let required = || {
            identifier
                .filter(|id| !id.is_empty())
                .ok_or_else(|| CacheError::InvalidKey(format!("scope '{scope}' requires an identifier")))
        };
        match scope {
            "all" => Ok(Invalidation::All),
            "pages" => Ok(Invalidation::Pages),
            "page" => Ok(Invalidation::Page {
                path: required()?.to_string(),
            }),
            "collection" => Ok(Invalidation::Collection {
                collection: required()?.to_string(),
            }),
            "prefix" => Ok(Invalidation::Scope(CacheScope::parse(required()?)?)),
            other => Err(CacheError::InvalidKey(format!("unknown invalidation scope '{other}'"))),
        }
    }

    pub fn scope(&self) -> Result<CacheScope, CacheError> {
        match self {
            Invalidation::All => Ok(CacheScope::all()),
            Invalidation::Pages => Ok(CacheScope::tier(CacheTier::Page)),
            Invalidation::Page { path } => CacheScope::page(path),
            Invalidation::Collection { collection } => CacheScope::collection(collection),
            Invalidation::Scope(scope) => Ok(scope.clone()),
        }
    }
}

/// Content change notifications from the CMS write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    RecordSaved {
        collection: String,
        record_id: String,
        /// Public path of the record if it is routable.
        page_path: Option<String>,
    },
    RecordDeleted {
        collection: String,
        record_id: String,
        page_path: Option<String>,
    },
    /// Published pages were added, removed or re-routed in bulk.
    PagesPublished { paths: Vec<String> },
    /// A manual purge request.
    PurgeRequested(Invalidation),
}

impl ContentEvent {
    /// Invalidations required for this event, most specific first.
    pub fn invalidations(&self) -> Vec<Invalidation> {
        match self {
            ContentEvent::RecordSaved {
                collection,
                page_path,
                ..
            }
            | ContentEvent::RecordDeleted {
                collection,
                page_path,
                ..
            } => {
                if collection == REDIRECTS_COLLECTION {
                    return vec![
                        Invalidation::Pages,
                        Invalidation::Collection {
                            collection: collection.clone(),
                        },
                    ];
                }
                let mut out: Vec<_> = page_path
                    .iter()
                    .map(|path| Invalidation::Page { path: path.clone() })
                    .collect();
                out.push(Invalidation::Collection {
                    collection: collection.clone(),
                });
                out
            }
            ContentEvent::PagesPublished { paths } => paths
                .iter()
                .map(|path| Invalidation::Page { path: path.clone() })
                .collect(),
            ContentEvent::PurgeRequested(invalidation) => vec![invalidation.clone()],
        }
    }
}

/// What an invalidation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub scopes: Vec<String>,
    pub removed: u64,
}

#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    cache: Cache,
}

impl CacheInvalidator {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[instrument(skip(self), fields(backend = self.cache.backend().name()))]
    pub fn invalidate(&self, target: &Invalidation) -> Result<InvalidationReport, CacheError> {
        self.invalidate_all(std::slice::from_ref(target))
    }

    /// Apply several invalidations in order, stopping at the first failure.
    pub fn invalidate_all(&self, targets: &[Invalidation]) -> Result<InvalidationReport, CacheError> {
        let mut report = InvalidationReport::default();
        for target in targets {
            let scope = target.scope()?;
            let removed = self.cache.delete_by_prefix(&scope).map_err(|err| {
                warn!(scope = %scope, error = %err, "cache invalidation failed");
                err
            })?;
            report.removed += removed;
            report.scopes.push(if scope.is_all() { "*".to_string() } else { scope.to_string() });
        }
        info!(scopes = ?report.scopes, removed = report.removed, "cache invalidated");
        Ok(report)
    }

    pub fn on_event(&self, event: &ContentEvent) -> Result<InvalidationReport, CacheError> {
        self.invalidate_all(&event.invalidations())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use folio_core::SystemClock;

    use super::*;
    use crate::cache::{CacheKey, FilesystemCacheBackend, InMemoryCacheBackend};

    fn invalidator() -> CacheInvalidator {
        CacheInvalidator::new(Cache::new(Arc::new(InMemoryCacheBackend::with_system_clock())))
    }

    fn seed(cache: &Cache, keys: &[CacheKey]) {
        for key in keys {
            cache.set(key, b"x", None).unwrap();
        }
    }

    #[test]
    fn page_invalidation_covers_every_language_and_variant() {
        let inv = invalidator();
        let keys = [
            CacheKey::page("/about", "en", "default").unwrap(),
            CacheKey::page("/about", "de", "amp").unwrap(),
            CacheKey::page("/contact", "en", "default").unwrap(),
        ];
        seed(inv.cache(), &keys);

        let report = inv
            .invalidate(&Invalidation::Page {
                path: "/about".into(),
            })
            .unwrap();

        assert_eq!(report.removed, 2);
        assert!(inv.cache().get(&keys[0]).unwrap().is_none());
        assert!(inv.cache().get(&keys[1]).unwrap().is_none());
        assert!(inv.cache().get(&keys[2]).unwrap().is_some());
    }

    #[test]
    fn record_save_invalidates_page_and_collection_queries() {
        let inv = invalidator();
        let page = CacheKey::page("/blog/post", "en", "default").unwrap();
        let query = CacheKey::query("posts", "latest").unwrap();
        let other = CacheKey::query("authors", "all").unwrap();
        seed(inv.cache(), &[page.clone(), query.clone(), other.clone()]);

        inv.on_event(&ContentEvent::RecordSaved {
            collection: "posts".into(),
            record_id: "42".into(),
            page_path: Some("/blog/post".into()),
        })
        .unwrap();

        assert!(inv.cache().get(&page).unwrap().is_none());
        assert!(inv.cache().get(&query).unwrap().is_none());
        assert!(inv.cache().get(&other).unwrap().is_some());
    }

    #[test]
    fn invalidation_reaches_filesystem_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemCacheBackend::open(dir.path().join("cache"), Arc::new(SystemClock)).unwrap();
        let inv = CacheInvalidator::new(Cache::new(Arc::new(backend)));
        let about = CacheKey::page("/about", "en", "default").unwrap();
        let about_de = CacheKey::page("/about", "de", "default").unwrap();
        let home = CacheKey::page("/", "en", "default").unwrap();
        seed(inv.cache(), &[about.clone(), about_de.clone(), home.clone()]);

        let report = inv
            .invalidate(&Invalidation::Page {
                path: "/about".into(),
            })
            .unwrap();

        assert_eq!(report.removed, 2);
        assert!(inv.cache().get(&about).unwrap().is_none());
        assert!(inv.cache().get(&about_de).unwrap().is_none());
        assert!(inv.cache().get(&home).unwrap().is_some());

        inv.invalidate(&Invalidation::All).unwrap();
        assert!(inv.cache().get(&home).unwrap().is_none());
    }

    #[test]
    fn redirect_changes_invalidate_all_pages() {
        let event = ContentEvent::RecordDeleted {
            collection: REDIRECTS_COLLECTION.into(),
            record_id: "7".into(),
            page_path: None,
        };
        assert_eq!(event.invalidations()[0], Invalidation::Pages);
    }

    #[test]
    fn all_clears_every_tier() {
        let inv = invalidator();
        seed(
            inv.cache(),
            &[
                CacheKey::page("/", "en", "default").unwrap(),
                CacheKey::session("t").unwrap(),
            ],
        );

        let report = inv.invalidate(&Invalidation::All).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.scopes, vec!["*".to_string()]);
    }

    #[test]
    fn parse_admin_scopes() {
        assert_eq!(Invalidation::parse("all", None).unwrap(), Invalidation::All);
        assert_eq!(
            Invalidation::parse("page", Some("/about")).unwrap(),
            Invalidation::Page {
                path: "/about".into()
            }
        );
        assert_eq!(
            Invalidation::parse("prefix", Some("page/en")).unwrap(),
            Invalidation::Scope(CacheScope::parse("page/en").unwrap())
        );
        assert!(Invalidation::parse("collection", None).is_err());
        assert!(Invalidation::parse("everything", None).is_err());
    }
}
