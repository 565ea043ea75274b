//! Content collaborators driven by the standard jobs.
//!
//! The CMS owns the `previews` and `pages` tables; these adapters only run the
//! narrow maintenance statements the jobs need.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::db::{DbFailure, PgDatabase, map_sqlx_error};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentStoreError {
    #[error("content store unavailable: {0}")]
    Unavailable(String),
    #[error("content store error: {0}")]
    Query(String),
}

impl From<DbFailure> for ContentStoreError {
    fn from(failure: DbFailure) -> Self {
        match failure {
            DbFailure::Unavailable(msg) => ContentStoreError::Unavailable(msg),
            DbFailure::Duplicate(msg) | DbFailure::Data(msg) => ContentStoreError::Query(msg),
        }
    }
}

/// Draft previews with an expiry.
pub trait PreviewStore: Send + Sync {
    /// Delete previews that expired before `now`. Returns how many were removed.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, ContentStoreError>;
}

/// A page that became public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedPage {
    pub record_id: String,
    pub path: String,
}

/// Pages scheduled for publication at a future date.
pub trait PagePublisher: Send + Sync {
    /// Make every page whose publish date is at or before `now` public.
    fn publish_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishedPage>, ContentStoreError>;
}

#[derive(Debug, Clone)]
struct Preview {
    id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryPreviewStore {
    previews: Mutex<Vec<Preview>>,
}

impl InMemoryPreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, expires_at: DateTime<Utc>) {
        let mut previews = self.previews.lock().unwrap_or_else(|e| e.into_inner());
        previews.push(Preview {
            id: id.into(),
            expires_at,
        });
    }

    pub fn ids(&self) -> Vec<String> {
        let previews = self.previews.lock().unwrap_or_else(|e| e.into_inner());
        previews.iter().map(|p| p.id.clone()).collect()
    }
}

impl PreviewStore for InMemoryPreviewStore {
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, ContentStoreError> {
        let mut previews = self.previews.lock().unwrap_or_else(|e| e.into_inner());
        let before = previews.len();
        previews.retain(|p| p.expires_at >= now);
        Ok((before - previews.len()) as u64)
    }
}

#[derive(Debug, Clone)]
struct ScheduledPage {
    record_id: String,
    path: String,
    publish_at: DateTime<Utc>,
    public: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryPagePublisher {
    pages: Mutex<Vec<ScheduledPage>>,
}

impl InMemoryPagePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, record_id: impl Into<String>, path: impl Into<String>, publish_at: DateTime<Utc>) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        pages.push(ScheduledPage {
            record_id: record_id.into(),
            path: path.into(),
            publish_at,
            public: false,
        });
    }

    pub fn is_public(&self, path: &str) -> bool {
        let pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        pages.iter().any(|p| p.path == path && p.public)
    }
}

impl PagePublisher for InMemoryPagePublisher {
    fn publish_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishedPage>, ContentStoreError> {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        Ok(pages
            .iter_mut()
            .filter(|p| !p.public && p.publish_at <= now)
            .map(|p| {
                p.public = true;
                PublishedPage {
                    record_id: p.record_id.clone(),
                    path: p.path.clone(),
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPreviewStore {
    db: PgDatabase,
}

impl PostgresPreviewStore {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

impl PreviewStore for PostgresPreviewStore {
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, ContentStoreError> {
        self.db.block_on(async {
            let result = sqlx::query("DELETE FROM previews WHERE expires_at < $1")
                .bind(now)
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("delete expired previews", e))?;
            Ok(result.rows_affected())
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPagePublisher {
    db: PgDatabase,
}

impl PostgresPagePublisher {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

impl PagePublisher for PostgresPagePublisher {
    fn publish_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishedPage>, ContentStoreError> {
        self.db.block_on(async {
            let rows = sqlx::query(
                r#"
                UPDATE pages SET public = TRUE, publish_date = NULL
                 WHERE public = FALSE AND publish_date IS NOT NULL AND publish_date <= $1
                RETURNING id::text AS id, path
                "#,
            )
            .bind(now)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("publish scheduled pages", e))?;

            rows.iter()
                .map(|row| -> Result<PublishedPage, ContentStoreError> {
                    Ok(PublishedPage {
                        record_id: row
                            .try_get("id")
                            .map_err(|e| map_sqlx_error("decode pages row", e))?,
                        path: row
                            .try_get("path")
                            .map_err(|e| map_sqlx_error("decode pages row", e))?,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn only_expired_previews_are_deleted() {
        let now = Utc::now();
        let store = InMemoryPreviewStore::new();
        store.insert("old", now - Duration::minutes(1));
        store.insert("live", now + Duration::minutes(1));

        assert_eq!(store.delete_expired(now).unwrap(), 1);
        assert_eq!(store.ids(), vec!["live".to_string()]);
    }

    #[test]
    fn pages_publish_once_when_due() {
        let now = Utc::now();
        let publisher = InMemoryPagePublisher::new();
        publisher.schedule("1", "/launch", now);
        publisher.schedule("2", "/later", now + Duration::hours(1));

        let published = publisher.publish_due(now).unwrap();
        assert_eq!(
            published,
            vec![PublishedPage {
                record_id: "1".into(),
                path: "/launch".into()
            }]
        );
        assert!(publisher.is_public("/launch"));
        assert!(publisher.publish_due(now).unwrap().is_empty());
    }
}
