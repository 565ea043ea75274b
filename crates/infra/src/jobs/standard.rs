//! Built-in maintenance jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

use crate::cache::{CacheInvalidator, ContentEvent, Invalidation};
use crate::tokens::TokenLifecycleManager;

use super::content::{PagePublisher, PreviewStore};
use super::registry::{JobContext, JobDescriptor};
use super::types::{JobOutput, Schedule, ScheduleError};

pub const CLEAN_EXPIRED_PREVIEWS: &str = "clean-expired-previews";
pub const CLEAN_EXPIRED_TOKENS: &str = "clean-expired-tokens";
pub const PUBLISH_PAGES: &str = "publish-pages";

/// Collection holding page records; its cached queries are dropped after a publish.
pub const PAGES_COLLECTION: &str = "pages";

/// Enable flag and schedule of one standard job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub enabled: bool,
    pub schedule: Schedule,
}

impl JobSettings {
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        Ok(Self {
            enabled: true,
            schedule: Schedule::every(interval)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StandardJobSettings {
    pub clean_expired_previews: JobSettings,
    pub clean_expired_tokens: JobSettings,
    pub publish_pages: JobSettings,
}

impl StandardJobSettings {
    /// Every job enabled and running once per `interval`.
    pub fn uniform(interval: Duration) -> Result<Self, ScheduleError> {
        Ok(Self {
            clean_expired_previews: JobSettings::every(interval)?,
            clean_expired_tokens: JobSettings::every(interval)?,
            publish_pages: JobSettings::every(interval)?,
        })
    }
}

/// Collaborators the standard jobs act on.
#[derive(Clone)]
pub struct StandardJobDeps {
    pub previews: Arc<dyn PreviewStore>,
    pub pages: Arc<dyn PagePublisher>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub invalidator: Arc<CacheInvalidator>,
}

pub fn standard_jobs(deps: &StandardJobDeps, settings: &StandardJobSettings) -> Vec<JobDescriptor> {
    let previews = Arc::clone(&deps.previews);
    let clean_previews = JobDescriptor::new(
        CLEAN_EXPIRED_PREVIEWS,
        settings.clean_expired_previews.schedule.clone(),
        move |ctx: &JobContext| {
            let removed = previews
                .delete_expired(ctx.now)
                .context("deleting expired previews")?;
            Ok(JobOutput::affected(removed))
        },
    )
    .enabled(settings.clean_expired_previews.enabled);

    let tokens = Arc::clone(&deps.tokens);
    let clean_tokens = JobDescriptor::new(
        CLEAN_EXPIRED_TOKENS,
        settings.clean_expired_tokens.schedule.clone(),
        move |_ctx: &JobContext| {
            let removed = tokens.cleanup_expired().context("deleting expired tokens")?;
            Ok(JobOutput::affected(removed))
        },
    )
    .enabled(settings.clean_expired_tokens.enabled);

    let pages = Arc::clone(&deps.pages);
    let invalidator = Arc::clone(&deps.invalidator);
    let publish = JobDescriptor::new(
        PUBLISH_PAGES,
        settings.publish_pages.schedule.clone(),
        move |ctx: &JobContext| publish_pages(pages.as_ref(), &invalidator, ctx),
    )
    .enabled(settings.publish_pages.enabled)
    .idempotent(false);

    vec![clean_previews, clean_tokens, publish]
}

/// Publish due pages, then drop their cached renders and the pages queries.
///
/// A publish that succeeded in the store but could not be invalidated is a
/// failed run: stale renders would otherwise hide the new pages.
fn publish_pages(
    pages: &dyn PagePublisher,
    invalidator: &CacheInvalidator,
    ctx: &JobContext,
) -> anyhow::Result<JobOutput> {
    let published = pages.publish_due(ctx.now).context("publishing scheduled pages")?;
    if published.is_empty() {
        return Ok(JobOutput::default());
    }

    let event = ContentEvent::PagesPublished {
        paths: published.iter().map(|p| p.path.clone()).collect(),
    };
    let mut targets = event.invalidations();
    targets.push(Invalidation::Collection {
        collection: PAGES_COLLECTION.to_string(),
    });
    invalidator.invalidate_all(&targets).map_err(|err| {
        warn!(pages = published.len(), error = %err, "published pages but cache invalidation failed");
        anyhow::Error::new(err).context("invalidating published pages")
    })?;

    let paths: Vec<_> = published.iter().map(|p| p.path.as_str()).collect();
    Ok(JobOutput::affected(published.len() as u64).with_detail(paths.join(", ")))
}
