//! Administrative operations behind the HTTP boundary.
//!
//! Route registration and request parsing live outside this crate; handlers
//! call [`AdminService`] and turn an [`AdminError`] into a response with
//! [`AdminError::status_code`] and [`AdminError::to_body`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use folio_auth::{SessionToken, TokenError};
use folio_core::{TokenId, UserId};
use folio_infra::cache::{CacheError, CacheInvalidator, Invalidation, InvalidationReport};
use folio_infra::jobs::{DispatchError, Dispatcher, JobRunRecord, JobStore, JobStoreError, RunReport};
use folio_infra::tokens::{SessionError, TokenLifecycleManager, TokenStoreError};

use crate::app::Services;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl AdminError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AdminError::Dispatch(err) => match err {
                DispatchError::UnknownJob(_) => 404,
                DispatchError::Disabled(_) | DispatchError::ClaimConflict { .. } => 409,
                DispatchError::Exhausted(_) => 422,
                DispatchError::Store(err) => job_store_status(err),
            },
            AdminError::Store(err) => job_store_status(err),
            AdminError::Cache(err) => cache_status(err),
            AdminError::Session(err) => match err {
                SessionError::Token(TokenError::NotRenewable) => 403,
                SessionError::Token(_) => 401,
                SessionError::Store(TokenStoreError::Unavailable(_)) => 503,
                SessionError::Store(_) => 500,
                SessionError::Cache(err) => cache_status(err),
            },
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AdminError::Dispatch(DispatchError::UnknownJob(_)) => "unknown_job",
            AdminError::Dispatch(DispatchError::Disabled(_)) => "job_disabled",
            AdminError::Dispatch(DispatchError::ClaimConflict { .. }) => "claim_conflict",
            AdminError::Dispatch(DispatchError::Exhausted(_)) => "schedule_exhausted",
            AdminError::Dispatch(DispatchError::Store(_)) | AdminError::Store(_) => "job_store_error",
            AdminError::Cache(CacheError::InvalidKey(_)) => "invalid_scope",
            AdminError::Cache(_) | AdminError::Session(SessionError::Cache(_)) => "cache_error",
            AdminError::Session(SessionError::Token(TokenError::Expired)) => "token_expired",
            AdminError::Session(SessionError::Token(TokenError::NotRenewable)) => "token_not_renewable",
            AdminError::Session(SessionError::Token(TokenError::Revoked)) => "token_revoked",
            AdminError::Session(SessionError::Token(TokenError::NotFound)) => "unknown_token",
            AdminError::Session(SessionError::Store(_)) => "token_store_error",
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        json!({
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}

fn job_store_status(err: &JobStoreError) -> u16 {
    match err {
        JobStoreError::Unavailable(_) => 503,
        JobStoreError::NotFound(_) => 404,
        JobStoreError::ClaimLost(_) => 409,
        JobStoreError::Corrupt(_) => 500,
    }
}

fn cache_status(err: &CacheError) -> u16 {
    match err {
        CacheError::InvalidKey(_) => 400,
        CacheError::Unavailable(_) => 503,
        CacheError::Corrupt { .. } | CacheError::Serialization(_) => 500,
    }
}

/// A registered job with its durable record, if one exists yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub idempotent: bool,
    pub record: Option<JobRunRecord>,
}

#[derive(Clone)]
pub struct AdminService {
    invalidator: Arc<CacheInvalidator>,
    tokens: Arc<TokenLifecycleManager>,
    dispatcher: Arc<Dispatcher<Arc<dyn JobStore>>>,
}

impl AdminService {
    pub fn new(services: &Services) -> Self {
        Self {
            invalidator: Arc::clone(&services.invalidator),
            tokens: Arc::clone(&services.tokens),
            dispatcher: Arc::clone(&services.dispatcher),
        }
    }

    /// `clear-cache`: drop every cached entry before returning.
    pub fn clear_cache(&self) -> Result<InvalidationReport, AdminError> {
        let report = self.invalidator.invalidate(&Invalidation::All)?;
        info!(removed = report.removed, "cache cleared by administrator");
        Ok(report)
    }

    pub fn invalidate(&self, scope: &str, identifier: Option<&str>) -> Result<InvalidationReport, AdminError> {
        let target = Invalidation::parse(scope, identifier)?;
        Ok(self.invalidator.invalidate(&target)?)
    }

    /// Run one job now, outside the tick loop.
    pub fn process_job(&self, name: &str) -> Result<RunReport, AdminError> {
        Ok(self.dispatcher.run_once(name)?)
    }

    pub fn job_status(&self) -> Result<Vec<JobStatusView>, AdminError> {
        let store = self.dispatcher.store();
        self.dispatcher
            .registry()
            .iter()
            .map(|job| -> Result<JobStatusView, AdminError> {
                Ok(JobStatusView {
                    name: job.name().to_string(),
                    schedule: job.schedule().to_string(),
                    enabled: job.is_enabled(),
                    idempotent: job.is_idempotent(),
                    record: store.get(job.name())?,
                })
            })
            .collect()
    }

    pub fn login(&self, user_id: UserId, remember: bool) -> Result<SessionToken, AdminError> {
        Ok(self.tokens.issue(user_id, remember)?)
    }

    pub fn renew(&self, token_id: TokenId) -> Result<SessionToken, AdminError> {
        Ok(self.tokens.renew(token_id)?)
    }

    /// Returns `false` if the token was unknown.
    pub fn logout(&self, token_id: TokenId) -> Result<bool, AdminError> {
        Ok(self.tokens.revoke(token_id)?)
    }

    pub fn authenticate(&self, token_id: TokenId) -> Result<SessionToken, AdminError> {
        Ok(self.tokens.validate(token_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_map_to_auth_statuses() {
        let expired = AdminError::from(SessionError::Token(TokenError::Expired));
        let not_renewable = AdminError::from(SessionError::Token(TokenError::NotRenewable));

        assert_eq!(expired.status_code(), 401);
        assert_eq!(expired.code(), "token_expired");
        assert_eq!(not_renewable.status_code(), 403);
    }

    #[test]
    fn backend_outages_are_service_unavailable() {
        let cache = AdminError::from(CacheError::Unavailable("redis down".into()));
        let store = AdminError::from(DispatchError::Store(JobStoreError::Unavailable("pg down".into())));

        assert_eq!(cache.status_code(), 503);
        assert_eq!(store.status_code(), 503);
        assert_eq!(store.to_body()["error"], "job_store_error");
    }

    #[test]
    fn claim_conflict_is_409_with_holder_in_message() {
        let err = AdminError::from(DispatchError::ClaimConflict {
            job: "publish-pages".into(),
            held_by: "web-2".into(),
        });

        assert_eq!(err.status_code(), 409);
        assert!(err.to_body()["message"].as_str().unwrap().contains("web-2"));
    }
}
