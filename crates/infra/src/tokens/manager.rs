//! Token lifecycle: issue, renew, revoke, validate and cleanup.
//!
//! The store is the source of truth. Validation reads through a short-lived
//! cache entry at `session/<token id>`; renew and revoke remove that entry so
//! no instance keeps serving the old state past the write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use folio_auth::{SessionToken, TokenError, TokenPolicy};
use folio_core::{Clock, TokenId, UserId};

use crate::cache::{Cache, CacheError, CacheKey};

use super::store::{TokenStore, TokenStoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] TokenStoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct TokenLifecycleManager {
    store: Arc<dyn TokenStore>,
    cache: Cache,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
    lookup_ttl: Duration,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        cache: Cache,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
        lookup_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            policy,
            lookup_ttl,
        }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    #[instrument(skip(self), err)]
    pub fn issue(&self, user_id: UserId, remember: bool) -> Result<SessionToken, SessionError> {
        let token = self.policy.issue(user_id, remember, self.clock.now());
        self.store.insert(&token)?;
        info!(token_id = %token.token_id, user_id = %user_id, remember, "token issued");
        Ok(token)
    }

    /// Extend a token that is still inside its renewal window.
    ///
    /// A rejected renewal changes nothing.
    #[instrument(skip(self), err)]
    pub fn renew(&self, token_id: TokenId) -> Result<SessionToken, SessionError> {
        let now = self.clock.now();
        let current = self.store.get(token_id)?.ok_or(TokenError::NotFound)?;
        let renewed = self.policy.renew(&current, now)?;

        if !self
            .store
            .update_expiry(token_id, renewed.expires_at, renewed.renewable_until)?
        {
            // Revoked or deleted between the read and the write.
            let err = match self.store.get(token_id)? {
                Some(token) if token.is_revoked() => TokenError::NotRenewable,
                Some(_) => TokenError::Expired,
                None => TokenError::NotFound,
            };
            return Err(err.into());
        }

        self.forget(token_id)?;
        debug!(token_id = %token_id, expires_at = %renewed.expires_at, "token renewed");
        Ok(renewed)
    }

    /// Revoke a token. Returns `false` if it did not exist.
    ///
    /// The cached lookup is removed after the store write; an error from that
    /// removal is returned because the token could otherwise keep validating
    /// from the cache until the lookup entry expires.
    #[instrument(skip(self), err)]
    pub fn revoke(&self, token_id: TokenId) -> Result<bool, SessionError> {
        let existed = self.store.revoke(token_id, self.clock.now())?;
        self.forget(token_id)?;
        if existed {
            info!(token_id = %token_id, "token revoked");
        }
        Ok(existed)
    }

    /// Resolve a token for request authentication.
    pub fn validate(&self, token_id: TokenId) -> Result<SessionToken, SessionError> {
        let now = self.clock.now();
        let key = CacheKey::session(token_id)?;

        match self.cache.get_json::<SessionToken>(&key) {
            Ok(Some(token)) if token.token_id == token_id => {
                token.check_active(now)?;
                return Ok(token);
            }
            Ok(_) => {}
            Err(err) => warn!(token_id = %token_id, error = %err, "token cache read failed; using store"),
        }

        let token = self.store.get(token_id)?.ok_or(TokenError::NotFound)?;
        token.check_active(now)?;

        let remaining = (token.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        let ttl = remaining.min(self.lookup_ttl);
        if ttl.is_zero() {
            return Ok(token);
        }
        if let Err(err) = self.cache.set_json(&key, &token, Some(ttl)) {
            warn!(token_id = %token_id, error = %err, "could not cache token lookup");
            return Ok(token);
        }
        self.confirm_cached(token, now)
    }

    /// A renew or revoke that lands between the store read and the cache fill
    /// has already dropped the cache entry, so the fill would resurrect the old
    /// state. Re-read the store and drop the entry if the record moved on.
    fn confirm_cached(&self, cached: SessionToken, now: DateTime<Utc>) -> Result<SessionToken, SessionError> {
        let latest = self.store.get(cached.token_id)?;
        if latest.as_ref() == Some(&cached) {
            return Ok(cached);
        }
        debug!(token_id = %cached.token_id, "token changed while caching lookup");
        self.forget(cached.token_id)?;
        let latest = latest.ok_or(TokenError::NotFound)?;
        latest.check_active(now)?;
        Ok(latest)
    }

    /// Delete tokens whose expiry plus the cleanup grace is in the past.
    #[instrument(skip(self), err)]
    pub fn cleanup_expired(&self) -> Result<u64, SessionError> {
        let cutoff = self.clock.now() - self.policy.cleanup_grace;
        let removed = self.store.delete_expired_before(cutoff)?;
        if removed > 0 {
            info!(removed, "expired tokens deleted");
        }
        Ok(removed)
    }

    fn forget(&self, token_id: TokenId) -> Result<(), SessionError> {
        let key = CacheKey::session(token_id)?;
        self.cache.delete(&key)?;
        Ok(())
    }
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("cache", &self.cache)
            .field("policy", &self.policy)
            .field("lookup_ttl", &self.lookup_ttl)
            .finish_non_exhaustive()
    }
}
