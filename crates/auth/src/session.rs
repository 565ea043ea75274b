use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_core::{DomainError, DomainResult, TokenId, UserId};

/// Durable session token record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub token_id: TokenId,
    pub user_id: UserId,

    /// Whether the token was issued with the long ("remember me") lifetime.
    /// Renewals keep the same lifetime class.
    pub remember: bool,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Renewal is permitted strictly before this instant.
    pub renewable_until: DateTime<Utc>,

    /// Set by `revoke`. Revoked records stay until the cleanup job collects them.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    /// A token authenticates requests while unexpired and not revoked.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Authentication check: revocation wins over expiry.
    pub fn check_active(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if self.is_revoked() {
            return Err(TokenError::Revoked);
        }
        if now >= self.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    /// Whether the expired-token cleanup may delete this record.
    pub fn is_collectable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.expires_at + grace < now
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The renewal window has closed (`now >= renewable_until`), or the token
    /// is no longer valid for authentication.
    #[error("token has expired")]
    Expired,

    /// The token exists but may not be renewed (it was revoked).
    #[error("token cannot be renewed")]
    NotRenewable,

    #[error("token has been revoked")]
    Revoked,

    #[error("token not found")]
    NotFound,
}

/// Lifetime rules for issued tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Lifetime of a regular session.
    pub expiration: Duration,
    /// Lifetime of a "remember me" session.
    pub expiration_long: Duration,
    /// How long after `expires_at` a renewal is still accepted.
    pub renewal_window: Duration,
    /// How long after `expires_at` a record is kept before cleanup deletes it.
    pub cleanup_grace: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            expiration: Duration::hours(4),
            expiration_long: Duration::days(7),
            renewal_window: Duration::minutes(30),
            cleanup_grace: Duration::minutes(30),
        }
    }
}

impl TokenPolicy {
    /// Build a policy, rejecting non-positive durations and a cleanup grace
    /// that would collect tokens still inside their renewal window.
    pub fn new(
        expiration: Duration,
        expiration_long: Duration,
        renewal_window: Duration,
        cleanup_grace: Duration,
    ) -> DomainResult<Self> {
        if expiration <= Duration::zero() || expiration_long <= Duration::zero() {
            return Err(DomainError::validation("token expiration must be positive"));
        }
        if renewal_window < Duration::zero() || cleanup_grace < Duration::zero() {
            return Err(DomainError::validation(
                "renewal window and cleanup grace must not be negative",
            ));
        }
        if cleanup_grace < renewal_window {
            return Err(DomainError::invariant(
                "cleanup grace must cover the renewal window",
            ));
        }
        Ok(Self {
            expiration,
            expiration_long,
            renewal_window,
            cleanup_grace,
        })
    }

    pub fn lifetime(&self, remember: bool) -> Duration {
        if remember {
            self.expiration_long
        } else {
            self.expiration
        }
    }

    /// Create a fresh token for `user_id` issued at `now`.
    pub fn issue(&self, user_id: UserId, remember: bool, now: DateTime<Utc>) -> SessionToken {
        let expires_at = now + self.lifetime(remember);
        SessionToken {
            token_id: TokenId::generate(),
            user_id,
            remember,
            issued_at: now,
            expires_at,
            renewable_until: expires_at + self.renewal_window,
            revoked_at: None,
        }
    }

    /// Compute the renewed form of `token` at `now`.
    ///
    /// The token id is kept; only the expiry and renewal bounds move. The input
    /// is never modified, so a rejected renewal leaves the stored record intact.
    pub fn renew(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<SessionToken, TokenError> {
        if token.is_revoked() {
            return Err(TokenError::NotRenewable);
        }
        if now >= token.renewable_until {
            return Err(TokenError::Expired);
        }

        let expires_at = now + self.lifetime(token.remember);
        Ok(SessionToken {
            expires_at,
            renewable_until: expires_at + self.renewal_window,
            ..token.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn issue_uses_short_lifetime_without_remember() {
        let policy = TokenPolicy::default();
        let token = policy.issue(UserId::new(), false, t0());

        assert_eq!(token.issued_at, t0());
        assert_eq!(token.expires_at, t0() + Duration::hours(4));
        assert_eq!(token.renewable_until, token.expires_at + Duration::minutes(30));
        assert!(token.is_active(t0()));
        assert_eq!(token.check_active(token.expires_at), Err(TokenError::Expired));
    }

    #[test]
    fn issue_uses_long_lifetime_with_remember() {
        let policy = TokenPolicy::default();
        let token = policy.issue(UserId::new(), true, t0());

        assert_eq!(token.expires_at, t0() + Duration::days(7));
    }

    #[test]
    fn renew_inside_window_extends_expiry_and_keeps_id() {
        let policy = TokenPolicy::default();
        let token = policy.issue(UserId::new(), false, t0());
        let later = token.expires_at + Duration::minutes(10);

        let renewed = policy.renew(&token, later).unwrap();

        assert_eq!(renewed.token_id, token.token_id);
        assert_eq!(renewed.expires_at, later + Duration::hours(4));
        assert_eq!(renewed.issued_at, token.issued_at);
    }

    #[test]
    fn renew_past_window_is_expired() {
        let policy = TokenPolicy::default();
        let token = policy.issue(UserId::new(), false, t0());

        assert_eq!(policy.renew(&token, token.renewable_until), Err(TokenError::Expired));
        assert_eq!(
            policy.renew(&token, token.renewable_until + Duration::seconds(1)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn revoked_token_is_inactive_and_not_renewable() {
        let policy = TokenPolicy::default();
        let mut token = policy.issue(UserId::new(), false, t0());
        token.revoked_at = Some(t0());

        assert!(!token.is_active(t0()));
        assert_eq!(token.check_active(t0()), Err(TokenError::Revoked));
        assert_eq!(policy.renew(&token, t0()), Err(TokenError::NotRenewable));
    }

    #[test]
    fn collectable_only_after_grace() {
        let policy = TokenPolicy::default();
        let token = policy.issue(UserId::new(), false, t0());
        let grace = policy.cleanup_grace;

        assert!(!token.is_collectable(token.expires_at + grace, grace));
        assert!(token.is_collectable(token.expires_at + grace + Duration::seconds(1), grace));
    }

    #[test]
    fn policy_rejects_grace_shorter_than_renewal_window() {
        let err = TokenPolicy::new(
            Duration::hours(1),
            Duration::days(1),
            Duration::minutes(30),
            Duration::minutes(5),
        )
        .unwrap_err();

        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn token_serializes_with_optional_revocation() {
        let token = TokenPolicy::default().issue(UserId::new(), true, t0());
        let json = serde_json::to_value(&token).unwrap();
        assert!(json["revoked_at"].is_null());
        assert_eq!(json["remember"], true);
    }
}
