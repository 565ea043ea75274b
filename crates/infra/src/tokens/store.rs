//! Durable token records.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use folio_auth::SessionToken;
use folio_core::TokenId;

pub trait TokenStore: Send + Sync {
    fn insert(&self, token: &SessionToken) -> Result<(), TokenStoreError>;

    fn get(&self, token_id: TokenId) -> Result<Option<SessionToken>, TokenStoreError>;

    /// Move the expiry of an unrevoked token. Returns `false` if the token is
    /// missing or revoked.
    fn update_expiry(
        &self,
        token_id: TokenId,
        expires_at: DateTime<Utc>,
        renewable_until: DateTime<Utc>,
    ) -> Result<bool, TokenStoreError>;

    /// Mark a token revoked. Returns `false` if it does not exist. Revoking an
    /// already revoked token keeps the original revocation time.
    fn revoke(&self, token_id: TokenId, at: DateTime<Utc>) -> Result<bool, TokenStoreError>;

    /// Delete tokens that expired strictly before `cutoff`.
    fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TokenStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenStoreError {
    #[error("token already exists: {0}")]
    Duplicate(TokenId),
    #[error("token store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt token record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<TokenId, SessionToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> TokenStoreError {
        TokenStoreError::Unavailable("token store lock poisoned".into())
    }
}

impl TokenStore for InMemoryTokenStore {
    fn insert(&self, token: &SessionToken) -> Result<(), TokenStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| Self::poisoned())?;
        if tokens.contains_key(&token.token_id) {
            return Err(TokenStoreError::Duplicate(token.token_id));
        }
        tokens.insert(token.token_id, token.clone());
        Ok(())
    }

    fn get(&self, token_id: TokenId) -> Result<Option<SessionToken>, TokenStoreError> {
        let tokens = self.tokens.read().map_err(|_| Self::poisoned())?;
        Ok(tokens.get(&token_id).cloned())
    }

    fn update_expiry(
        &self,
        token_id: TokenId,
        expires_at: DateTime<Utc>,
        renewable_until: DateTime<Utc>,
    ) -> Result<bool, TokenStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| Self::poisoned())?;
        match tokens.get_mut(&token_id) {
            Some(token) if !token.is_revoked() => {
                token.expires_at = expires_at;
                token.renewable_until = renewable_until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn revoke(&self, token_id: TokenId, at: DateTime<Utc>) -> Result<bool, TokenStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| Self::poisoned())?;
        match tokens.get_mut(&token_id) {
            Some(token) => {
                token.revoked_at.get_or_insert(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TokenStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| Self::poisoned())?;
        let before = tokens.len();
        tokens.retain(|_, token| token.expires_at >= cutoff);
        Ok((before - tokens.len()) as u64)
    }
}

impl<S> TokenStore for Arc<S>
where
    S: TokenStore + ?Sized,
{
    fn insert(&self, token: &SessionToken) -> Result<(), TokenStoreError> {
        (**self).insert(token)
    }

    fn get(&self, token_id: TokenId) -> Result<Option<SessionToken>, TokenStoreError> {
        (**self).get(token_id)
    }

    fn update_expiry(
        &self,
        token_id: TokenId,
        expires_at: DateTime<Utc>,
        renewable_until: DateTime<Utc>,
    ) -> Result<bool, TokenStoreError> {
        (**self).update_expiry(token_id, expires_at, renewable_until)
    }

    fn revoke(&self, token_id: TokenId, at: DateTime<Utc>) -> Result<bool, TokenStoreError> {
        (**self).revoke(token_id, at)
    }

    fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TokenStoreError> {
        (**self).delete_expired_before(cutoff)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use folio_auth::TokenPolicy;
    use folio_core::UserId;

    use super::*;

    #[test]
    fn revoked_tokens_cannot_be_extended() {
        let store = InMemoryTokenStore::new();
        let now = Utc::now();
        let token = TokenPolicy::default().issue(UserId::new(), false, now);
        store.insert(&token).unwrap();

        assert!(store.revoke(token.token_id, now).unwrap());
        assert!(!store.update_expiry(token.token_id, now + Duration::hours(8), now).unwrap());
        assert_eq!(store.get(token.token_id).unwrap().unwrap().expires_at, token.expires_at);
    }

    #[test]
    fn second_revoke_keeps_first_timestamp() {
        let store = InMemoryTokenStore::new();
        let now = Utc::now();
        let token = TokenPolicy::default().issue(UserId::new(), false, now);
        store.insert(&token).unwrap();

        store.revoke(token.token_id, now).unwrap();
        store.revoke(token.token_id, now + Duration::minutes(5)).unwrap();
        assert_eq!(store.get(token.token_id).unwrap().unwrap().revoked_at, Some(now));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryTokenStore::new();
        let token = TokenPolicy::default().issue(UserId::new(), false, Utc::now());
        store.insert(&token).unwrap();
        assert_eq!(store.insert(&token), Err(TokenStoreError::Duplicate(token.token_id)));
    }
}
