//! Postgres-backed token store (`session_tokens` table).

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;

use folio_auth::SessionToken;
use folio_core::{TokenId, UserId};

use crate::db::{DbFailure, PgDatabase, map_sqlx_error};

use super::store::{TokenStore, TokenStoreError};

#[derive(Debug, Clone)]
pub struct PostgresTokenStore {
    db: PgDatabase,
}

impl PostgresTokenStore {
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

impl TokenStore for PostgresTokenStore {
    fn insert(&self, token: &SessionToken) -> Result<(), TokenStoreError> {
        self.db.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO session_tokens
                    (token_id, user_id, remember, issued_at, expires_at, renewable_until, revoked_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(token.token_id.as_uuid())
            .bind(token.user_id.as_uuid())
            .bind(token.remember)
            .bind(token.issued_at)
            .bind(token.expires_at)
            .bind(token.renewable_until)
            .bind(token.revoked_at)
            .execute(self.db.pool())
            .await
            .map_err(|e| match map_sqlx_error("insert token", e) {
                DbFailure::Duplicate(_) => TokenStoreError::Duplicate(token.token_id),
                other => store_error(other),
            })?;
            Ok(())
        })
    }

    fn get(&self, token_id: TokenId) -> Result<Option<SessionToken>, TokenStoreError> {
        self.db.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT token_id, user_id, remember, issued_at, expires_at, renewable_until, revoked_at
                  FROM session_tokens WHERE token_id = $1
                "#,
            )
            .bind(token_id.as_uuid())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| store_error(map_sqlx_error("get token", e)))?;
            row.map(|r| token_from_row(&r)).transpose()
        })
    }

    fn update_expiry(
        &self,
        token_id: TokenId,
        expires_at: DateTime<Utc>,
        renewable_until: DateTime<Utc>,
    ) -> Result<bool, TokenStoreError> {
        self.db.block_on(async {
            let result = sqlx::query(
                r#"
                UPDATE session_tokens SET expires_at = $2, renewable_until = $3
                 WHERE token_id = $1 AND revoked_at IS NULL
                "#,
            )
            .bind(token_id.as_uuid())
            .bind(expires_at)
            .bind(renewable_until)
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error(map_sqlx_error("renew token", e)))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn revoke(&self, token_id: TokenId, at: DateTime<Utc>) -> Result<bool, TokenStoreError> {
        self.db.block_on(async {
            let result = sqlx::query(
                "UPDATE session_tokens SET revoked_at = COALESCE(revoked_at, $2) WHERE token_id = $1",
            )
            .bind(token_id.as_uuid())
            .bind(at)
            .execute(self.db.pool())
            .await
            .map_err(|e| store_error(map_sqlx_error("revoke token", e)))?;
            Ok(result.rows_affected() == 1)
        })
    }

    #[instrument(skip(self), err)]
    fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, TokenStoreError> {
        self.db.block_on(async {
            let result = sqlx::query("DELETE FROM session_tokens WHERE expires_at < $1")
                .bind(cutoff)
                .execute(self.db.pool())
                .await
                .map_err(|e| store_error(map_sqlx_error("delete expired tokens", e)))?;
            Ok(result.rows_affected())
        })
    }
}

fn store_error(failure: DbFailure) -> TokenStoreError {
    match failure {
        DbFailure::Unavailable(msg) => TokenStoreError::Unavailable(msg),
        DbFailure::Duplicate(msg) | DbFailure::Data(msg) => TokenStoreError::Corrupt(msg),
    }
}

fn token_from_row(row: &PgRow) -> Result<SessionToken, TokenStoreError> {
    let get_err = |e: sqlx::Error| store_error(map_sqlx_error("decode session_tokens row", e));
    Ok(SessionToken {
        token_id: TokenId::from_uuid(row.try_get("token_id").map_err(get_err)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(get_err)?),
        remember: row.try_get("remember").map_err(get_err)?,
        issued_at: row.try_get("issued_at").map_err(get_err)?,
        expires_at: row.try_get("expires_at").map_err(get_err)?,
        renewable_until: row.try_get("renewable_until").map_err(get_err)?,
        revoked_at: row.try_get("revoked_at").map_err(get_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_is_unavailable_not_corrupt() {
        assert!(matches!(
            store_error(map_sqlx_error("get token", sqlx::Error::PoolTimedOut)),
            TokenStoreError::Unavailable(_)
        ));
        assert!(matches!(
            store_error(map_sqlx_error("get token", sqlx::Error::RowNotFound)),
            TokenStoreError::Corrupt(_)
        ));
    }
}
