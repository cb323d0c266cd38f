use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::VaultError;
use crate::models::credential::{OAuthTokenRow, PortalCredentialRow};

/// Ciphertext persistence for portal credentials and OAuth tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Exact match on `(user, provider, domain)`; `None` domain means provider-wide.
    async fn find_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        domain: Option<&str>,
    ) -> Result<Option<PortalCredentialRow>, VaultError>;

    async fn upsert_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        domain: Option<&str>,
        username_ct: Vec<u8>,
        password_ct: Vec<u8>,
    ) -> Result<(), VaultError>;

    async fn oauth_token(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<OAuthTokenRow>, VaultError>;

    /// Stores a new refresh token and drops any cached access token.
    async fn upsert_refresh_token(
        &self,
        user_id: Uuid,
        provider: &str,
        refresh_token_ct: Vec<u8>,
    ) -> Result<(), VaultError>;

    /// Writes access token and expiry together.
    async fn update_access_token(
        &self,
        token_id: Uuid,
        access_token_ct: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), VaultError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        domain: Option<&str>,
    ) -> Result<Option<PortalCredentialRow>, VaultError> {
        Ok(sqlx::query_as::<_, PortalCredentialRow>(
            r#"
            SELECT * FROM portal_credentials
            WHERE user_id = $1 AND provider = $2
              AND COALESCE(company_domain, '') = COALESCE($3, '')
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upsert_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        domain: Option<&str>,
        username_ct: Vec<u8>,
        password_ct: Vec<u8>,
    ) -> Result<(), VaultError> {
        sqlx::query(
            r#"
            INSERT INTO portal_credentials
                (id, user_id, provider, company_domain, username_ct, password_ct)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, provider, (COALESCE(company_domain, ''))) DO UPDATE SET
                username_ct = EXCLUDED.username_ct,
                password_ct = EXCLUDED.password_ct,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(provider)
        .bind(domain)
        .bind(username_ct)
        .bind(password_ct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn oauth_token(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<OAuthTokenRow>, VaultError> {
        Ok(sqlx::query_as::<_, OAuthTokenRow>(
            "SELECT * FROM oauth_tokens WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upsert_refresh_token(
        &self,
        user_id: Uuid,
        provider: &str,
        refresh_token_ct: Vec<u8>,
    ) -> Result<(), VaultError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (id, user_id, provider, refresh_token_ct)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, provider) DO UPDATE SET
                refresh_token_ct = EXCLUDED.refresh_token_ct,
                access_token_ct = NULL,
                expires_at = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(provider)
        .bind(refresh_token_ct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_access_token(
        &self,
        token_id: Uuid,
        access_token_ct: Vec<u8>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        sqlx::query(
            r#"
            UPDATE oauth_tokens
            SET access_token_ct = $2, expires_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(token_id)
        .bind(access_token_ct)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub use memory::*;
