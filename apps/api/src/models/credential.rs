use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored portal login. Both secrets are vault ciphertext.
#[derive(Debug, Clone, FromRow)]
pub struct PortalCredentialRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub company_domain: Option<String>,
    pub username_ct: Vec<u8>,
    pub password_ct: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OAuthTokenRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub refresh_token_ct: Vec<u8>,
    pub access_token_ct: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthTokenRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(true)
    }
}
