//! Credential Vault: encrypted portal logins and OAuth tokens.
//!
//! Plaintext only ever leaves the vault inside a `CredentialLease` or a
//! `Zeroizing<String>` access token, both of which wipe their buffers on drop.

pub mod cipher;
pub mod oauth;
pub mod repo;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

pub use cipher::Cipher;
pub use oauth::{ExchangeError, HttpTokenExchange, OAuthClient, TokenExchange, TokenResponse};
#[cfg(test)]
pub use repo::MemoryCredentialStore;
pub use repo::{CredentialStore, PgCredentialStore};

/// Refresh this long before the recorded expiry.
const REFRESH_SKEW_SECS: i64 = 60;
const REFRESH_RETRIES: u32 = 3;
const REFRESH_BACKOFF_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Deploy secret APP_SECRET_KEY is not available")]
    SecretUnavailable,

    #[error("Decryption failed: {0}")]
    DecryptFailure(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("No usable {provider} authorization; user must re-authenticate")]
    AuthUnavailable { provider: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ────────────────────────────────────────────────────────────────────────────
// Lease
// ────────────────────────────────────────────────────────────────────────────

/// Cleartext portal login, scoped to one Portal Driver session.
pub struct CredentialLease {
    pub provider: String,
    pub domain: Option<String>,
    username: Zeroizing<String>,
    password: Zeroizing<String>,
}

impl CredentialLease {
    pub fn new(
        provider: impl Into<String>,
        domain: Option<String>,
        username: Zeroizing<String>,
        password: Zeroizing<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            domain,
            username,
            password,
        }
    }

    pub fn empty(provider: impl Into<String>, domain: Option<String>) -> Self {
        Self::new(provider, domain, Zeroizing::default(), Zeroizing::default())
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// `provider` or `provider:domain`.
    pub fn key(&self) -> String {
        lease_key(&self.provider, self.domain.as_deref())
    }
}

pub fn lease_key(provider: &str, domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{provider}:{domain}"),
        None => provider.to_string(),
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("provider", &self.provider)
            .field("domain", &self.domain)
            .field("empty", &self.is_empty())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Vault
// ────────────────────────────────────────────────────────────────────────────

pub struct Vault {
    cipher: Cipher,
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
}

impl Vault {
    pub fn new(
        cipher: Cipher,
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        Self {
            cipher,
            store,
            exchange,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        self.cipher.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.cipher.decrypt(ciphertext)
    }

    pub async fn store_credential(
        &self,
        user_id: Uuid,
        provider: &str,
        domain: Option<&str>,
        username: &str,
        password: &str,
    ) -> Result<(), VaultError> {
        let username_ct = self.cipher.encrypt_str(username)?;
        let password_ct = self.cipher.encrypt_str(password)?;
        self.store
            .upsert_credential(user_id, provider, domain, username_ct, password_ct)
            .await?;
        info!(user_id = %user_id, provider, domain = ?domain, "Portal credential stored");
        Ok(())
    }

    pub async fn store_oauth_token(
        &self,
        user_id: Uuid,
        provider: &str,
        refresh_token: &str,
    ) -> Result<(), VaultError> {
        let ct = self.cipher.encrypt_str(refresh_token)?;
        self.store.upsert_refresh_token(user_id, provider, ct).await?;
        info!(user_id = %user_id, provider, "OAuth refresh token stored");
        Ok(())
    }

    /// Decrypts the best-matching portal login: the domain-specific one if
    /// stored, else the provider-wide one. Missing or undecryptable
    /// credentials yield an empty lease.
    pub async fn acquire(
        &self,
        user_id: Uuid,
        provider: &str,
        domain: Option<&str>,
    ) -> Result<CredentialLease, VaultError> {
        let mut row = None;
        if domain.is_some() {
            row = self.store.find_credential(user_id, provider, domain).await?;
        }
        if row.is_none() {
            row = self.store.find_credential(user_id, provider, None).await?;
        }

        let Some(row) = row else {
            debug!(user_id = %user_id, provider, "No stored portal credential");
            return Ok(CredentialLease::empty(provider, domain.map(String::from)));
        };

        let decrypted = self
            .cipher
            .decrypt_string(&row.username_ct)
            .and_then(|u| Ok((u, self.cipher.decrypt_string(&row.password_ct)?)));

        match decrypted {
            Ok((username, password)) => Ok(CredentialLease::new(
                provider,
                row.company_domain.clone(),
                username,
                password,
            )),
            Err(e) => {
                warn!(user_id = %user_id, provider, error = %e, "Portal credential could not be decrypted");
                Ok(CredentialLease::empty(provider, domain.map(String::from)))
            }
        }
    }

    /// Returns a usable access token, refreshing it when absent or near expiry.
    pub async fn access_token(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Zeroizing<String>, VaultError> {
        let unavailable = || VaultError::AuthUnavailable {
            provider: provider.to_string(),
        };

        let row = self
            .store
            .oauth_token(user_id, provider)
            .await?
            .ok_or_else(unavailable)?;
        let now = Utc::now();

        let cached = row.access_token_ct.as_ref().and_then(|ct| {
            self.cipher
                .decrypt_string(ct)
                .map_err(|e| warn!(user_id = %user_id, provider, error = %e, "Cached access token unreadable"))
                .ok()
        });

        let fresh = row
            .expires_at
            .map(|at| at - chrono::Duration::seconds(REFRESH_SKEW_SECS) > now)
            .unwrap_or(false);
        if let (Some(token), true) = (&cached, fresh) {
            return Ok(token.clone());
        }

        let refresh_token = self.cipher.decrypt_string(&row.refresh_token_ct).map_err(|e| {
            warn!(user_id = %user_id, provider, error = %e, "Refresh token unreadable");
            unavailable()
        })?;

        match self.refresh_with_retry(provider, &refresh_token).await {
            Ok(resp) => {
                let expires_at = Utc::now() + chrono::Duration::seconds(resp.expires_in.max(1));
                let access_ct = self.cipher.encrypt_str(&resp.access_token)?;
                self.store
                    .update_access_token(row.id, access_ct, expires_at)
                    .await?;
                info!(user_id = %user_id, provider, %expires_at, "Access token refreshed");
                Ok(Zeroizing::new(resp.access_token))
            }
            Err(e) => {
                warn!(user_id = %user_id, provider, error = %e, "Access token refresh failed");
                match cached {
                    Some(token) if !row.is_expired(Utc::now()) => Ok(token),
                    _ => Err(unavailable()),
                }
            }
        }
    }

    async fn refresh_with_retry(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse, ExchangeError> {
        let mut last_error = None;
        for attempt in 0..REFRESH_RETRIES {
            if attempt > 0 {
                // 500ms, 1s
                let delay = Duration::from_millis(REFRESH_BACKOFF_MS * (1 << (attempt - 1)));
                debug!(provider, attempt, "Retrying token refresh after {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
            }
            match self.exchange.refresh(provider, refresh_token).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| ExchangeError::Transport("no attempts made".to_string())))
    }
}
