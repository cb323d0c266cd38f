//! Refresh-token exchange against a provider's token endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network failure, 429 or 5xx. Worth retrying.
    #[error("Token endpoint unreachable: {0}")]
    Transport(String),

    /// The provider refused the refresh token. Retrying will not help.
    #[error("Token endpoint rejected refresh (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("No OAuth client configured for provider '{0}'")]
    UnknownProvider(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, provider: &str, refresh_token: &str)
        -> Result<TokenResponse, ExchangeError>;
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

/// Posts `grant_type=refresh_token` forms to each provider's token URL.
#[derive(Clone)]
pub struct HttpTokenExchange {
    client: Client,
    clients: HashMap<String, OAuthClient>,
}

impl HttpTokenExchange {
    pub fn new(clients: HashMap<String, OAuthClient>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            clients,
        })
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse, ExchangeError> {
        let oauth = self
            .clients
            .get(provider)
            .ok_or_else(|| ExchangeError::UnknownProvider(provider.to_string()))?;

        let params = [
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let resp = self
            .client
            .post(&oauth.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Transport(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| ExchangeError::Transport(format!("token response parse error: {e}")))
    }
}
