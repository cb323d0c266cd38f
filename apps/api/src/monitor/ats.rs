use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::MonitorError;
use crate::models::application::ApplicationStatus;
use crate::portal::PortalFamily;

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct AtsStatus {
    pub status: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[async_trait]
pub trait AtsProvider: Send + Sync {
    async fn status(&self, family: PortalFamily, handle: &str) -> Result<AtsStatus, MonitorError>;
}

/// Canonical status for an ATS status string; `None` for anything unknown.
pub fn map_external_status(status: &str) -> Option<ApplicationStatus> {
    match status.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
        "active" | "in_progress" | "pending" => Some(ApplicationStatus::InReview),
        "phone_screen" | "technical" | "on_site" | "final" | "interview" => Some(ApplicationStatus::Interview),
        "hired" | "offer_extended" => Some(ApplicationStatus::Offer),
        "rejected" | "not_selected" | "archived" => Some(ApplicationStatus::Rejected),
        _ => None,
    }
}

/// `GET {base}/applications/{handle}/status` per family.
#[derive(Clone)]
pub struct HttpAtsProvider {
    client: Client,
    endpoints: HashMap<PortalFamily, String>,
}

impl HttpAtsProvider {
    pub fn new(endpoints: HashMap<PortalFamily, String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(20)).build()?,
            endpoints,
        })
    }
}

#[async_trait]
impl AtsProvider for HttpAtsProvider {
    async fn status(&self, family: PortalFamily, handle: &str) -> Result<AtsStatus, MonitorError> {
        let base = self
            .endpoints
            .get(&family)
            .ok_or_else(|| MonitorError::Unsupported(family.provider().to_string()))?;
        let url = format!("{}/applications/{}/status", base.trim_end_matches('/'), handle);

        let mut last_error: Option<MonitorError> = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(%family, attempt, delay_ms = delay.as_millis() as u64, "ATS status call failed, retrying");
                tokio::time::sleep(delay).await;
            }

            let response = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(MonitorError::Http(e));
                    continue;
                }
            };
            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = Some(MonitorError::Api {
                    provider: family.provider().to_string(),
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }
            if !status.is_success() {
                return Err(MonitorError::Api {
                    provider: family.provider().to_string(),
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            let body: AtsStatus = response.json().await?;
            debug!(%family, handle, status = %body.status, "ATS status fetched");
            return Ok(body);
        }
        Err(last_error.unwrap_or_else(|| MonitorError::Unsupported(family.provider().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_status_table() {
        use ApplicationStatus::*;
        for (raw, expected) in [
            ("active", InReview),
            ("In Progress", InReview),
            ("pending", InReview),
            ("phone_screen", Interview),
            ("on-site", Interview),
            ("final", Interview),
            ("interview", Interview),
            ("hired", Offer),
            ("offer_extended", Offer),
            ("not_selected", Rejected),
            ("ARCHIVED", Rejected),
        ] {
            assert_eq!(map_external_status(raw), Some(expected), "{raw}");
        }
        assert_eq!(map_external_status("withdrawn_by_employer"), None);
    }

    #[test]
    fn test_status_body_tolerates_missing_fields() {
        let body: AtsStatus = serde_json::from_str(r#"{"status":"interview"}"#).unwrap();
        assert!(body.stage.is_none() && body.updated_at.is_none());
    }
}
