//! Gmail-style inbox search: query, then headers-only fetch per hit.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::MonitorError;

pub const DEFAULT_GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";

/// Subject keywords every confirmation search includes.
pub const BASE_KEYWORDS: [&str; 4] = ["application", "received", "thank you", "applied"];

#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub snippet: String,
}

#[async_trait]
pub trait Inbox: Send + Sync {
    async fn search(&self, access_token: &str, query: &str, max_results: u32) -> Result<Vec<String>, MonitorError>;

    async fn metadata(&self, access_token: &str, message_id: &str) -> Result<MessageMeta, MonitorError>;
}

fn quoted(term: &str) -> String {
    let term = term.replace('"', "");
    if term.contains(' ') {
        format!("\"{term}\"")
    } else {
        term
    }
}

/// `(kw OR ...) ("Company" OR "Title") after:YYYY/MM/DD`
pub fn build_query(company: &str, title: &str, extra_keywords: &[String], after: NaiveDate) -> String {
    let keywords: Vec<String> = BASE_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .chain(extra_keywords.iter().map(|k| k.trim().to_string()))
        .filter(|k| !k.is_empty())
        .map(|k| quoted(&k))
        .collect();
    let subjects: Vec<String> = [company, title]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(quoted)
        .collect();

    let mut query = format!("({})", keywords.join(" OR "));
    if !subjects.is_empty() {
        query.push_str(&format!(" ({})", subjects.join(" OR ")));
    }
    query.push_str(&format!(" after:{}", after.format("%Y/%m/%d")));
    query
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    id: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Deserialize)]
struct Header {
    name: String,
    value: String,
}

impl From<MessageResponse> for MessageMeta {
    fn from(msg: MessageResponse) -> Self {
        let headers = msg.payload.map(|p| p.headers).unwrap_or_default();
        let header = |name: &str| {
            headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
                .unwrap_or_default()
        };
        let date = msg
            .internal_date
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .or_else(|| {
                DateTime::parse_from_rfc2822(&header("Date"))
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            });
        MessageMeta {
            id: msg.id,
            subject: header("Subject"),
            from: header("From"),
            date,
            snippet: msg.snippet,
        }
    }
}

#[derive(Clone)]
pub struct GmailInbox {
    client: Client,
    base: String,
}

impl GmailInbox {
    pub fn new(base: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(20)).build()?,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        access_token: &str,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, MonitorError> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::Api {
                provider: "gmail".to_string(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Inbox for GmailInbox {
    async fn search(&self, access_token: &str, query: &str, max_results: u32) -> Result<Vec<String>, MonitorError> {
        let list: ListResponse = self
            .get(
                access_token,
                format!("{}/users/me/messages", self.base),
                &[("q", query.to_string()), ("maxResults", max_results.to_string())],
            )
            .await?;
        debug!(hits = list.messages.len(), "Inbox search");
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn metadata(&self, access_token: &str, message_id: &str) -> Result<MessageMeta, MonitorError> {
        let msg: MessageResponse = self
            .get(
                access_token,
                format!("{}/users/me/messages/{}", self.base, message_id),
                &[
                    ("format", "metadata".to_string()),
                    ("metadataHeaders", "Subject".to_string()),
                    ("metadataHeaders", "From".to_string()),
                    ("metadataHeaders", "Date".to_string()),
                ],
            )
            .await?;
        Ok(msg.into())
    }
}
