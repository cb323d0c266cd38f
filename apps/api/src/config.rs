use std::str::FromStr;

use anyhow::{Context, Result};

use crate::monitor::inbox::DEFAULT_GMAIL_API;

/// S3 / MinIO target for screenshots and attempt logs.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub app_secret_key: String,
    pub jwt_secret: String,
    pub port: u16,
    pub rust_log: String,

    pub webdriver_url: String,
    pub browser_headless: bool,
    pub captcha_wait_secs: u64,
    pub action_timeout_secs: u64,
    pub submission_budget_secs: u64,
    pub driver_max_retries: u32,

    pub submission_concurrency: usize,
    pub submission_max_attempts: u32,
    pub submission_retry_base_secs: u64,
    pub scheduler_tick_secs: u64,

    pub monitor_sweep_secs: u64,
    pub monitor_provider_qps: u32,
    pub default_check_interval_minutes: i32,
    pub email_lookback_days: i64,

    pub artifact_dir: String,
    /// Present only when all four S3 variables are set.
    pub s3: Option<S3Config>,
    /// Present only when the client id and secret are set.
    pub google: Option<GoogleOAuth>,
    pub gmail_api_base: String,
    pub ats_greenhouse_url: Option<String>,
    pub ats_lever_url: Option<String>,
    pub ats_workday_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let s3 = match (
            optional_env("S3_BUCKET"),
            optional_env("S3_ENDPOINT"),
            optional_env("AWS_ACCESS_KEY_ID"),
            optional_env("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(bucket), Some(endpoint), Some(access_key_id), Some(secret_access_key)) => {
                Some(S3Config {
                    bucket,
                    endpoint,
                    access_key_id,
                    secret_access_key,
                })
            }
            _ => None,
        };

        let google = match (optional_env("GOOGLE_CLIENT_ID"), optional_env("GOOGLE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(GoogleOAuth {
                client_id,
                client_secret,
                token_url: optional_env("GOOGLE_TOKEN_URL")
                    .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_string()),
            }),
            _ => None,
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            app_secret_key: require_env("APP_SECRET_KEY")?,
            jwt_secret: require_env("JWT_SECRET")?,
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),

            webdriver_url: optional_env("WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:9515".to_string()),
            browser_headless: env_or("BROWSER_HEADLESS", true)?,
            captcha_wait_secs: env_or("CAPTCHA_WAIT_SECS", 15)?,
            action_timeout_secs: env_or("ACTION_TIMEOUT_SECS", 30)?,
            submission_budget_secs: env_or("SUBMISSION_BUDGET_SECS", 300)?,
            driver_max_retries: env_or("DRIVER_MAX_RETRIES", 3)?,

            submission_concurrency: env_or("SUBMISSION_CONCURRENCY", 3)?,
            submission_max_attempts: env_or("SUBMISSION_MAX_ATTEMPTS", 3)?,
            submission_retry_base_secs: env_or("SUBMISSION_RETRY_BASE_SECS", 60)?,
            scheduler_tick_secs: env_or("SCHEDULER_TICK_SECS", 30)?,

            monitor_sweep_secs: env_or("MONITOR_SWEEP_SECS", 60)?,
            monitor_provider_qps: env_or("MONITOR_PROVIDER_QPS", 2)?,
            default_check_interval_minutes: env_or("DEFAULT_CHECK_INTERVAL_MINUTES", 60)?,
            email_lookback_days: env_or("EMAIL_LOOKBACK_DAYS", 14)?,

            artifact_dir: optional_env("ARTIFACT_DIR").unwrap_or_else(|| "./artifacts".to_string()),
            s3,
            google,
            gmail_api_base: optional_env("GMAIL_API_BASE")
                .unwrap_or_else(|| DEFAULT_GMAIL_API.to_string()),
            ats_greenhouse_url: optional_env("ATS_GREENHOUSE_URL"),
            ats_lever_url: optional_env("ATS_LEVER_URL"),
            ats_workday_url: optional_env("ATS_WORKDAY_URL"),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_parses_and_defaults() {
        std::env::set_var("JOBPILOT_TEST_QPS", " 5 ");
        std::env::set_var("JOBPILOT_TEST_HEADLESS", "false");
        std::env::set_var("JOBPILOT_TEST_BAD", "soon");

        assert_eq!(env_or::<u32>("JOBPILOT_TEST_QPS", 2).unwrap(), 5);
        assert!(!env_or("JOBPILOT_TEST_HEADLESS", true).unwrap());
        assert_eq!(env_or::<u64>("JOBPILOT_TEST_UNSET", 30).unwrap(), 30);
        assert!(env_or::<u64>("JOBPILOT_TEST_BAD", 30).is_err());
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        std::env::set_var("JOBPILOT_TEST_BLANK", "  ");
        assert_eq!(optional_env("JOBPILOT_TEST_BLANK"), None);
    }
}
