mod artifacts;
mod auth;
mod config;
mod db;
mod directory;
mod engine;
mod errors;
mod events;
mod models;
mod monitor;
mod portal;
mod routes;
mod scheduler;
mod state;
mod store;
mod submission;
#[cfg(test)]
mod testing;
mod vault;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::artifacts::{ArtifactStore, LocalArtifactStore, S3ArtifactStore};
use crate::auth::Authenticator;
use crate::config::{Config, S3Config};
use crate::db::create_pool;
use crate::directory::PgDirectory;
use crate::engine::{Engine, EngineParts, EngineSettings};
use crate::events::EventBus;
use crate::monitor::pool::GMAIL_PROVIDER;
use crate::monitor::{GmailInbox, HttpAtsProvider, MonitorSettings};
use crate::portal::{DriverConfig, PortalFamily, WebDriverFactory};
use crate::routes::build_router;
use crate::scheduler::SchedulerSettings;
use crate::state::AppState;
use crate::store::PgApplicationStore;
use crate::submission::{AttemptLog, WorkerSettings};
use crate::vault::{Cipher, HttpTokenExchange, OAuthClient, PgCredentialStore, Vault};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting JobPilot API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL (migrations included)
    let db = create_pool(&config.database_url).await?;

    // Credential Vault
    let cipher = Cipher::from_secret(&config.app_secret_key)?;
    let mut oauth_clients = HashMap::new();
    if let Some(google) = &config.google {
        oauth_clients.insert(
            GMAIL_PROVIDER.to_string(),
            OAuthClient {
                client_id: google.client_id.clone(),
                client_secret: google.client_secret.clone(),
                token_url: google.token_url.clone(),
            },
        );
    } else {
        info!("Google OAuth not configured; inbox monitoring disabled");
    }
    let vault = Arc::new(Vault::new(
        cipher,
        Arc::new(PgCredentialStore::new(db.clone())),
        Arc::new(HttpTokenExchange::new(oauth_clients)?),
    ));

    // Artifacts: S3 when fully configured, local disk otherwise
    let artifacts: Arc<dyn ArtifactStore> = match &config.s3 {
        Some(s3) => {
            info!(bucket = %s3.bucket, "Artifacts stored in S3");
            Arc::new(S3ArtifactStore::new(build_s3_client(s3).await, s3.bucket.clone()))
        }
        None => {
            info!(dir = %config.artifact_dir, "Artifacts stored on local disk");
            Arc::new(LocalArtifactStore::new(&config.artifact_dir))
        }
    };

    // Status sources
    let ats_endpoints: HashMap<PortalFamily, String> = [
        (PortalFamily::Greenhouse, &config.ats_greenhouse_url),
        (PortalFamily::Lever, &config.ats_lever_url),
        (PortalFamily::Workday, &config.ats_workday_url),
    ]
    .into_iter()
    .filter_map(|(family, url)| url.clone().map(|u| (family, u)))
    .collect();
    info!(providers = ats_endpoints.len(), "ATS status endpoints configured");

    let shutdown = CancellationToken::new();
    let engine = Arc::new(Engine::new(
        EngineParts {
            store: Arc::new(PgApplicationStore::new(db.clone())),
            directory: Arc::new(PgDirectory::new(db.clone())),
            vault,
            pages: Arc::new(WebDriverFactory::new(
                config.webdriver_url.clone(),
                config.browser_headless,
            )),
            artifacts,
            ats: Arc::new(HttpAtsProvider::new(ats_endpoints)?),
            inbox: Arc::new(GmailInbox::new(config.gmail_api_base.clone())?),
            bus: EventBus::new(),
        },
        settings(&config),
        shutdown.clone(),
    ));
    let tasks = engine.start().await;
    info!(tasks = tasks.len(), "Background pools started");

    // Build app state
    let state = AppState {
        engine: engine.clone(),
        auth: Authenticator::new(&config.jwt_secret),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine.clone()))
        .await?;

    for task in tasks {
        let _ = task.await;
    }
    info!("Shutdown complete");
    Ok(())
}

fn settings(config: &Config) -> EngineSettings {
    EngineSettings {
        worker: WorkerSettings {
            driver: DriverConfig {
                headless: config.browser_headless,
                captcha_wait: Duration::from_secs(config.captcha_wait_secs),
                action_timeout: Duration::from_secs(config.action_timeout_secs),
                budget: Duration::from_secs(config.submission_budget_secs),
                max_retries: config.driver_max_retries,
                ..DriverConfig::default()
            },
            max_attempts: config.submission_max_attempts,
            retry_base: Duration::from_secs(config.submission_retry_base_secs),
            check_interval_minutes: config.default_check_interval_minutes,
            attempt_log: AttemptLog::new(&config.artifact_dir),
        },
        scheduler: SchedulerSettings {
            tick: Duration::from_secs(config.scheduler_tick_secs),
            concurrency: config.submission_concurrency,
        },
        monitor: MonitorSettings {
            sweep: Duration::from_secs(config.monitor_sweep_secs),
            default_interval_minutes: config.default_check_interval_minutes,
            email_lookback_days: config.email_lookback_days,
            provider_qps: config.monitor_provider_qps,
            ..MonitorSettings::default()
        },
    }
}

/// Resolves on Ctrl-C and cancels every pool.
async fn shutdown_signal(engine: Arc<Engine>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    engine.shutdown();
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(s3: &S3Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &s3.access_key_id,
        &s3.secret_access_key,
        None,
        None,
        "jobpilot-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&s3.endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
