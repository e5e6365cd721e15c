//! Reachout daemon - campaign engine plus webhook receiver in one process.
//!
//! The engine owns the account pool and campaign scheduler loops; the axum
//! server feeds inbound platform events to the reply correlator. A campaign
//! can be bootstrapped straight from a sheet via `CAMPAIGN_SHEET_ID`; the
//! rest of campaign CRUD belongs to the external control surface.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reachout::model::RotationStrategy;
use reachout::source::SheetSource;
use reachout::web::{router, AppState};
use reachout::{Config, Engine, SchedulePolicy};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("daemon_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        webdriver_url = %config.webdriver_url,
        concurrency = config.concurrency,
        port = config.port,
        verify_token_configured = config.verify_token.is_some(),
        app_secret_configured = config.app_secret.is_some(),
        "config_loaded"
    );

    let accounts = config.load_accounts()?;
    let proxies = config.load_proxies()?;
    info!(
        accounts = accounts.len(),
        proxies = proxies.len(),
        "inventories_loaded"
    );

    let engine = Engine::new(config.clone(), accounts, proxies);

    // Optional standalone mode: run one campaign straight from a sheet.
    if let Ok(sheet_id) = env::var("CAMPAIGN_SHEET_ID") {
        bootstrap_campaign(&engine, &config, &sheet_id).await?;
    }

    // Webhook server
    let state = AppState {
        verify_token: config.verify_token.clone(),
        app_secret: config.app_secret.clone(),
        replies: engine.reply_sender(),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "webhook_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain running campaigns before exiting.
    engine.shutdown().await;

    info!("daemon_shutdown_complete");

    Ok(())
}

/// Create and start a campaign from `CAMPAIGN_*` environment variables.
async fn bootstrap_campaign(engine: &Arc<Engine>, config: &Config, sheet_id: &str) -> Result<()> {
    let tab = env::var("CAMPAIGN_SHEET_TAB").unwrap_or_else(|_| "Sheet1".to_string());
    let status_column = env::var("CAMPAIGN_STATUS_COLUMN").unwrap_or_else(|_| "C".to_string());
    let name = env::var("CAMPAIGN_NAME").unwrap_or_else(|_| "default".to_string());
    let platform = env::var("CAMPAIGN_PLATFORM").unwrap_or_else(|_| "instagram".to_string());

    let policy = SchedulePolicy {
        start_at: None,
        max_per_day: env::var("CAMPAIGN_MAX_PER_DAY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50),
        delay_between_ms: env::var("CAMPAIGN_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(45_000),
        rotation: RotationStrategy::RoundRobin,
    };

    let source = Arc::new(SheetSource::new(
        sheet_id,
        &tab,
        config.sheets_api_key.clone(),
        &status_column,
    ));

    let (campaign_id, summary) = engine
        .create_campaign(&name, &platform, policy, source, None)
        .await
        .context("Failed to bootstrap campaign from sheet")?;

    info!(
        campaign_id = %campaign_id,
        committed = summary.committed,
        skipped_invalid = summary.skipped_invalid,
        deduped = summary.deduped,
        "campaign_bootstrapped"
    );

    engine.start(&campaign_id)?;
    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("daemon_shutting_down");
}
