//! wapush-gateway: WhatsApp campaign gateway binary
//!
//! Usage:
//!   wapush-gateway                  - Start the HTTP API and campaign scheduler
//!   wapush-gateway --config <path>  - Load a specific TOML config file
//!   wapush-gateway --help           - Show help

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use wapush_api::AppState;
use wapush_campaign::DispatchEngine;
use wapush_core::{Config, Store};
use wapush_schedule::CampaignScheduler;
use wapush_whatsapp::CloudApiClient;

/// Run mode
enum RunMode {
    /// Server mode with an optional config file path
    Server(Option<String>),
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args()?;

    let config_path = match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("wapush-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        RunMode::Server(path) => path,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = match config_path {
        Some(path) => Config::from_toml_file(&path),
        None => Config::load(),
    }
    .map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    tracing::info!("Starting wapush-gateway...");
    run_server(config).await
}

/// Parse command line arguments
fn parse_args() -> anyhow::Result<RunMode> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(RunMode::Help),
            "--version" | "-v" => return Ok(RunMode::Version),
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config_path = Some(path);
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
    }

    Ok(RunMode::Server(config_path))
}

/// Print help message
fn print_help() {
    println!("wapush-gateway - WhatsApp campaign gateway");
    println!();
    println!("Usage:");
    println!("  wapush-gateway                  Start the HTTP API and scheduler");
    println!("  wapush-gateway --config <path>  Load a TOML config file (default: ./wapush.toml)");
    println!("  wapush-gateway --help           Show this help message");
    println!("  wapush-gateway --version        Show version");
    println!();
    println!("Environment Variables:");
    println!("  API_PORT                 HTTP API port (default: 3000)");
    println!("  API_KEY                  Bearer token required on /api routes");
    println!("  CLOUD_VERIFY_TOKEN       Cloud API webhook verification token");
    println!("  DATABASE_PATH            SQLite path (default: data/wapush.db)");
    println!("  WEBHOOK_URL              Legacy inbound-message webhook");
    println!("  CAMPAIGN_PACING_MS       Delay between campaign sends (default: 100)");
    println!("  SCHEDULER_ENABLED        Run the campaign scheduler (default: true)");
    println!("  SCHEDULER_INTERVAL_SECS  Scheduler tick interval (default: 60)");
    println!("  CLOUD_API_BASE_URL       Cloud API endpoint");
}

/// Wire the store, dispatch engine, scheduler and HTTP API together
async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store = Store::new(&config.database.db_path)
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?
        .shared();

    let cloud = CloudApiClient::new(&config.cloud_api, config.campaign.send_timeout())
        .map_err(|e| anyhow::anyhow!("Failed to create Cloud API client: {}", e))?;
    let engine = Arc::new(DispatchEngine::new(
        store.clone(),
        Arc::new(cloud),
        &config.campaign,
    ));

    // Start campaign scheduler
    let scheduler = if config.scheduler.enabled {
        let handle = CampaignScheduler::new(Arc::clone(&engine), &config.scheduler).start();
        tracing::info!(
            "Campaign scheduler started (every {}s)",
            config.scheduler.interval_secs
        );
        Some(handle)
    } else {
        tracing::info!("Campaign scheduler disabled");
        None
    };

    // No device transport ships with the gateway, so session routes stay off
    tracing::info!("Session management disabled (no device transport configured)");
    let state = AppState {
        config: Arc::clone(&config),
        store,
        engine,
        sessions: None,
    };

    // Start HTTP API server
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let api_port = config.api.port;
    let server = tokio::spawn(async move {
        let shutdown = async move {
            shutdown_rx.await.ok();
        };
        if let Err(e) = wapush_api::start_server(state, shutdown).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });
    tracing::info!("HTTP API server started on port {}", api_port);

    tracing::info!("wapush-gateway initialized successfully");
    tracing::info!("Press Ctrl+C to exit");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        tracing::warn!("HTTP API task ended abnormally: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
