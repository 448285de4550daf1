//! TALLY — Virtual-credit prediction market backend
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens storage, starts the background jobs (ingestion, janitor, daily
//! rewards), and serves the API with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use tally::api;
use tally::config::AppConfig;
use tally::engine::Engine;
use tally::gateway::polymarket::PolymarketClient;
use tally::gateway::PriceSource;
use tally::jobs::JobRunner;
use tally::storage::Storage;

const BANNER: &str = r#"
 _____  _    _     _     __   __
|_   _|/ \  | |   | |    \ \ / /
  | | / _ \ | |   | |     \ V /
  | |/ ___ \| |___| |___   | |
  |_/_/   \_\_____|_____|  |_|

  Virtual-Credit Prediction Markets
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");
    info!(
        port = cfg.server.port,
        database = %cfg.database.url,
        ingestion = cfg.ingestion.enabled,
        jobs = cfg.jobs.enabled,
        "TALLY starting up"
    );

    let storage = Storage::connect(&cfg.database).await?;
    let engine = Engine::new(storage, cfg.economy.clone());

    // -- Background jobs -------------------------------------------------

    let mut runner = if cfg.jobs.enabled && cfg.ingestion.enabled {
        let source: Arc<dyn PriceSource> = Arc::new(PolymarketClient::new(
            &cfg.ingestion.base_url,
            cfg.ingestion.fetch_limit,
        )?);
        let mut runner = JobRunner::new(cfg.jobs.clone(), engine.clone(), source);
        runner.start();
        Some(runner)
    } else {
        info!("Background jobs disabled — serving API only");
        None
    };

    // -- API server ------------------------------------------------------

    tokio::select! {
        result = api::serve(engine, cfg.server.port) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received.");
        }
    }

    if let Some(runner) = runner.as_mut() {
        runner.stop().await;
    }
    info!("TALLY shut down cleanly.");

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tally=info"));

    let json_logging = std::env::var("TALLY_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
