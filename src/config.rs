//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Economy constants (bet bounds, reward curve) are deployment-time
//! configuration with defaults matching the production values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub economy: EconomyConfig,
    pub ingestion: IngestionConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://tally.db`.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Credit-economy constants. All amounts are whole credits.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EconomyConfig {
    /// Credits granted at signup.
    pub starting_credits: u32,
    /// Fixed-odds bet bounds.
    pub min_bet: u32,
    pub max_bet: u32,
    /// Share-trade bounds (credits spent per buy).
    pub min_trade: u32,
    pub max_trade: u32,
    /// Daily reward: `base + (day - 1) * step`, day capped at `streak_cap`,
    /// total capped at `absolute_cap`.
    pub daily_base: u32,
    pub daily_step: u32,
    pub daily_streak_cap: u32,
    pub daily_absolute_cap: u32,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            starting_credits: 1_000,
            min_bet: 10,
            max_bet: 10_000,
            min_trade: 1,
            max_trade: 100_000,
            daily_base: 1_000,
            daily_step: 500,
            daily_streak_cap: 18,
            daily_absolute_cap: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    pub enabled: bool,
    /// Gamma API base URL. Overridable for tests/staging.
    #[serde(default = "default_gamma_url")]
    pub base_url: String,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    pub enabled: bool,
    pub ingest_interval_secs: u64,
    pub janitor_interval_secs: u64,
    pub reward_interval_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_fetch_limit() -> u32 {
    200
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
