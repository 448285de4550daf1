//! Market gateway — the boundary between the accounting core and the
//! external price source.
//!
//! Defines the `PriceSource` trait plus the ingestion and janitor
//! collaborators that keep local markets in sync with the feed. The core
//! never calls the source inside an atomic unit; quotes flow in here and
//! are passed to operations as plain parameters.

pub mod ingest;
pub mod janitor;
pub mod polymarket;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use rust_decimal::Decimal;

use crate::types::Resolution;

/// A normalized market quote from the external feed.
#[derive(Debug, Clone)]
pub struct MarketQuote {
    /// External condition id — stable across fetches.
    pub source_id: String,
    pub title: String,
    pub this_option: String,
    pub that_option: String,
    /// Probabilities in (0, 1) for each outcome.
    pub this_odds: Decimal,
    pub that_odds: Decimal,
    /// The only reliable liveness indicator the feed offers.
    pub accepting_orders: bool,
    pub archived: bool,
    pub liquidity: Decimal,
    pub volume: Decimal,
    pub end_date: Option<DateTime<Utc>>,
}

/// Abstraction over the external market-price feed.
///
/// Implementors provide market quotes and terminal outcomes; they never
/// touch local state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch current quotes for tradeable markets.
    async fn fetch_markets(&self) -> Result<Vec<MarketQuote>>;

    /// Look up the terminal outcome of a market, if the source has one.
    async fn fetch_resolution(&self, source_id: &str) -> Result<Option<Resolution>>;

    /// Source name for logging.
    fn name(&self) -> &str;
}
