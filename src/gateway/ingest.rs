//! Market ingestion — pulls quotes from the price source and upserts
//! local market rows.
//!
//! Ingestion owns status and odds; it never touches resolutions, and a
//! resolved market keeps its terminal state no matter what the feed
//! reports afterwards (enforced by the storage upsert).

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use super::{MarketQuote, PriceSource};
use crate::storage::{self, Storage};
use crate::types::{Market, MarketStatus};

#[derive(Clone)]
pub struct Ingestor {
    storage: Storage,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub fetched: usize,
    pub saved: usize,
    pub errors: usize,
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} saved={} errors={}",
            self.fetched, self.saved, self.errors,
        )
    }
}

/// Map feed flags to a local lifecycle status. `accepting_orders` is the
/// authoritative liveness signal.
fn status_for(quote: &MarketQuote) -> MarketStatus {
    if quote.archived {
        MarketStatus::Archived
    } else if quote.accepting_orders {
        MarketStatus::Open
    } else {
        MarketStatus::Closed
    }
}

fn quote_to_market(quote: &MarketQuote, now: DateTime<Utc>) -> Market {
    Market {
        id: Uuid::new_v4().to_string(),
        source_id: quote.source_id.clone(),
        title: quote.title.clone(),
        this_option: quote.this_option.clone(),
        that_option: quote.that_option.clone(),
        this_odds: quote.this_odds,
        that_odds: quote.that_odds,
        liquidity: quote.liquidity,
        volume: quote.volume,
        status: status_for(quote),
        expires_at: quote.end_date,
        resolution: None,
        resolved_at: None,
        updated_at: now,
    }
}

impl Ingestor {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Fetch current quotes and upsert them. One bad row doesn't abort
    /// the batch.
    pub async fn run(&self, source: &dyn PriceSource, now: DateTime<Utc>) -> Result<IngestReport> {
        let quotes = source.fetch_markets().await?;
        let fetched = quotes.len();

        let mut saved = 0;
        let mut errors = 0;
        let mut conn = self.storage.pool().acquire().await?;

        for quote in &quotes {
            let market = quote_to_market(quote, now);
            match storage::upsert_market(&mut conn, &market).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!(source_id = %quote.source_id, error = %e, "Market upsert failed");
                    errors += 1;
                }
            }
        }

        let report = IngestReport {
            fetched,
            saved,
            errors,
        };
        info!(source = source.name(), %report, "Ingestion complete");
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPriceSource;
    use rust_decimal_macros::dec;

    fn quote(source_id: &str, this_odds: rust_decimal::Decimal, accepting: bool) -> MarketQuote {
        MarketQuote {
            source_id: source_id.to_string(),
            title: format!("Market {source_id}"),
            this_option: "Yes".to_string(),
            that_option: "No".to_string(),
            this_odds,
            that_odds: rust_decimal::Decimal::ONE - this_odds,
            accepting_orders: accepting,
            archived: false,
            liquidity: dec!(1000),
            volume: dec!(100),
            end_date: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_creates_and_updates_markets() {
        let storage = Storage::in_memory().await.unwrap();
        let ingestor = Ingestor::new(storage.clone());

        let mut source = MockPriceSource::new();
        source
            .expect_fetch_markets()
            .returning(|| Ok(vec![quote("0xaaa", dec!(0.40), true)]));
        source.expect_name().return_const("mock".to_string());

        let report = ingestor.run(&source, Utc::now()).await.unwrap();
        assert_eq!(report.saved, 1);
        assert_eq!(report.errors, 0);

        let market = storage::fetch_market_by_source(storage.pool(), "0xaaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.this_odds, dec!(0.40));
        let original_id = market.id.clone();

        // Second tick with moved odds updates the same row
        let mut source = MockPriceSource::new();
        source
            .expect_fetch_markets()
            .returning(|| Ok(vec![quote("0xaaa", dec!(0.70), true)]));
        source.expect_name().return_const("mock".to_string());
        ingestor.run(&source, Utc::now()).await.unwrap();

        let market = storage::fetch_market_by_source(storage.pool(), "0xaaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.this_odds, dec!(0.70));
        assert_eq!(market.id, original_id);
    }

    #[tokio::test]
    async fn test_feed_flags_map_to_status() {
        let open = quote("a", dec!(0.5), true);
        assert_eq!(status_for(&open), MarketStatus::Open);

        let closed = quote("a", dec!(0.5), false);
        assert_eq!(status_for(&closed), MarketStatus::Closed);

        let mut archived = quote("a", dec!(0.5), true);
        archived.archived = true;
        assert_eq!(status_for(&archived), MarketStatus::Archived);
    }

    #[tokio::test]
    async fn test_market_no_longer_accepting_closes() {
        let storage = Storage::in_memory().await.unwrap();
        let ingestor = Ingestor::new(storage.clone());

        let mut source = MockPriceSource::new();
        source
            .expect_fetch_markets()
            .returning(|| Ok(vec![quote("0xaaa", dec!(0.40), true)]));
        source.expect_name().return_const("mock".to_string());
        ingestor.run(&source, Utc::now()).await.unwrap();

        let mut source = MockPriceSource::new();
        source
            .expect_fetch_markets()
            .returning(|| Ok(vec![quote("0xaaa", dec!(0.40), false)]));
        source.expect_name().return_const("mock".to_string());
        ingestor.run(&source, Utc::now()).await.unwrap();

        let market = storage::fetch_market_by_source(storage.pool(), "0xaaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.status, MarketStatus::Closed);
    }
}
