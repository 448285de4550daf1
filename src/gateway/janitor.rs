//! Market janitor — closes overdue markets and drives settlement.
//!
//! Each run: expire markets past their deadline, then poll the price
//! source for outcomes of closed-but-unresolved markets and hand any
//! final resolution to the settlement engine. Per-market failures are
//! counted and retried on the next run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{info, warn};

use super::PriceSource;
use crate::engine::Engine;
use crate::storage;

/// How many unresolved markets to poll per run. Keeps one janitor tick
/// bounded regardless of backlog.
const RESOLUTION_BATCH: u32 = 50;

pub struct Janitor {
    engine: Engine,
}

#[derive(Debug, Clone, Default)]
pub struct JanitorReport {
    pub checked_markets: usize,
    pub closed_markets: u64,
    pub resolved_markets: usize,
    pub settled_positions: usize,
    pub settled_bets: usize,
    pub errors: usize,
}

impl fmt::Display for JanitorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked={} closed={} resolved={} positions={} bets={} errors={}",
            self.checked_markets,
            self.closed_markets,
            self.resolved_markets,
            self.settled_positions,
            self.settled_bets,
            self.errors,
        )
    }
}

impl Janitor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn run(&self, source: &dyn PriceSource, now: DateTime<Utc>) -> Result<JanitorReport> {
        let mut report = JanitorReport::default();
        let pool = self.engine.storage().pool();

        {
            let mut conn = pool.acquire().await?;
            report.closed_markets = storage::close_expired_markets(&mut conn, now).await?;
        }

        let unresolved = storage::unresolved_closed_markets(pool, RESOLUTION_BATCH).await?;
        report.checked_markets = unresolved.len();

        for market in unresolved {
            match source.fetch_resolution(&market.source_id).await {
                Ok(Some(resolution)) => {
                    match self.engine.resolve_market(&market.id, resolution, now).await {
                        Ok(settlement) => {
                            report.resolved_markets += 1;
                            report.settled_positions += settlement.positions_settled;
                            report.settled_bets += settlement.bets_settled;
                            report.errors += settlement.errors;
                        }
                        Err(e) => {
                            warn!(market_id = %market.id, error = %e, "Settlement failed");
                            report.errors += 1;
                        }
                    }
                }
                Ok(None) => {} // outcome not final yet
                Err(e) => {
                    warn!(market_id = %market.id, error = %e, "Resolution lookup failed");
                    report.errors += 1;
                }
            }
        }

        if report.closed_markets > 0 || report.resolved_markets > 0 || report.errors > 0 {
            info!(source = source.name(), %report, "Janitor run complete");
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EconomyConfig;
    use crate::engine::positions::BuyShares;
    use crate::gateway::MockPriceSource;
    use crate::storage::Storage;
    use crate::types::{MarketStatus, PositionStatus, Resolution, Side};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn engine() -> Engine {
        let storage = Storage::in_memory().await.unwrap();
        Engine::new(storage, EconomyConfig::default())
    }

    #[tokio::test]
    async fn test_janitor_closes_expired_markets() {
        let engine = engine().await;
        let now = Utc::now();

        let mut market = crate::types::Market {
            id: "m1".to_string(),
            source_id: "0xaaa".to_string(),
            title: "Expired".to_string(),
            this_option: "Yes".to_string(),
            that_option: "No".to_string(),
            this_odds: dec!(0.5),
            that_odds: dec!(0.5),
            liquidity: dec!(100),
            volume: dec!(100),
            status: MarketStatus::Open,
            expires_at: Some(now - Duration::hours(1)),
            resolution: None,
            resolved_at: None,
            updated_at: now,
        };
        {
            let mut conn = engine.storage().pool().acquire().await.unwrap();
            storage::upsert_market(&mut conn, &market).await.unwrap();
        }

        let mut source = MockPriceSource::new();
        // The freshly-closed market gets polled; no outcome yet
        source.expect_fetch_resolution().returning(|_| Ok(None));
        source.expect_name().return_const("mock".to_string());

        let janitor = Janitor::new(engine.clone());
        let report = janitor.run(&source, now).await.unwrap();
        assert_eq!(report.closed_markets, 1);
        assert_eq!(report.resolved_markets, 0);

        market = storage::fetch_market(engine.storage().pool(), "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.status, MarketStatus::Closed);
    }

    #[tokio::test]
    async fn test_janitor_settles_resolved_market() {
        let engine = engine().await;
        let now = Utc::now();

        // Open market with one position, expiring in the past
        crate::engine::testutil::seed_user(&engine, "u1", dec!(1000)).await;
        crate::engine::testutil::seed_market_expiring(
            &engine,
            "m1",
            dec!(0.50),
            Some(now - Duration::minutes(10)),
        )
        .await;
        // Buy before expiry
        let bought = engine
            .buy_shares(
                "u1",
                &BuyShares {
                    market_id: "m1".to_string(),
                    side: Side::This,
                    amount: dec!(100),
                    price: dec!(0.50),
                },
                now - Duration::hours(1),
            )
            .await
            .unwrap();

        let mut source = MockPriceSource::new();
        source
            .expect_fetch_resolution()
            .returning(|_| Ok(Some(Resolution::This)));
        source.expect_name().return_const("mock".to_string());

        let janitor = Janitor::new(engine.clone());
        let report = janitor.run(&source, now).await.unwrap();

        assert_eq!(report.closed_markets, 1);
        assert_eq!(report.resolved_markets, 1);
        assert_eq!(report.settled_positions, 1);
        assert_eq!(report.errors, 0);

        let position = storage::fetch_position(engine.storage().pool(), &bought.position.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.status, PositionStatus::Settled);
        assert_eq!(position.settlement_payout, Some(dec!(200)));

        // Next run finds nothing left to do
        let mut source = MockPriceSource::new();
        source.expect_fetch_resolution().returning(|_| Ok(None));
        source.expect_name().return_const("mock".to_string());
        let report = janitor.run(&source, now).await.unwrap();
        assert_eq!(report.checked_markets, 0);
        assert_eq!(report.resolved_markets, 0);
    }

    #[tokio::test]
    async fn test_source_failure_is_counted_not_fatal() {
        let engine = engine().await;
        let now = Utc::now();

        crate::engine::testutil::seed_market_expiring(
            &engine,
            "m1",
            dec!(0.50),
            Some(now - Duration::minutes(10)),
        )
        .await;

        let mut source = MockPriceSource::new();
        source
            .expect_fetch_resolution()
            .returning(|_| Err(anyhow::anyhow!("feed down")));
        source.expect_name().return_const("mock".to_string());

        let janitor = Janitor::new(engine.clone());
        let report = janitor.run(&source, now).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.resolved_markets, 0);
    }
}
