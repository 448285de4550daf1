//! Settlement engine — terminal payout computation once a market's
//! outcome is final.
//!
//! A sweep settles every open position and pending bet on the market,
//! each in its own transaction: one entity failing (or losing a write
//! race) never aborts the rest, it is just counted and left for the
//! next sweep. Settling an already-settled entity is a no-op.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

use crate::storage;
use crate::types::{
    BetStatus, EngineError, PositionStatus, Resolution, Result, TransactionKind,
};

use super::ledger::{apply_ledger_update, LedgerUpdate};
use super::Engine;

// ---------------------------------------------------------------------------
// Sweep report
// ---------------------------------------------------------------------------

/// Summary of one settlement sweep over a market.
#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub market_id: String,
    pub resolution: Resolution,
    pub positions_settled: usize,
    pub bets_settled: usize,
    pub total_payout: Decimal,
    pub errors: usize,
}

impl fmt::Display for SettlementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} → {}: {} positions, {} bets, payout={} ({} errors)",
            self.market_id,
            self.resolution,
            self.positions_settled,
            self.bets_settled,
            self.total_payout,
            self.errors,
        )
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

impl Engine {
    /// Record a market's final outcome and settle all open exposure.
    ///
    /// Safe to invoke more than once: the resolution is write-once, and a
    /// repeat sweep finds nothing left to settle. A *different* resolution
    /// for an already-resolved market is rejected.
    pub async fn resolve_market(
        &self,
        market_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SettlementReport> {
        let market = storage::fetch_market(self.pool(), market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(market_id.to_string()))?;

        match market.resolution {
            Some(existing) if existing != resolution => {
                return Err(EngineError::AlreadyResolved(market_id.to_string()));
            }
            Some(_) => {
                // Duplicate invocation with the same outcome, re-sweep.
            }
            None => {
                let mut tx = self.pool().begin().await?;
                storage::record_market_resolution(&mut tx, market_id, resolution, now).await?;
                tx.commit().await?;
            }
        }

        let report = self.settle_market(market_id, resolution, now).await?;
        info!(
            market_id,
            resolution = %resolution,
            positions = report.positions_settled,
            bets = report.bets_settled,
            payout = %report.total_payout,
            errors = report.errors,
            "Market settled"
        );
        Ok(report)
    }

    /// Sweep all open positions and pending bets for a resolved market.
    /// Each entity is an independent atomic unit.
    async fn settle_market(
        &self,
        market_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SettlementReport> {
        let mut report = SettlementReport {
            market_id: market_id.to_string(),
            resolution,
            positions_settled: 0,
            bets_settled: 0,
            total_payout: Decimal::ZERO,
            errors: 0,
        };

        let positions = storage::open_positions_for_market(self.pool(), market_id).await?;
        for position in positions {
            match self.settle_position(&position.id, resolution, now).await {
                Ok(Some(payout)) => {
                    report.positions_settled += 1;
                    report.total_payout += payout;
                }
                Ok(None) => {} // already settled elsewhere
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "Position settlement failed");
                    report.errors += 1;
                }
            }
        }

        let bets = storage::pending_bets_for_market(self.pool(), market_id).await?;
        for bet in bets {
            match self.settle_bet(&bet.id, resolution, now).await {
                Ok(Some(payout)) => {
                    report.bets_settled += 1;
                    report.total_payout += payout;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(bet_id = %bet.id, error = %e, "Bet settlement failed");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Settle one position. Returns the payout, or `None` when the
    /// position was no longer open (idempotent short-circuit).
    async fn settle_position(
        &self,
        position_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let mut tx = self.pool().begin().await?;

        let mut position = storage::fetch_position(&mut *tx, position_id)
            .await?
            .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
        if position.status != PositionStatus::Open {
            return Ok(None);
        }

        let payout = match resolution {
            Resolution::Invalid => position.total_invested,
            _ if resolution.wins(position.side) => position.shares,
            _ => Decimal::ZERO,
        };
        let profit_loss = payout - position.total_invested;

        position.status = PositionStatus::Settled;
        position.settlement_payout = Some(payout);
        position.settled_at = Some(now);
        position.realized_pnl += profit_loss;
        position.updated_at = now;
        storage::update_position(&mut tx, &position).await?;

        let user = storage::fetch_user(&mut *tx, &position.user_id)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(position.user_id.clone()))?;

        // Payouts credit the ledger with an audit row; a zero payout is
        // P&L bookkeeping only.
        let kind = match resolution {
            Resolution::Invalid => TransactionKind::PositionRefund,
            _ => TransactionKind::PositionSettlement,
        };
        let update = LedgerUpdate::credit(payout, kind, Some(position.id.clone()))
            .with_pnl(profit_loss);
        apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        Ok(Some(payout))
    }

    /// Settle one bet. Returns the payout, or `None` when the bet was no
    /// longer pending.
    async fn settle_bet(
        &self,
        bet_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let mut tx = self.pool().begin().await?;

        let bet = storage::fetch_bet(&mut *tx, bet_id)
            .await?
            .ok_or_else(|| EngineError::BetNotFound(bet_id.to_string()))?;
        if bet.status != BetStatus::Pending {
            return Ok(None);
        }

        let (status, payout, kind) = match resolution {
            Resolution::Invalid => (BetStatus::Cancelled, bet.amount, TransactionKind::BetRefund),
            _ if resolution.wins(bet.side) => (
                BetStatus::Won,
                bet.potential_payout,
                TransactionKind::BetSettlement,
            ),
            _ => (BetStatus::Lost, Decimal::ZERO, TransactionKind::BetSettlement),
        };
        // Refunds are P&L-neutral; wins gain payout − stake, losses lose
        // the stake.
        let profit_loss = match status {
            BetStatus::Cancelled => Decimal::ZERO,
            _ => payout - bet.amount,
        };

        let advanced = storage::settle_bet_row(&mut tx, bet_id, status, payout, now).await?;
        if !advanced {
            return Ok(None);
        }

        let user = storage::fetch_user(&mut *tx, &bet.user_id)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(bet.user_id.clone()))?;
        let update =
            LedgerUpdate::credit(payout, kind, Some(bet.id.clone())).with_pnl(profit_loss);
        apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        Ok(Some(payout))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bets::PlaceBet;
    use crate::engine::positions::BuyShares;
    use crate::engine::testutil;
    use crate::storage;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    async fn setup_two_sided_market(engine: &Engine) -> (String, String) {
        testutil::seed_user(engine, "winner", dec!(1000)).await;
        testutil::seed_user(engine, "loser", dec!(1000)).await;
        testutil::seed_market(engine, "m1", dec!(0.50)).await;

        let won = engine
            .buy_shares(
                "winner",
                &BuyShares {
                    market_id: "m1".to_string(),
                    side: Side::This,
                    amount: dec!(100),
                    price: dec!(0.50),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let lost = engine
            .buy_shares(
                "loser",
                &BuyShares {
                    market_id: "m1".to_string(),
                    side: Side::That,
                    amount: dec!(100),
                    price: dec!(0.50),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        (won.position.id, lost.position.id)
    }

    #[tokio::test]
    async fn test_settlement_pays_winners_and_books_losses() {
        let engine = testutil::engine().await;
        let (win_id, lose_id) = setup_two_sided_market(&engine).await;

        let report = engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();

        assert_eq!(report.positions_settled, 2);
        assert_eq!(report.errors, 0);
        // Winner holds 200 shares → payout 200 (1 credit per share)
        assert_eq!(report.total_payout, dec!(200));

        let win = storage::fetch_position(engine.pool(), &win_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(win.status, PositionStatus::Settled);
        assert_eq!(win.settlement_payout, Some(dec!(200)));
        assert_eq!(win.realized_pnl, dec!(100));

        let lose = storage::fetch_position(engine.pool(), &lose_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lose.status, PositionStatus::Settled);
        assert_eq!(lose.settlement_payout, Some(Decimal::ZERO));
        assert_eq!(lose.realized_pnl, dec!(-100));

        // Winner: 1000 − 100 + 200 = 1100. Loser: 1000 − 100 = 900.
        let winner = storage::fetch_user(engine.pool(), "winner").await.unwrap().unwrap();
        let loser = storage::fetch_user(engine.pool(), "loser").await.unwrap().unwrap();
        assert_eq!(winner.available_credits, dec!(1100));
        assert_eq!(winner.overall_pnl, dec!(100));
        assert_eq!(loser.available_credits, dec!(900));
        assert_eq!(loser.overall_pnl, dec!(-100));

        // Loser gets no settlement audit row (zero payout), winner gets one
        let winner_history = storage::audit_history(engine.pool(), "winner", None, None)
            .await
            .unwrap();
        assert!(winner_history
            .iter()
            .any(|e| e.kind == TransactionKind::PositionSettlement));
        let loser_history = storage::audit_history(engine.pool(), "loser", None, None)
            .await
            .unwrap();
        assert!(!loser_history
            .iter()
            .any(|e| e.kind == TransactionKind::PositionSettlement));
    }

    #[tokio::test]
    async fn test_invalid_resolution_refunds_cost_basis() {
        let engine = testutil::engine().await;
        let (win_id, lose_id) = setup_two_sided_market(&engine).await;

        let report = engine
            .resolve_market("m1", Resolution::Invalid, Utc::now())
            .await
            .unwrap();

        // Both sides refunded their invested 100
        assert_eq!(report.total_payout, dec!(200));

        for (user_id, position_id) in [("winner", &win_id), ("loser", &lose_id)] {
            let user = storage::fetch_user(engine.pool(), user_id).await.unwrap().unwrap();
            assert_eq!(user.available_credits, dec!(1000));
            assert_eq!(user.overall_pnl, Decimal::ZERO);

            let position = storage::fetch_position(engine.pool(), position_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(position.settlement_payout, Some(dec!(100)));

            let history = storage::audit_history(engine.pool(), user_id, None, None)
                .await
                .unwrap();
            assert!(history.iter().any(|e| e.kind == TransactionKind::PositionRefund));
        }
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let engine = testutil::engine().await;
        setup_two_sided_market(&engine).await;

        engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        let winner_before = storage::fetch_user(engine.pool(), "winner")
            .await
            .unwrap()
            .unwrap();
        let audit_before = storage::audit_history(engine.pool(), "winner", None, None)
            .await
            .unwrap()
            .len();

        // Second sweep with the same resolution: no double payout
        let report = engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.positions_settled, 0);
        assert_eq!(report.total_payout, Decimal::ZERO);

        let winner_after = storage::fetch_user(engine.pool(), "winner")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner_after.available_credits, winner_before.available_credits);
        let audit_after = storage::audit_history(engine.pool(), "winner", None, None)
            .await
            .unwrap()
            .len();
        assert_eq!(audit_after, audit_before);
    }

    #[tokio::test]
    async fn test_conflicting_resolution_rejected() {
        let engine = testutil::engine().await;
        setup_two_sided_market(&engine).await;

        engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        let err = engine
            .resolve_market("m1", Resolution::That, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn test_closed_positions_are_not_settled() {
        let engine = testutil::engine().await;
        testutil::seed_user(&engine, "u1", dec!(1000)).await;
        testutil::seed_market(&engine, "m1", dec!(0.50)).await;

        let bought = engine
            .buy_shares(
                "u1",
                &BuyShares {
                    market_id: "m1".to_string(),
                    side: Side::This,
                    amount: dec!(100),
                    price: dec!(0.50),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        // Liquidate before resolution
        engine
            .sell_shares("u1", &bought.position.id, dec!(200), dec!(0.55), Utc::now())
            .await
            .unwrap();

        let report = engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.positions_settled, 0);

        let position = storage::fetch_position(engine.pool(), &bought.position.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert!(position.settlement_payout.is_none());
    }

    #[tokio::test]
    async fn test_bet_settlement_outcomes() {
        let engine = testutil::engine().await;
        testutil::seed_user(&engine, "u1", dec!(1000)).await;
        testutil::seed_user(&engine, "u2", dec!(1000)).await;
        testutil::seed_market(&engine, "m1", dec!(0.40)).await;

        let won = engine
            .place_bet(
                "u1",
                &PlaceBet {
                    market_id: "m1".to_string(),
                    side: Side::This,
                    amount: dec!(100),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let lost = engine
            .place_bet(
                "u2",
                &PlaceBet {
                    market_id: "m1".to_string(),
                    side: Side::That,
                    amount: dec!(100),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let report = engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.bets_settled, 2);
        // Won bet pays amount / odds = 100 / 0.40 = 250
        assert_eq!(report.total_payout, dec!(250));

        let won_bet = storage::fetch_bet(engine.pool(), &won.bet.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(won_bet.status, BetStatus::Won);
        assert_eq!(won_bet.actual_payout, Some(dec!(250)));

        let lost_bet = storage::fetch_bet(engine.pool(), &lost.bet.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lost_bet.status, BetStatus::Lost);
        assert_eq!(lost_bet.actual_payout, Some(Decimal::ZERO));

        let u1 = storage::fetch_user(engine.pool(), "u1").await.unwrap().unwrap();
        assert_eq!(u1.available_credits, dec!(1150));
        assert_eq!(u1.overall_pnl, dec!(150));
        let u2 = storage::fetch_user(engine.pool(), "u2").await.unwrap().unwrap();
        assert_eq!(u2.available_credits, dec!(900));
        assert_eq!(u2.overall_pnl, dec!(-100));
    }

    #[tokio::test]
    async fn test_invalid_resolution_cancels_bets_with_refund() {
        let engine = testutil::engine().await;
        testutil::seed_user(&engine, "u1", dec!(1000)).await;
        testutil::seed_market(&engine, "m1", dec!(0.40)).await;

        let placed = engine
            .place_bet(
                "u1",
                &PlaceBet {
                    market_id: "m1".to_string(),
                    side: Side::This,
                    amount: dec!(100),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        engine
            .resolve_market("m1", Resolution::Invalid, Utc::now())
            .await
            .unwrap();

        let bet = storage::fetch_bet(engine.pool(), &placed.bet.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bet.status, BetStatus::Cancelled);
        assert_eq!(bet.actual_payout, Some(dec!(100)));

        let user = storage::fetch_user(engine.pool(), "u1").await.unwrap().unwrap();
        assert_eq!(user.available_credits, dec!(1000));
        assert_eq!(user.overall_pnl, Decimal::ZERO);

        let history = storage::audit_history(engine.pool(), "u1", None, None)
            .await
            .unwrap();
        assert!(history.iter().any(|e| e.kind == TransactionKind::BetRefund));
    }

    #[tokio::test]
    async fn test_settlement_conservation() {
        // Sum of winning-side payouts equals the sum of winning-side shares
        let engine = testutil::engine().await;
        testutil::seed_market(&engine, "m1", dec!(0.25)).await;

        let mut expected_shares = Decimal::ZERO;
        for (i, amount) in [dec!(50), dec!(75), dec!(120)].iter().enumerate() {
            let id = format!("u{i}");
            testutil::seed_user(&engine, &id, dec!(1000)).await;
            let outcome = engine
                .buy_shares(
                    &id,
                    &BuyShares {
                        market_id: "m1".to_string(),
                        side: Side::This,
                        amount: *amount,
                        price: dec!(0.25),
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            expected_shares += outcome.shares_bought;
        }

        let report = engine
            .resolve_market("m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.total_payout, expected_shares);
    }

    #[tokio::test]
    async fn test_report_display() {
        let report = SettlementReport {
            market_id: "m1".to_string(),
            resolution: Resolution::That,
            positions_settled: 3,
            bets_settled: 1,
            total_payout: dec!(420),
            errors: 0,
        };
        let display = format!("{report}");
        assert!(display.contains("m1"));
        assert!(display.contains("that"));
        assert!(display.contains("420"));
    }
}
