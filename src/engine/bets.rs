//! Bet engine — fixed-odds single-shot wagers.
//!
//! Odds are snapshotted at placement and never move with the market.
//! A bet stays `pending` until the settlement engine resolves it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::storage;
use crate::types::{Bet, BetStatus, EngineError, Result, Side, TransactionKind};

use super::ledger::{apply_ledger_update, LedgerUpdate};
use super::{Engine, CONFLICT_RETRIES};

#[derive(Debug, Clone)]
pub struct PlaceBet {
    pub market_id: String,
    pub side: Side,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct PlaceBetOutcome {
    pub bet: Bet,
    pub new_balance: Decimal,
}

impl Engine {
    /// Place a fixed-odds wager at the market's current probability for
    /// the chosen side.
    pub async fn place_bet(
        &self,
        user_id: &str,
        input: &PlaceBet,
        now: DateTime<Utc>,
    ) -> Result<PlaceBetOutcome> {
        let min = Decimal::from(self.economy.min_bet);
        let max = Decimal::from(self.economy.max_bet);
        if input.amount < min || input.amount > max {
            return Err(EngineError::BetAmountOutOfRange { min, max });
        }

        let mut attempts = 0;
        loop {
            match self.try_place_bet(user_id, input, now).await {
                Err(EngineError::StorageConflict) if attempts + 1 < CONFLICT_RETRIES => {
                    attempts += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_place_bet(
        &self,
        user_id: &str,
        input: &PlaceBet,
        now: DateTime<Utc>,
    ) -> Result<PlaceBetOutcome> {
        let mut tx = self.pool().begin().await?;

        let user = storage::fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;
        if user.available_credits < input.amount {
            return Err(EngineError::InsufficientFunds {
                required: input.amount,
                available: user.available_credits,
            });
        }

        let market = storage::fetch_market(&mut *tx, &input.market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(input.market_id.clone()))?;
        if !market.is_open() {
            return Err(EngineError::MarketNotOpen(market.id));
        }
        if market.is_expired(now) {
            return Err(EngineError::MarketExpired(market.id));
        }

        let odds = market.odds_for(input.side);
        if odds <= Decimal::ZERO || odds > Decimal::ONE {
            return Err(EngineError::InvalidOdds(odds));
        }
        let potential_payout = input.amount / odds;

        let bet = Bet {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            market_id: market.id.clone(),
            side: input.side,
            amount: input.amount,
            odds_at_bet: odds,
            potential_payout,
            status: BetStatus::Pending,
            actual_payout: None,
            placed_at: now,
            settled_at: None,
        };
        storage::insert_bet(&mut tx, &bet).await?;

        let update = LedgerUpdate::debit(
            input.amount,
            TransactionKind::BetPlaced,
            Some(bet.id.clone()),
        );
        let user = apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        info!(
            user_id,
            bet_id = %bet.id,
            market_id = %bet.market_id,
            side = %bet.side,
            amount = %bet.amount,
            odds = %odds,
            payout = %potential_payout,
            "Bet placed"
        );

        Ok(PlaceBetOutcome {
            bet,
            new_balance: user.available_credits,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
