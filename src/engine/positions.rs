//! Position engine — tradeable shares on a market outcome.
//!
//! Buys accumulate into one position per (user, market, side) with a
//! size-weighted average entry price. Sells realize P&L against that
//! average and close the position once the remainder falls below dust.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;
use uuid::Uuid;

use crate::storage;
use crate::types::{EngineError, Position, PositionStatus, Result, Side, TransactionKind};

use super::ledger::{apply_ledger_update, LedgerUpdate};
use super::{Engine, CONFLICT_RETRIES};

/// Positions with fewer shares than this are treated as empty — selling
/// down to a remainder below dust closes the position outright.
pub const SHARE_DUST: Decimal = dec!(0.0001);

// ---------------------------------------------------------------------------
// Inputs & outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BuyShares {
    pub market_id: String,
    pub side: Side,
    /// Credits to spend.
    pub amount: Decimal,
    /// Current market price, fetched by the caller before the atomic unit.
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct BuyOutcome {
    pub position: Position,
    pub shares_bought: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub position: Position,
    pub proceeds: Decimal,
    pub realized_pnl: Decimal,
    pub new_balance: Decimal,
}

/// Weighted average entry price after adding `new_shares` at `new_price`.
fn weighted_avg_price(
    existing_shares: Decimal,
    existing_avg: Decimal,
    new_shares: Decimal,
    new_price: Decimal,
) -> Decimal {
    let total = existing_shares + new_shares;
    if total.is_zero() {
        return Decimal::ZERO;
    }
    (existing_shares * existing_avg + new_shares * new_price) / total
}

fn validate_price(price: Decimal) -> Result<()> {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Err(EngineError::InvalidPrice(price));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Engine {
    /// Buy shares on one side of a market. `input.price` must come from
    /// the caller's pre-fetched quote so the transactional window stays
    /// short.
    pub async fn buy_shares(
        &self,
        user_id: &str,
        input: &BuyShares,
        now: DateTime<Utc>,
    ) -> Result<BuyOutcome> {
        let min = Decimal::from(self.economy.min_trade);
        let max = Decimal::from(self.economy.max_trade);
        if input.amount < min || input.amount > max {
            return Err(EngineError::TradeAmountOutOfRange { min, max });
        }
        validate_price(input.price)?;

        let mut attempts = 0;
        loop {
            match self.try_buy_shares(user_id, input, now).await {
                Err(EngineError::StorageConflict) if attempts + 1 < CONFLICT_RETRIES => {
                    attempts += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_buy_shares(
        &self,
        user_id: &str,
        input: &BuyShares,
        now: DateTime<Utc>,
    ) -> Result<BuyOutcome> {
        let shares_to_buy = input.amount / input.price;

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

        let existing =
            storage::find_position(&mut *tx, user_id, &input.market_id, input.side).await?;

        let position = match existing {
            Some(mut position) => {
                position.avg_buy_price = weighted_avg_price(
                    position.shares,
                    position.avg_buy_price,
                    shares_to_buy,
                    input.price,
                );
                position.shares += shares_to_buy;
                position.total_invested += input.amount;
                position.status = PositionStatus::Open;
                position.updated_at = now;
                storage::update_position(&mut tx, &position).await?;
                position
            }
            None => {
                let position = Position {
                    id: Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    market_id: input.market_id.clone(),
                    side: input.side,
                    shares: shares_to_buy,
                    avg_buy_price: input.price,
                    total_invested: input.amount,
                    status: PositionStatus::Open,
                    realized_pnl: Decimal::ZERO,
                    settlement_payout: None,
                    settled_at: None,
                    created_at: now,
                    updated_at: now,
                };
                storage::insert_position(&mut tx, &position).await?;
                position
            }
        };

        let update = LedgerUpdate::debit(
            input.amount,
            TransactionKind::PositionBuy,
            Some(position.id.clone()),
        );
        let user = apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        info!(
            user_id,
            position_id = %position.id,
            side = %input.side,
            shares = %shares_to_buy,
            price = %input.price,
            amount = %input.amount,
            "Shares bought"
        );

        Ok(BuyOutcome {
            position,
            shares_bought: shares_to_buy,
            new_balance: user.available_credits,
        })
    }

    /// Sell shares from a position at the caller-supplied current price.
    pub async fn sell_shares(
        &self,
        user_id: &str,
        position_id: &str,
        shares_to_sell: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SellOutcome> {
        validate_price(price)?;
        if shares_to_sell < SHARE_DUST {
            return Err(EngineError::InsufficientShares {
                requested: shares_to_sell,
                held: Decimal::ZERO,
            });
        }

        let mut attempts = 0;
        loop {
            match self
                .try_sell_shares(user_id, position_id, shares_to_sell, price, now)
                .await
            {
                Err(EngineError::StorageConflict) if attempts + 1 < CONFLICT_RETRIES => {
                    attempts += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_sell_shares(
        &self,
        user_id: &str,
        position_id: &str,
        shares_to_sell: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SellOutcome> {
        let mut tx = self.pool().begin().await?;

        let mut position = storage::fetch_position(&mut *tx, position_id)
            .await?
            .ok_or_else(|| EngineError::PositionNotFound(position_id.to_string()))?;
        if position.user_id != user_id {
            return Err(EngineError::NotOwner);
        }
        if position.status != PositionStatus::Open {
            return Err(EngineError::PositionNotOpen(position.id));
        }

        let market = storage::fetch_market(&mut *tx, &position.market_id)
            .await?
            .ok_or_else(|| EngineError::MarketNotFound(position.market_id.clone()))?;
        if !market.is_open() {
            return Err(EngineError::MarketNotOpen(market.id));
        }

        let previous_shares = position.shares;
        if shares_to_sell > previous_shares {
            return Err(EngineError::InsufficientShares {
                requested: shares_to_sell,
                held: previous_shares,
            });
        }

        let proceeds = shares_to_sell * price;
        let cost_basis = shares_to_sell * position.avg_buy_price;
        let realized = proceeds - cost_basis;

        let remaining = previous_shares - shares_to_sell;
        if remaining < SHARE_DUST {
            position.shares = Decimal::ZERO;
            position.total_invested = Decimal::ZERO;
            position.status = PositionStatus::Closed;
        } else {
            // avg_buy_price is unchanged on a partial sale; the cost basis
            // scales with the remaining shares.
            position.total_invested *= remaining / previous_shares;
            position.shares = remaining;
        }
        position.realized_pnl += realized;
        position.updated_at = now;
        storage::update_position(&mut tx, &position).await?;

        let user = storage::fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;
        let update = LedgerUpdate::credit(
            proceeds,
            TransactionKind::PositionSell,
            Some(position.id.clone()),
        )
        .with_volume(proceeds)
        .with_pnl(realized);
        let user = apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        info!(
            user_id,
            position_id = %position.id,
            shares = %shares_to_sell,
            price = %price,
            proceeds = %proceeds,
            realized = %realized,
            "Shares sold"
        );

        Ok(SellOutcome {
            position,
            proceeds,
            realized_pnl: realized,
            new_balance: user.available_credits,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
