//! Daily reward engine — streak-aware credit issuance with a 24-hour
//! cooldown.
//!
//! The award grows 500 credits per consecutive day from a 1000 base,
//! capped at the day-18 value, with an absolute ceiling on top. A gap of
//! two days or more resets the streak.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::config::EconomyConfig;
use crate::storage;
use crate::types::{EngineError, Result, TransactionKind};

use super::ledger::{apply_ledger_update, LedgerUpdate};
use super::{Engine, CONFLICT_RETRIES};

const COOLDOWN_HOURS: i64 = 24;
const STREAK_WINDOW_HOURS: i64 = 48;

#[derive(Debug, Clone)]
pub struct RewardOutcome {
    /// Zero when the claim was inside the cooldown window.
    pub credits_awarded: Decimal,
    pub consecutive_days: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub new_balance: Decimal,
}

/// Award for the given streak day. Pure.
pub fn reward_for_day(day: u32, economy: &EconomyConfig) -> Decimal {
    let day = day.clamp(1, economy.daily_streak_cap);
    let amount = economy.daily_base + (day - 1) * economy.daily_step;
    Decimal::from(amount.min(economy.daily_absolute_cap))
}

impl Engine {
    /// Claim the daily reward. Inside the cooldown this is a no-op that
    /// reports zero credits and the next-eligible instant.
    pub async fn claim_daily_reward(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RewardOutcome> {
        let mut attempts = 0;
        loop {
            match self.try_claim_daily_reward(user_id, now).await {
                Err(EngineError::StorageConflict) if attempts + 1 < CONFLICT_RETRIES => {
                    attempts += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_claim_daily_reward(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RewardOutcome> {
        let mut tx = self.pool().begin().await?;

        let mut user = storage::fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;

        if let Some(last) = user.last_daily_reward_at {
            if now - last < Duration::hours(COOLDOWN_HOURS) {
                return Ok(RewardOutcome {
                    credits_awarded: Decimal::ZERO,
                    consecutive_days: user.consecutive_days_online,
                    next_eligible_at: last + Duration::hours(COOLDOWN_HOURS),
                    new_balance: user.available_credits,
                });
            }
        }

        let day = match user.last_daily_reward_at {
            Some(last) if now - last < Duration::hours(STREAK_WINDOW_HOURS) => {
                user.consecutive_days_online + 1
            }
            _ => 1, // first claim, or streak broken
        };
        let award = reward_for_day(day, &self.economy);

        user.consecutive_days_online = day;
        user.last_daily_reward_at = Some(now);

        let update = LedgerUpdate::credit(award, TransactionKind::DailyReward, None);
        let user = apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        info!(
            user_id,
            day,
            award = %award,
            balance = %user.available_credits,
            "Daily reward claimed"
        );

        Ok(RewardOutcome {
            credits_awarded: award,
            consecutive_days: day,
            next_eligible_at: now + Duration::hours(COOLDOWN_HOURS),
            new_balance: user.available_credits,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
