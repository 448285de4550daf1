//! Ledger primitives — the single controlled entry point for balance
//! mutation.
//!
//! Every change to `available_credits` goes through [`apply_ledger_update`]
//! inside an open transaction, which enforces non-negativity, bumps the
//! lifetime counters, and writes exactly one audit row per balance change.
//! User creation (signup bonus) and credit-pack grants live here too since
//! they are pure ledger movements.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::storage;
use crate::types::{AuditEntry, EngineError, Result, TransactionKind, User};

use super::{Engine, CONFLICT_RETRIES};

// ---------------------------------------------------------------------------
// Ledger update
// ---------------------------------------------------------------------------

/// One ledger movement: a signed balance delta plus the lifetime-counter
/// bumps that ride along with it.
#[derive(Debug, Clone)]
pub(crate) struct LedgerUpdate {
    /// Signed change to `available_credits`.
    pub delta: Decimal,
    pub kind: TransactionKind,
    pub reference_id: Option<String>,
    /// Added to `total_volume`. Trade notional only — settlement payouts
    /// carry no volume.
    pub volume: Decimal,
    /// Added to `expended_credits`.
    pub expended: Decimal,
    /// Added to `overall_pnl`.
    pub pnl: Decimal,
}

impl LedgerUpdate {
    /// A trade debit: spends `amount`, counting it as exposure and volume.
    pub fn debit(amount: Decimal, kind: TransactionKind, reference_id: Option<String>) -> Self {
        Self {
            delta: -amount,
            kind,
            reference_id,
            volume: amount,
            expended: amount,
            pnl: Decimal::ZERO,
        }
    }

    /// A plain credit: no volume, no exposure, no P&L.
    pub fn credit(amount: Decimal, kind: TransactionKind, reference_id: Option<String>) -> Self {
        Self {
            delta: amount,
            kind,
            reference_id,
            volume: Decimal::ZERO,
            expended: Decimal::ZERO,
            pnl: Decimal::ZERO,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_pnl(mut self, pnl: Decimal) -> Self {
        self.pnl = pnl;
        self
    }
}

/// Apply a ledger movement to a user snapshot read earlier in the same
/// transaction, persist it, and write the paired audit row.
///
/// The caller may have already adjusted non-balance fields on the snapshot
/// (streak counter, reward timestamp) — those are persisted in the same
/// guarded write. The caller must NOT touch the balance fields itself.
///
/// A zero `delta` performs the counter updates without an audit row: the
/// audit trail records balance changes, one row each, nothing else.
pub(crate) async fn apply_ledger_update(
    conn: &mut SqliteConnection,
    mut user: User,
    update: &LedgerUpdate,
    now: DateTime<Utc>,
) -> Result<User> {
    let guard_balance = user.available_credits;
    let new_balance = guard_balance + update.delta;

    if new_balance < Decimal::ZERO {
        return Err(EngineError::InsufficientFunds {
            required: -update.delta,
            available: guard_balance,
        });
    }

    user.available_credits = new_balance;
    user.total_volume += update.volume;
    user.expended_credits += update.expended;
    user.overall_pnl += update.pnl;

    storage::update_user_ledger(conn, &user, guard_balance).await?;

    if update.delta != Decimal::ZERO {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            amount: update.delta,
            kind: update.kind,
            reference_id: update.reference_id.clone(),
            balance_after: new_balance,
            created_at: now,
        };
        storage::insert_audit_entry(conn, &entry).await?;
    }

    Ok(user)
}

// ---------------------------------------------------------------------------
// Signup & purchases
// ---------------------------------------------------------------------------

impl Engine {
    /// Register a user and grant the signup bonus in one atomic unit.
    pub async fn create_user(&self, username: &str, now: DateTime<Utc>) -> Result<User> {
        let username = username.trim();
        if storage::fetch_user_by_username(self.pool(), username)
            .await?
            .is_some()
        {
            return Err(EngineError::UsernameTaken(username.to_string()));
        }

        let starting = Decimal::from(self.economy.starting_credits);
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            available_credits: Decimal::ZERO,
            expended_credits: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            overall_pnl: Decimal::ZERO,
            consecutive_days_online: 0,
            last_daily_reward_at: None,
            created_at: now,
        };

        let mut tx = self.pool().begin().await?;
        // Two signups racing on the same name reach the unique index here
        if let Err(e) = storage::insert_user(&mut tx, &user).await {
            if let EngineError::Storage(sqlx::Error::Database(ref db)) = e {
                if db.message().contains("UNIQUE") {
                    return Err(EngineError::UsernameTaken(user.username));
                }
            }
            return Err(e);
        }
        let update = LedgerUpdate::credit(
            starting,
            TransactionKind::SignupBonus,
            Some(user.id.clone()),
        );
        let user = apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        info!(user_id = %user.id, username = %user.username, credits = %starting, "User registered");
        Ok(user)
    }

    /// Credit a purchased pack. Payment processing happens elsewhere; the
    /// ledger only records the grant. Bounded like a trade amount.
    pub async fn grant_purchase(
        &self,
        user_id: &str,
        amount: Decimal,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let min = Decimal::from(self.economy.min_trade);
        let max = Decimal::from(self.economy.max_trade);
        if amount < min || amount > max {
            return Err(EngineError::TradeAmountOutOfRange { min, max });
        }

        let mut attempts = 0;
        loop {
            match self.try_grant_purchase(user_id, amount, reference_id, now).await {
                Err(EngineError::StorageConflict) if attempts + 1 < CONFLICT_RETRIES => {
                    attempts += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_grant_purchase(
        &self,
        user_id: &str,
        amount: Decimal,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let mut tx = self.pool().begin().await?;
        let user = storage::fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;

        let update = LedgerUpdate::credit(
            amount,
            TransactionKind::Purchase,
            Some(reference_id.to_string()),
        );
        let user = apply_ledger_update(&mut tx, user, &update, now).await?;
        tx.commit().await?;

        info!(user_id, amount = %amount, "Purchase credited");
        Ok(user)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
