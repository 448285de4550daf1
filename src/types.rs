//! Shared types for the TALLY backend.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that storage, engine, gateway,
//! and API modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Sides & resolutions
// ---------------------------------------------------------------------------

/// One of the two named outcomes of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    This,
    That,
}

impl Side {
    /// The opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::This => Side::That,
            Side::That => Side::This,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::This => "this",
            Side::That => "that",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "this" => Ok(Side::This),
            "that" => Ok(Side::That),
            _ => Err(anyhow::anyhow!("Unknown side: {s}")),
        }
    }
}

/// Terminal outcome of a market. `Invalid` voids all exposure (full refund).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    This,
    That,
    Invalid,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::This => "this",
            Resolution::That => "that",
            Resolution::Invalid => "invalid",
        }
    }

    /// Whether a wager on `side` wins under this resolution.
    pub fn wins(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Resolution::This, Side::This) | (Resolution::That, Side::That)
        )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "this" => Ok(Resolution::This),
            "that" => Ok(Resolution::That),
            "invalid" => Ok(Resolution::Invalid),
            _ => Err(anyhow::anyhow!("Unknown resolution: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// Lifecycle status of a market. Only `Open` markets accept wagers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Archived,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MarketStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(MarketStatus::Open),
            "closed" => Ok(MarketStatus::Closed),
            "archived" => Ok(MarketStatus::Archived),
            _ => Err(anyhow::anyhow!("Unknown market status: {s}")),
        }
    }
}

/// A binary-outcome market, priced by the ingestion gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    /// External condition id from the price source (unique).
    pub source_id: String,
    pub title: String,
    pub this_option: String,
    pub that_option: String,
    /// Current probability (0–1) for each side, updated by ingestion.
    pub this_odds: Decimal,
    pub that_odds: Decimal,
    pub liquidity: Decimal,
    pub volume: Decimal,
    pub status: MarketStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    /// Current odds for the given side.
    pub fn odds_for(&self, side: Side) -> Decimal {
        match side {
            Side::This => self.this_odds,
            Side::That => self.that_odds,
        }
    }

    /// Whether the market's expiry has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}: {:.0}¢ | {}: {:.0}¢ | {})",
            self.status,
            self.title,
            self.this_option,
            self.this_odds * Decimal::from(100),
            self.that_option,
            self.that_odds * Decimal::from(100),
            self.id,
        )
    }
}

// ---------------------------------------------------------------------------
// User ledger
// ---------------------------------------------------------------------------

/// A user's ledger snapshot. `available_credits` is the single
/// authoritative balance field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    /// Liquid, spendable credits. Never negative.
    pub available_credits: Decimal,
    /// Lifetime credits moved into open exposure.
    pub expended_credits: Decimal,
    /// Lifetime notional traded.
    pub total_volume: Decimal,
    /// Lifetime realized profit/loss. May be negative.
    pub overall_pnl: Decimal,
    pub consecutive_days_online: u32,
    pub last_daily_reward_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Legacy accessor. Older clients read a `creditBalance` field that
    /// mirrored `available_credits`; the mirror is collapsed and this is
    /// the only remaining spelling of it.
    pub fn credit_balance(&self) -> Decimal {
        self.available_credits
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | balance={} | volume={} | pnl={} | streak={}d",
            self.username,
            self.available_credits,
            self.total_volume,
            self.overall_pnl,
            self.consecutive_days_online,
        )
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Settled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Settled => "settled",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            "settled" => Ok(PositionStatus::Settled),
            _ => Err(anyhow::anyhow!("Unknown position status: {s}")),
        }
    }
}

/// A tradeable share position on one side of a market.
/// Unique per (user, market, side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: String,
    pub market_id: String,
    pub side: Side,
    pub shares: Decimal,
    /// Size-weighted average entry price, in (0, 1).
    pub avg_buy_price: Decimal,
    /// Cost basis: credits committed to the open shares.
    pub total_invested: Decimal,
    pub status: PositionStatus,
    /// Cumulative realized P&L from sales and settlement.
    pub realized_pnl: Decimal,
    pub settlement_payout: Option<Decimal>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized P&L at the given market price. Pure; no mutation.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        self.shares * (current_price - self.avg_buy_price)
    }

    /// Payout if the market resolves in this position's favor.
    /// Each winning share redeems for exactly 1 credit.
    pub fn potential_payout(&self) -> Decimal {
        self.shares
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} shares={} avg={:.2}¢ invested={} pnl={}",
            self.status,
            self.side,
            self.market_id,
            self.shares,
            self.avg_buy_price * Decimal::from(100),
            self.total_invested,
            self.realized_pnl,
        )
    }
}

// ---------------------------------------------------------------------------
// Bet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
    Cancelled,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
            BetStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BetStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BetStatus::Pending),
            "won" => Ok(BetStatus::Won),
            "lost" => Ok(BetStatus::Lost),
            "cancelled" => Ok(BetStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Unknown bet status: {s}")),
        }
    }
}

/// A fixed-odds single-shot wager. Odds are frozen at placement;
/// only the settlement engine transitions status afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub user_id: String,
    pub market_id: String,
    pub side: Side,
    pub amount: Decimal,
    /// Market probability for the chosen side at placement, in (0, 1].
    pub odds_at_bet: Decimal,
    /// `amount / odds_at_bet`.
    pub potential_payout: Decimal,
    pub status: BetStatus,
    pub actual_payout: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} @ {:.2}¢ → {} ({})",
            self.status,
            self.amount,
            self.side,
            self.odds_at_bet * Decimal::from(100),
            self.potential_payout,
            self.market_id,
        )
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// What moved the credits. Persisted as a stable snake_case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    SignupBonus,
    Purchase,
    BetPlaced,
    BetSettlement,
    BetRefund,
    PositionBuy,
    PositionSell,
    PositionSettlement,
    PositionRefund,
    DailyReward,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::SignupBonus => "signup_bonus",
            TransactionKind::Purchase => "purchase",
            TransactionKind::BetPlaced => "bet_placed",
            TransactionKind::BetSettlement => "bet_settlement",
            TransactionKind::BetRefund => "bet_refund",
            TransactionKind::PositionBuy => "position_buy",
            TransactionKind::PositionSell => "position_sell",
            TransactionKind::PositionSettlement => "position_settlement",
            TransactionKind::PositionRefund => "position_refund",
            TransactionKind::DailyReward => "daily_reward",
        }
    }

    pub const ALL: &'static [TransactionKind] = &[
        TransactionKind::SignupBonus,
        TransactionKind::Purchase,
        TransactionKind::BetPlaced,
        TransactionKind::BetSettlement,
        TransactionKind::BetRefund,
        TransactionKind::PositionBuy,
        TransactionKind::PositionSell,
        TransactionKind::PositionSettlement,
        TransactionKind::PositionRefund,
        TransactionKind::DailyReward,
    ];
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TransactionKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown transaction kind: {s}"))
    }
}

/// One append-only row per balance change. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub user_id: String,
    /// Signed delta applied to `available_credits`.
    pub amount: Decimal,
    pub kind: TransactionKind,
    /// Id of the bet/position/user the change refers to.
    pub reference_id: Option<String>,
    /// Balance immediately after the change.
    pub balance_after: Decimal,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{} {sign}{} → {} ({})",
            self.kind, self.amount, self.balance_after, self.user_id,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for TALLY. Every validation failure maps
/// to a distinct, stable message so callers can tell "not enough credits"
/// from "market already closed".
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient shares: tried to sell {requested}, holding {held}")]
    InsufficientShares { requested: Decimal, held: Decimal },

    #[error("Price must be between 0 and 1 (exclusive): {0}")]
    InvalidPrice(Decimal),

    #[error("Odds must be in (0, 1]: {0}")]
    InvalidOdds(Decimal),

    #[error("Market not found: {0}")]
    MarketNotFound(String),

    #[error("Market is not open for trading: {0}")]
    MarketNotOpen(String),

    #[error("Market has expired: {0}")]
    MarketExpired(String),

    #[error("Market already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Bet not found: {0}")]
    BetNotFound(String),

    #[error("Not authorized to trade this position")]
    NotOwner,

    #[error("Position is not open for trading: {0}")]
    PositionNotOpen(String),

    #[error("Bet amount must be between {min} and {max} credits")]
    BetAmountOutOfRange { min: Decimal, max: Decimal },

    #[error("Trade amount must be between {min} and {max} credits")]
    TradeAmountOutOfRange { min: Decimal, max: Decimal },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Concurrent write detected, operation lost the race")]
    StorageConflict,

    #[error("Stored value is malformed in column {column}: {value}")]
    Corrupt { column: String, value: String },

    #[error("Storage error: {0}")]
    Storage(sqlx::Error),
}

/// Busy/locked/snapshot errors from SQLite are transient contention
/// losses, not storage failures — they surface as `StorageConflict`
/// so the operation-level retry loop can pick them up.
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            let msg = db.message();
            if msg.contains("locked") || msg.contains("busy") || msg.contains("snapshot") {
                return EngineError::StorageConflict;
            }
        }
        EngineError::Storage(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
