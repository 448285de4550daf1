//! Persistence layer.
//!
//! SQLite via `sqlx`. Credit/share/price amounts are stored as TEXT and
//! parsed into `rust_decimal::Decimal` — SQLite has no exact numeric type
//! and the ledger must not round. Timestamps are RFC 3339 TEXT.
//!
//! Functions that are part of a multi-statement atomic unit take
//! `&mut SqliteConnection` so the caller controls the transaction;
//! single-query reads are generic over any executor (pool or transaction).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::types::{
    AuditEntry, Bet, BetStatus, EngineError, Market, MarketStatus, Position, PositionStatus,
    Resolution, Result, Side, TransactionKind, User,
};

// ---------------------------------------------------------------------------
// Pool setup & schema
// ---------------------------------------------------------------------------

/// Shared handle to the SQLite pool. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

/// Schema statements, executed one at a time (idempotent).
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        available_credits TEXT NOT NULL,
        expended_credits TEXT NOT NULL,
        total_volume TEXT NOT NULL,
        overall_pnl TEXT NOT NULL,
        consecutive_days_online INTEGER NOT NULL,
        last_daily_reward_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS markets (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        this_option TEXT NOT NULL,
        that_option TEXT NOT NULL,
        this_odds TEXT NOT NULL,
        that_odds TEXT NOT NULL,
        liquidity TEXT NOT NULL,
        volume TEXT NOT NULL,
        status TEXT NOT NULL,
        expires_at TEXT,
        resolution TEXT,
        resolved_at TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS positions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        market_id TEXT NOT NULL REFERENCES markets(id),
        side TEXT NOT NULL,
        shares TEXT NOT NULL,
        avg_buy_price TEXT NOT NULL,
        total_invested TEXT NOT NULL,
        status TEXT NOT NULL,
        realized_pnl TEXT NOT NULL,
        settlement_payout TEXT,
        settled_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(user_id, market_id, side)
    )",
    "CREATE TABLE IF NOT EXISTS bets (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        market_id TEXT NOT NULL REFERENCES markets(id),
        side TEXT NOT NULL,
        amount TEXT NOT NULL,
        odds_at_bet TEXT NOT NULL,
        potential_payout TEXT NOT NULL,
        status TEXT NOT NULL,
        actual_payout TEXT,
        placed_at TEXT NOT NULL,
        settled_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS audit_trail (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        amount TEXT NOT NULL,
        kind TEXT NOT NULL,
        reference_id TEXT,
        balance_after TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_positions_market_status
        ON positions(market_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_bets_market_status
        ON bets(market_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_audit_user_created
        ON audit_trail(user_id, created_at)",
];

impl Storage {
    /// Open (or create) the database file and apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        info!(url = %config.url, "Storage ready");
        Ok(storage)
    }

    /// In-memory database for tests. Uses a uniquely-named shared-cache
    /// `:memory:` database so every pooled connection sees the same data
    /// (a plain `sqlite::memory:` connection would otherwise get its own
    /// empty database). `min_connections(1)` keeps the named database alive
    /// for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static DB_COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = DB_COUNTER.fetch_add(1, Ordering::Relaxed);
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:file:tally_memdb_{id}?mode=memory&cache=shared"
        ))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Query filters
// ---------------------------------------------------------------------------

/// Explicit filter for position listings. Every supported field is
/// enumerated here; unknown filters cannot be smuggled in.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PositionFilter {
    pub status: Option<PositionStatus>,
    pub market_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BetFilter {
    pub status: Option<BetStatus>,
    pub market_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketFilter {
    pub status: Option<MarketStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

fn page(limit: Option<u32>, offset: Option<u32>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    (i64::from(limit), i64::from(offset.unwrap_or(0)))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.try_get(column)?;
    match raw.parse::<Decimal>() {
        Ok(value) => Ok(value),
        Err(_) => Err(EngineError::Corrupt {
            column: column.to_string(),
            value: raw,
        }),
    }
}

fn optional_decimal_column(row: &SqliteRow, column: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        None => Ok(None),
        Some(raw) => match raw.parse::<Decimal>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(EngineError::Corrupt {
                column: column.to_string(),
                value: raw,
            }),
        },
    }
}

fn parsed_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|_| EngineError::Corrupt {
        column: column.to_string(),
        value: raw,
    })
}

fn optional_parsed_column<T>(row: &SqliteRow, column: &str) -> Result<Option<T>>
where
    T: FromStr,
{
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Corrupt {
                column: column.to_string(),
                value: raw,
            }),
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        available_credits: decimal_column(row, "available_credits")?,
        expended_credits: decimal_column(row, "expended_credits")?,
        total_volume: decimal_column(row, "total_volume")?,
        overall_pnl: decimal_column(row, "overall_pnl")?,
        consecutive_days_online: row.try_get::<i64, _>("consecutive_days_online")? as u32,
        last_daily_reward_at: row.try_get("last_daily_reward_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn market_from_row(row: &SqliteRow) -> Result<Market> {
    Ok(Market {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        this_option: row.try_get("this_option")?,
        that_option: row.try_get("that_option")?,
        this_odds: decimal_column(row, "this_odds")?,
        that_odds: decimal_column(row, "that_odds")?,
        liquidity: decimal_column(row, "liquidity")?,
        volume: decimal_column(row, "volume")?,
        status: parsed_column::<MarketStatus>(row, "status")?,
        expires_at: row.try_get("expires_at")?,
        resolution: optional_parsed_column::<Resolution>(row, "resolution")?,
        resolved_at: row.try_get("resolved_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn position_from_row(row: &SqliteRow) -> Result<Position> {
    Ok(Position {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        market_id: row.try_get("market_id")?,
        side: parsed_column::<Side>(row, "side")?,
        shares: decimal_column(row, "shares")?,
        avg_buy_price: decimal_column(row, "avg_buy_price")?,
        total_invested: decimal_column(row, "total_invested")?,
        status: parsed_column::<PositionStatus>(row, "status")?,
        realized_pnl: decimal_column(row, "realized_pnl")?,
        settlement_payout: optional_decimal_column(row, "settlement_payout")?,
        settled_at: row.try_get("settled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bet_from_row(row: &SqliteRow) -> Result<Bet> {
    Ok(Bet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        market_id: row.try_get("market_id")?,
        side: parsed_column::<Side>(row, "side")?,
        amount: decimal_column(row, "amount")?,
        odds_at_bet: decimal_column(row, "odds_at_bet")?,
        potential_payout: decimal_column(row, "potential_payout")?,
        status: parsed_column::<BetStatus>(row, "status")?,
        actual_payout: optional_decimal_column(row, "actual_payout")?,
        placed_at: row.try_get("placed_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: decimal_column(row, "amount")?,
        kind: parsed_column::<TransactionKind>(row, "kind")?,
        reference_id: row.try_get("reference_id")?,
        balance_after: decimal_column(row, "balance_after")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub async fn insert_user(conn: &mut SqliteConnection, user: &User) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, username, available_credits, expended_credits,
            total_volume, overall_pnl, consecutive_days_online,
            last_daily_reward_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.username)
    .bind(user.available_credits.to_string())
    .bind(user.expended_credits.to_string())
    .bind(user.total_volume.to_string())
    .bind(user.overall_pnl.to_string())
    .bind(i64::from(user.consecutive_days_online))
    .bind(user.last_daily_reward_at)
    .bind(user.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fetch_user<'e, E>(db: E, user_id: &str) -> Result<Option<User>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn fetch_user_by_username<'e, E>(db: E, username: &str) -> Result<Option<User>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Persist an updated ledger snapshot, guarded by the balance the caller
/// read at the start of the transaction. Zero rows affected means a
/// concurrent writer got there first.
pub async fn update_user_ledger(
    conn: &mut SqliteConnection,
    user: &User,
    guard_balance: Decimal,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE users SET available_credits = ?, expended_credits = ?,
            total_volume = ?, overall_pnl = ?, consecutive_days_online = ?,
            last_daily_reward_at = ?
         WHERE id = ? AND available_credits = ?",
    )
    .bind(user.available_credits.to_string())
    .bind(user.expended_credits.to_string())
    .bind(user.total_volume.to_string())
    .bind(user.overall_pnl.to_string())
    .bind(i64::from(user.consecutive_days_online))
    .bind(user.last_daily_reward_at)
    .bind(&user.id)
    .bind(guard_balance.to_string())
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::StorageConflict);
    }
    Ok(())
}

/// Top users ranked by lifetime realized P&L. Read-only reporting query.
pub async fn leaderboard<'e, E>(db: E, limit: u32) -> Result<Vec<User>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM users ORDER BY CAST(overall_pnl AS REAL) DESC, username LIMIT ?",
    )
    .bind(i64::from(limit.min(MAX_PAGE)))
    .fetch_all(db)
    .await?;
    rows.iter().map(user_from_row).collect()
}

/// Users eligible for the daily-reward sweep: never claimed, or last
/// claimed at or before `cutoff`.
pub async fn reward_eligible_users<'e, E>(db: E, cutoff: DateTime<Utc>) -> Result<Vec<User>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM users
         WHERE last_daily_reward_at IS NULL OR last_daily_reward_at <= ?",
    )
    .bind(cutoff)
    .fetch_all(db)
    .await?;
    rows.iter().map(user_from_row).collect()
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

/// Insert or refresh a market keyed by its external source id.
/// Ingestion never touches resolutions, and a resolved market keeps its
/// status no matter what the feed claims afterwards.
pub async fn upsert_market(conn: &mut SqliteConnection, market: &Market) -> Result<()> {
    sqlx::query(
        "INSERT INTO markets (id, source_id, title, this_option, that_option,
            this_odds, that_odds, liquidity, volume, status, expires_at,
            resolution, resolved_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?)
         ON CONFLICT(source_id) DO UPDATE SET
            title = excluded.title,
            this_option = excluded.this_option,
            that_option = excluded.that_option,
            this_odds = excluded.this_odds,
            that_odds = excluded.that_odds,
            liquidity = excluded.liquidity,
            volume = excluded.volume,
            status = CASE WHEN markets.resolution IS NULL
                          THEN excluded.status ELSE markets.status END,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at",
    )
    .bind(&market.id)
    .bind(&market.source_id)
    .bind(&market.title)
    .bind(&market.this_option)
    .bind(&market.that_option)
    .bind(market.this_odds.to_string())
    .bind(market.that_odds.to_string())
    .bind(market.liquidity.to_string())
    .bind(market.volume.to_string())
    .bind(market.status.as_str())
    .bind(market.expires_at)
    .bind(market.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fetch_market<'e, E>(db: E, market_id: &str) -> Result<Option<Market>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM markets WHERE id = ?")
        .bind(market_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(market_from_row).transpose()
}

pub async fn fetch_market_by_source<'e, E>(db: E, source_id: &str) -> Result<Option<Market>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM markets WHERE source_id = ?")
        .bind(source_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(market_from_row).transpose()
}

pub async fn list_markets<'e, E>(db: E, filter: &MarketFilter) -> Result<Vec<Market>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let mut sql = String::from("SELECT * FROM markets WHERE 1 = 1");
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");

    let (limit, offset) = page(filter.limit, filter.offset);
    let mut query = sqlx::query(&sql);
    if let Some(status) = filter.status {
        query = query.bind(status.as_str());
    }
    let rows = query.bind(limit).bind(offset).fetch_all(db).await?;
    rows.iter().map(market_from_row).collect()
}

/// Close every open market whose expiry has passed. Returns the count.
pub async fn close_expired_markets(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE markets SET status = 'closed', updated_at = ?
         WHERE status = 'open' AND expires_at IS NOT NULL AND expires_at < ?",
    )
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Closed markets whose outcome is still unknown — the janitor polls the
/// price source for these.
pub async fn unresolved_closed_markets<'e, E>(db: E, limit: u32) -> Result<Vec<Market>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM markets
         WHERE status != 'open' AND resolution IS NULL
         ORDER BY updated_at ASC LIMIT ?",
    )
    .bind(i64::from(limit))
    .fetch_all(db)
    .await?;
    rows.iter().map(market_from_row).collect()
}

/// Record a market's final outcome. Write-once: returns false when the
/// market already carries a resolution.
pub async fn record_market_resolution(
    conn: &mut SqliteConnection,
    market_id: &str,
    resolution: Resolution,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE markets SET resolution = ?, resolved_at = ?, status = 'closed',
            updated_at = ?
         WHERE id = ? AND resolution IS NULL",
    )
    .bind(resolution.as_str())
    .bind(now)
    .bind(now)
    .bind(market_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

pub async fn insert_position(conn: &mut SqliteConnection, position: &Position) -> Result<()> {
    sqlx::query(
        "INSERT INTO positions (id, user_id, market_id, side, shares,
            avg_buy_price, total_invested, status, realized_pnl,
            settlement_payout, settled_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&position.id)
    .bind(&position.user_id)
    .bind(&position.market_id)
    .bind(position.side.as_str())
    .bind(position.shares.to_string())
    .bind(position.avg_buy_price.to_string())
    .bind(position.total_invested.to_string())
    .bind(position.status.as_str())
    .bind(position.realized_pnl.to_string())
    .bind(position.settlement_payout.map(|p| p.to_string()))
    .bind(position.settled_at)
    .bind(position.created_at)
    .bind(position.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_position(conn: &mut SqliteConnection, position: &Position) -> Result<()> {
    let result = sqlx::query(
        "UPDATE positions SET shares = ?, avg_buy_price = ?, total_invested = ?,
            status = ?, realized_pnl = ?, settlement_payout = ?, settled_at = ?,
            updated_at = ?
         WHERE id = ?",
    )
    .bind(position.shares.to_string())
    .bind(position.avg_buy_price.to_string())
    .bind(position.total_invested.to_string())
    .bind(position.status.as_str())
    .bind(position.realized_pnl.to_string())
    .bind(position.settlement_payout.map(|p| p.to_string()))
    .bind(position.settled_at)
    .bind(position.updated_at)
    .bind(&position.id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::PositionNotFound(position.id.clone()));
    }
    Ok(())
}

pub async fn fetch_position<'e, E>(db: E, position_id: &str) -> Result<Option<Position>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
        .bind(position_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(position_from_row).transpose()
}

/// Fetch the unique (user, market, side) position, if any.
pub async fn find_position<'e, E>(
    db: E,
    user_id: &str,
    market_id: &str,
    side: Side,
) -> Result<Option<Position>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        "SELECT * FROM positions WHERE user_id = ? AND market_id = ? AND side = ?",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(side.as_str())
    .fetch_optional(db)
    .await?;
    row.as_ref().map(position_from_row).transpose()
}

/// All open positions on a market — the settlement sweep's work list.
pub async fn open_positions_for_market<'e, E>(db: E, market_id: &str) -> Result<Vec<Position>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM positions WHERE market_id = ? AND status = 'open'")
        .bind(market_id)
        .fetch_all(db)
        .await?;
    rows.iter().map(position_from_row).collect()
}

pub async fn list_positions<'e, E>(
    db: E,
    user_id: &str,
    filter: &PositionFilter,
) -> Result<Vec<Position>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let mut sql = String::from("SELECT * FROM positions WHERE user_id = ?");
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.market_id.is_some() {
        sql.push_str(" AND market_id = ?");
    }
    sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");

    let (limit, offset) = page(filter.limit, filter.offset);
    let mut query = sqlx::query(&sql).bind(user_id);
    if let Some(status) = filter.status {
        query = query.bind(status.as_str());
    }
    if let Some(market_id) = &filter.market_id {
        query = query.bind(market_id);
    }
    let rows = query.bind(limit).bind(offset).fetch_all(db).await?;
    rows.iter().map(position_from_row).collect()
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

pub async fn insert_bet(conn: &mut SqliteConnection, bet: &Bet) -> Result<()> {
    sqlx::query(
        "INSERT INTO bets (id, user_id, market_id, side, amount, odds_at_bet,
            potential_payout, status, actual_payout, placed_at, settled_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&bet.id)
    .bind(&bet.user_id)
    .bind(&bet.market_id)
    .bind(bet.side.as_str())
    .bind(bet.amount.to_string())
    .bind(bet.odds_at_bet.to_string())
    .bind(bet.potential_payout.to_string())
    .bind(bet.status.as_str())
    .bind(bet.actual_payout.map(|p| p.to_string()))
    .bind(bet.placed_at)
    .bind(bet.settled_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fetch_bet<'e, E>(db: E, bet_id: &str) -> Result<Option<Bet>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM bets WHERE id = ?")
        .bind(bet_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(bet_from_row).transpose()
}

pub async fn pending_bets_for_market<'e, E>(db: E, market_id: &str) -> Result<Vec<Bet>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM bets WHERE market_id = ? AND status = 'pending'")
        .bind(market_id)
        .fetch_all(db)
        .await?;
    rows.iter().map(bet_from_row).collect()
}

pub async fn list_bets<'e, E>(db: E, user_id: &str, filter: &BetFilter) -> Result<Vec<Bet>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let mut sql = String::from("SELECT * FROM bets WHERE user_id = ?");
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.market_id.is_some() {
        sql.push_str(" AND market_id = ?");
    }
    sql.push_str(" ORDER BY placed_at DESC LIMIT ? OFFSET ?");

    let (limit, offset) = page(filter.limit, filter.offset);
    let mut query = sqlx::query(&sql).bind(user_id);
    if let Some(status) = filter.status {
        query = query.bind(status.as_str());
    }
    if let Some(market_id) = &filter.market_id {
        query = query.bind(market_id);
    }
    let rows = query.bind(limit).bind(offset).fetch_all(db).await?;
    rows.iter().map(bet_from_row).collect()
}

/// Move a pending bet to its terminal state. Guarded on `pending` so a
/// duplicate settlement sweep cannot double-pay; returns false when the
/// bet was already settled.
pub async fn settle_bet_row(
    conn: &mut SqliteConnection,
    bet_id: &str,
    status: BetStatus,
    actual_payout: Decimal,
    settled_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE bets SET status = ?, actual_payout = ?, settled_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(actual_payout.to_string())
    .bind(settled_at)
    .bind(bet_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

pub async fn insert_audit_entry(conn: &mut SqliteConnection, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_trail (id, user_id, amount, kind, reference_id,
            balance_after, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.user_id)
    .bind(entry.amount.to_string())
    .bind(entry.kind.as_str())
    .bind(&entry.reference_id)
    .bind(entry.balance_after.to_string())
    .bind(entry.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// A user's credit history, newest first. Read-only reporting query.
pub async fn audit_history<'e, E>(
    db: E,
    user_id: &str,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<Vec<AuditEntry>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let (limit, offset) = page(limit, offset);
    let rows = sqlx::query(
        "SELECT * FROM audit_trail WHERE user_id = ?
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;
    rows.iter().map(audit_from_row).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_user(id: &str, username: &str, balance: Decimal) -> User {
        User {
            id: id.to_string(),
            username: username.to_string(),
            available_credits: balance,
            expended_credits: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            overall_pnl: Decimal::ZERO,
            consecutive_days_online: 0,
            last_daily_reward_at: None,
            created_at: Utc::now(),
        }
    }

    fn make_market(id: &str, source_id: &str) -> Market {
        Market {
            id: id.to_string(),
            source_id: source_id.to_string(),
            title: "Test market".to_string(),
            this_option: "Yes".to_string(),
            that_option: "No".to_string(),
            this_odds: dec!(0.40),
            that_odds: dec!(0.60),
            liquidity: dec!(1000),
            volume: dec!(500),
            status: MarketStatus::Open,
            expires_at: None,
            resolution: None,
            resolved_at: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        let user = make_user("u1", "alice", dec!(1000));
        insert_user(&mut conn, &user).await.unwrap();

        let loaded = fetch_user(storage.pool(), "u1").await.unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.available_credits, dec!(1000));
        assert!(loaded.last_daily_reward_at.is_none());

        let by_name = fetch_user_by_username(storage.pool(), "alice")
            .await
            .unwrap();
        assert!(by_name.is_some());
        assert!(fetch_user(storage.pool(), "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guarded_update_detects_stale_balance() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        let mut user = make_user("u1", "alice", dec!(1000));
        insert_user(&mut conn, &user).await.unwrap();

        user.available_credits = dec!(900);
        update_user_ledger(&mut conn, &user, dec!(1000)).await.unwrap();

        // Guarding on the stale balance must fail
        user.available_credits = dec!(800);
        let err = update_user_ledger(&mut conn, &user, dec!(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageConflict));
    }

    #[tokio::test]
    async fn test_market_upsert_refreshes_odds() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        let mut market = make_market("m1", "0xaaa");
        upsert_market(&mut conn, &market).await.unwrap();

        market.this_odds = dec!(0.55);
        market.that_odds = dec!(0.45);
        upsert_market(&mut conn, &market).await.unwrap();

        let loaded = fetch_market_by_source(storage.pool(), "0xaaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.this_odds, dec!(0.55));
        // Re-upsert keeps the original primary key
        assert_eq!(loaded.id, "m1");
    }

    #[tokio::test]
    async fn test_upsert_preserves_resolution_and_status() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        let mut market = make_market("m1", "0xaaa");
        upsert_market(&mut conn, &market).await.unwrap();

        let recorded = record_market_resolution(&mut conn, "m1", Resolution::This, Utc::now())
            .await
            .unwrap();
        assert!(recorded);

        // A later ingestion tick claiming the market is open must not win
        market.status = MarketStatus::Open;
        upsert_market(&mut conn, &market).await.unwrap();

        let loaded = fetch_market(storage.pool(), "m1").await.unwrap().unwrap();
        assert_eq!(loaded.status, MarketStatus::Closed);
        assert_eq!(loaded.resolution, Some(Resolution::This));

        // Resolution is write-once
        let again = record_market_resolution(&mut conn, "m1", Resolution::That, Utc::now())
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn test_close_expired_markets() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        let mut expired = make_market("m1", "0xaaa");
        expired.expires_at = Some(Utc::now() - chrono::Duration::hours(2));
        upsert_market(&mut conn, &expired).await.unwrap();

        let mut live = make_market("m2", "0xbbb");
        live.expires_at = Some(Utc::now() + chrono::Duration::hours(2));
        upsert_market(&mut conn, &live).await.unwrap();

        let closed = close_expired_markets(&mut conn, Utc::now()).await.unwrap();
        assert_eq!(closed, 1);

        let m1 = fetch_market(storage.pool(), "m1").await.unwrap().unwrap();
        let m2 = fetch_market(storage.pool(), "m2").await.unwrap().unwrap();
        assert_eq!(m1.status, MarketStatus::Closed);
        assert_eq!(m2.status, MarketStatus::Open);
    }

    #[tokio::test]
    async fn test_position_filters() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        insert_user(&mut conn, &make_user("u1", "alice", dec!(1000)))
            .await
            .unwrap();
        upsert_market(&mut conn, &make_market("m1", "0xaaa")).await.unwrap();
        upsert_market(&mut conn, &make_market("m2", "0xbbb")).await.unwrap();

        for (id, market_id, status) in [
            ("p1", "m1", PositionStatus::Open),
            ("p2", "m1", PositionStatus::Closed),
            ("p3", "m2", PositionStatus::Open),
        ] {
            let position = Position {
                id: id.to_string(),
                user_id: "u1".to_string(),
                market_id: market_id.to_string(),
                side: if id == "p2" { Side::That } else { Side::This },
                shares: dec!(10),
                avg_buy_price: dec!(0.5),
                total_invested: dec!(5),
                status,
                realized_pnl: Decimal::ZERO,
                settlement_payout: None,
                settled_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            insert_position(&mut conn, &position).await.unwrap();
        }

        let open_only = list_positions(
            storage.pool(),
            "u1",
            &PositionFilter {
                status: Some(PositionStatus::Open),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(open_only.len(), 2);

        let m1_only = list_positions(
            storage.pool(),
            "u1",
            &PositionFilter {
                market_id: Some("m1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(m1_only.len(), 2);

        let open_m1 = list_positions(
            storage.pool(),
            "u1",
            &PositionFilter {
                status: Some(PositionStatus::Open),
                market_id: Some("m1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(open_m1.len(), 1);
        assert_eq!(open_m1[0].id, "p1");
    }

    #[tokio::test]
    async fn test_settle_bet_row_is_write_once() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        insert_user(&mut conn, &make_user("u1", "alice", dec!(1000)))
            .await
            .unwrap();
        upsert_market(&mut conn, &make_market("m1", "0xaaa")).await.unwrap();

        let bet = Bet {
            id: "b1".to_string(),
            user_id: "u1".to_string(),
            market_id: "m1".to_string(),
            side: Side::This,
            amount: dec!(100),
            odds_at_bet: dec!(0.40),
            potential_payout: dec!(250),
            status: BetStatus::Pending,
            actual_payout: None,
            placed_at: Utc::now(),
            settled_at: None,
        };
        insert_bet(&mut conn, &bet).await.unwrap();

        let first = settle_bet_row(&mut conn, "b1", BetStatus::Won, dec!(250), Utc::now())
            .await
            .unwrap();
        assert!(first);

        let second = settle_bet_row(&mut conn, "b1", BetStatus::Won, dec!(250), Utc::now())
            .await
            .unwrap();
        assert!(!second);

        let loaded = fetch_bet(storage.pool(), "b1").await.unwrap().unwrap();
        assert_eq!(loaded.status, BetStatus::Won);
        assert_eq!(loaded.actual_payout, Some(dec!(250)));
    }

    #[tokio::test]
    async fn test_audit_history_ordering() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();

        insert_user(&mut conn, &make_user("u1", "alice", dec!(1000)))
            .await
            .unwrap();

        let base = Utc::now();
        for (i, amount) in [dec!(1000), dec!(-100), dec!(50)].iter().enumerate() {
            let entry = AuditEntry {
                id: format!("a{i}"),
                user_id: "u1".to_string(),
                amount: *amount,
                kind: TransactionKind::SignupBonus,
                reference_id: None,
                balance_after: dec!(1000),
                created_at: base + chrono::Duration::seconds(i as i64),
            };
            insert_audit_entry(&mut conn, &entry).await.unwrap();
        }

        let history = audit_history(storage.pool(), "u1", None, None).await.unwrap();
        assert_eq!(history.len(), 3);
        // Newest first
        assert_eq!(history[0].id, "a2");
        assert_eq!(history[2].id, "a0");
    }
}
