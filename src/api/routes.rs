//! API route handlers.
//!
//! All endpoints return JSON. Handlers are thin: they parse input, fetch
//! the current quote where one is needed, and call exactly one core
//! operation. Every `EngineError` maps to a distinct status code and a
//! stable error code string.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::engine::bets::PlaceBet;
use crate::engine::positions::BuyShares;
use crate::engine::Engine;
use crate::storage::{self, BetFilter, MarketFilter, PositionFilter};
use crate::types::{AuditEntry, Bet, EngineError, Market, Position, Side, User};

// ---------------------------------------------------------------------------
// Shared state & error mapping
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    pub engine: Engine,
}

/// Wrapper so `EngineError` can flow straight out of handlers with `?`.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::InsufficientFunds { .. }
            | EngineError::InsufficientShares { .. }
            | EngineError::InvalidPrice(_)
            | EngineError::InvalidOdds(_)
            | EngineError::BetAmountOutOfRange { .. }
            | EngineError::TradeAmountOutOfRange { .. } => StatusCode::BAD_REQUEST,
            EngineError::UserNotFound(_)
            | EngineError::MarketNotFound(_)
            | EngineError::PositionNotFound(_)
            | EngineError::BetNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NotOwner => StatusCode::FORBIDDEN,
            EngineError::MarketNotOpen(_)
            | EngineError::MarketExpired(_)
            | EngineError::PositionNotOpen(_)
            | EngineError::AlreadyResolved(_)
            | EngineError::UsernameTaken(_) => StatusCode::CONFLICT,
            EngineError::StorageConflict => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Corrupt { .. } | EngineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code, one per error kind.
    fn code(&self) -> &'static str {
        match &self.0 {
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::InsufficientShares { .. } => "insufficient_shares",
            EngineError::InvalidPrice(_) => "invalid_price",
            EngineError::InvalidOdds(_) => "invalid_odds",
            EngineError::MarketNotFound(_) => "market_not_found",
            EngineError::MarketNotOpen(_) => "market_not_open",
            EngineError::MarketExpired(_) => "market_expired",
            EngineError::AlreadyResolved(_) => "already_resolved",
            EngineError::PositionNotFound(_) => "position_not_found",
            EngineError::BetNotFound(_) => "bet_not_found",
            EngineError::NotOwner => "not_owner",
            EngineError::PositionNotOpen(_) => "position_not_open",
            EngineError::BetAmountOutOfRange { .. } => "bet_amount_out_of_range",
            EngineError::TradeAmountOutOfRange { .. } => "trade_amount_out_of_range",
            EngineError::UserNotFound(_) => "user_not_found",
            EngineError::UsernameTaken(_) => "username_taken",
            EngineError::StorageConflict => "storage_conflict",
            EngineError::Corrupt { .. } | EngineError::Storage(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the logs, not on the wire
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Internal error");
            "Internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = serde_json::json!({ "error": message, "code": self.code() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: String,
    pub username: String,
    /// Legacy alias of `available_credits` — kept for old clients.
    pub credit_balance: Decimal,
    pub available_credits: Decimal,
    pub expended_credits: Decimal,
    pub total_volume: Decimal,
    pub overall_pnl: Decimal,
    pub consecutive_days_online: u32,
    pub last_daily_reward_at: Option<DateTime<Utc>>,
}

impl From<User> for ProfileResponse {
    fn from(user: User) -> Self {
        Self {
            credit_balance: user.credit_balance(),
            id: user.id,
            username: user.username,
            available_credits: user.available_credits,
            expended_credits: user.expended_credits,
            total_volume: user.total_volume,
            overall_pnl: user.overall_pnl,
            consecutive_days_online: user.consecutive_days_online,
            last_daily_reward_at: user.last_daily_reward_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: String,
    pub amount: Decimal,
    pub reference: String,
}

#[derive(Debug, Deserialize)]
pub struct PlaceBetRequest {
    pub user_id: String,
    pub market_id: String,
    pub side: Side,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct BetResponse {
    pub bet: Bet,
    pub new_balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BuySharesRequest {
    pub user_id: String,
    pub market_id: String,
    pub side: Side,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct BuySharesResponse {
    pub position: Position,
    pub shares_bought: Decimal,
    pub price: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct SellSharesRequest {
    pub user_id: String,
    pub shares: Decimal,
}

#[derive(Debug, Serialize)]
pub struct SellSharesResponse {
    pub position: Position,
    pub proceeds: Decimal,
    pub realized_pnl: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRewardRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct RewardResponse {
    pub credits_awarded: Decimal,
    pub consecutive_days: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub new_balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub username: String,
    pub overall_pnl: Decimal,
    pub total_volume: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

// ---------------------------------------------------------------------------
// Users & rewards
// ---------------------------------------------------------------------------

/// POST /api/users
pub async fn signup(
    State(state): State<ApiState>,
    Json(req): Json<SignupRequest>,
) -> ApiResult<Json<ProfileResponse>> {
    let user = state.engine.create_user(&req.username, Utc::now()).await?;
    Ok(Json(user.into()))
}

/// GET /api/users/:id
pub async fn get_profile(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ProfileResponse>> {
    let user = storage::fetch_user(state.engine.storage().pool(), &user_id)
        .await?
        .ok_or(EngineError::UserNotFound(user_id))?;
    Ok(Json(user.into()))
}

/// POST /api/purchases
pub async fn grant_purchase(
    State(state): State<ApiState>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<Json<ProfileResponse>> {
    let user = state
        .engine
        .grant_purchase(&req.user_id, req.amount, &req.reference, Utc::now())
        .await?;
    Ok(Json(user.into()))
}

/// POST /api/rewards/claim
pub async fn claim_reward(
    State(state): State<ApiState>,
    Json(req): Json<ClaimRewardRequest>,
) -> ApiResult<Json<RewardResponse>> {
    let outcome = state
        .engine
        .claim_daily_reward(&req.user_id, Utc::now())
        .await?;
    Ok(Json(RewardResponse {
        credits_awarded: outcome.credits_awarded,
        consecutive_days: outcome.consecutive_days,
        next_eligible_at: outcome.next_eligible_at,
        new_balance: outcome.new_balance,
    }))
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

/// GET /api/markets
pub async fn list_markets(
    State(state): State<ApiState>,
    Query(filter): Query<MarketFilter>,
) -> ApiResult<Json<Vec<Market>>> {
    let markets = storage::list_markets(state.engine.storage().pool(), &filter).await?;
    Ok(Json(markets))
}

/// GET /api/markets/:id
pub async fn get_market(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<Market>> {
    let market = storage::fetch_market(state.engine.storage().pool(), &market_id)
        .await?
        .ok_or(EngineError::MarketNotFound(market_id))?;
    Ok(Json(market))
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

/// POST /api/bets
pub async fn place_bet(
    State(state): State<ApiState>,
    Json(req): Json<PlaceBetRequest>,
) -> ApiResult<Json<BetResponse>> {
    let input = PlaceBet {
        market_id: req.market_id,
        side: req.side,
        amount: req.amount,
    };
    let outcome = state.engine.place_bet(&req.user_id, &input, Utc::now()).await?;
    Ok(Json(BetResponse {
        bet: outcome.bet,
        new_balance: outcome.new_balance,
    }))
}

/// GET /api/users/:id/bets
pub async fn list_bets(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(filter): Query<BetFilter>,
) -> ApiResult<Json<Vec<Bet>>> {
    let bets = storage::list_bets(state.engine.storage().pool(), &user_id, &filter).await?;
    Ok(Json(bets))
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// POST /api/positions/buy
///
/// The current price comes from the locally-ingested quote, read here —
/// before the atomic unit — and passed into the engine as a parameter.
pub async fn buy_shares(
    State(state): State<ApiState>,
    Json(req): Json<BuySharesRequest>,
) -> ApiResult<Json<BuySharesResponse>> {
    let pool = state.engine.storage().pool();
    let market = storage::fetch_market(pool, &req.market_id)
        .await?
        .ok_or_else(|| EngineError::MarketNotFound(req.market_id.clone()))?;
    let price = market.odds_for(req.side);

    let input = BuyShares {
        market_id: req.market_id,
        side: req.side,
        amount: req.amount,
        price,
    };
    let outcome = state.engine.buy_shares(&req.user_id, &input, Utc::now()).await?;
    Ok(Json(BuySharesResponse {
        position: outcome.position,
        shares_bought: outcome.shares_bought,
        price,
        new_balance: outcome.new_balance,
    }))
}

/// POST /api/positions/:id/sell
pub async fn sell_shares(
    State(state): State<ApiState>,
    Path(position_id): Path<String>,
    Json(req): Json<SellSharesRequest>,
) -> ApiResult<Json<SellSharesResponse>> {
    let pool = state.engine.storage().pool();
    let position = storage::fetch_position(pool, &position_id)
        .await?
        .ok_or_else(|| EngineError::PositionNotFound(position_id.clone()))?;
    let market = storage::fetch_market(pool, &position.market_id)
        .await?
        .ok_or_else(|| EngineError::MarketNotFound(position.market_id.clone()))?;
    let price = market.odds_for(position.side);

    let outcome = state
        .engine
        .sell_shares(&req.user_id, &position_id, req.shares, price, Utc::now())
        .await?;
    Ok(Json(SellSharesResponse {
        position: outcome.position,
        proceeds: outcome.proceeds,
        realized_pnl: outcome.realized_pnl,
        new_balance: outcome.new_balance,
    }))
}

/// GET /api/users/:id/positions
pub async fn list_positions(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(filter): Query<PositionFilter>,
) -> ApiResult<Json<Vec<Position>>> {
    let positions =
        storage::list_positions(state.engine.storage().pool(), &user_id, &filter).await?;
    Ok(Json(positions))
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// GET /api/leaderboard
pub async fn leaderboard(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<LeaderboardEntry>>> {
    let users =
        storage::leaderboard(state.engine.storage().pool(), page.limit.unwrap_or(20)).await?;
    let entries = users
        .into_iter()
        .enumerate()
        .map(|(i, user)| LeaderboardEntry {
            rank: i + 1,
            username: user.username,
            overall_pnl: user.overall_pnl,
            total_volume: user.total_volume,
        })
        .collect();
    Ok(Json(entries))
}

/// GET /api/users/:id/history
pub async fn credit_history(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let entries = storage::audit_history(
        state.engine.storage().pool(),
        &user_id,
        page.limit,
        page.offset,
    )
    .await?;
    Ok(Json(entries))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
