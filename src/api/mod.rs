//! API — Axum web server exposing the core operations.
//!
//! Identity is a caller-supplied user id; session issuance lives outside
//! this service. CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::Engine;
use routes::ApiState;

/// Start the API server. Blocks until the listener fails.
pub async fn serve(engine: Engine, port: u16) -> Result<()> {
    let app = build_router(ApiState { engine });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "API server starting on http://localhost:{port}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API port")?;

    axum::serve(listener, app).await.context("API server error")
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin("*".parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/users", post(routes::signup))
        .route("/api/users/:id", get(routes::get_profile))
        .route("/api/users/:id/bets", get(routes::list_bets))
        .route("/api/users/:id/positions", get(routes::list_positions))
        .route("/api/users/:id/history", get(routes::credit_history))
        .route("/api/purchases", post(routes::grant_purchase))
        .route("/api/rewards/claim", post(routes::claim_reward))
        .route("/api/markets", get(routes::list_markets))
        .route("/api/markets/:id", get(routes::get_market))
        .route("/api/bets", post(routes::place_bet))
        .route("/api/positions/buy", post(routes::buy_shares))
        .route("/api/positions/:id/sell", post(routes::sell_shares))
        .route("/api/leaderboard", get(routes::leaderboard))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
