//! Polymarket Gamma API integration.
//!
//! Read-only price source: TALLY users trade virtual credits against
//! Polymarket's live probabilities, no orders ever leave this system.
//!
//! API docs: https://docs.polymarket.com/
//! Base URL: https://gamma-api.polymarket.com
//! Auth: not required for market reads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{MarketQuote, PriceSource};
use crate::types::Resolution;

const SOURCE_NAME: &str = "polymarket";

/// A side is considered resolved once its price pins to this level.
const RESOLVED_PRICE: Decimal = dec!(0.99);

// ---------------------------------------------------------------------------
// API response types (Gamma JSON → Rust)
// ---------------------------------------------------------------------------

/// Gamma `/markets` entry. Only the fields we need; `outcomes` and
/// `outcomePrices` arrive as JSON-encoded strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    #[serde(default)]
    condition_id: String,
    #[serde(default)]
    question: String,

    /// JSON string, e.g. `"[\"Yes\", \"No\"]"`.
    #[serde(default)]
    outcomes: Option<String>,
    /// JSON string, e.g. `"[\"0.45\", \"0.55\"]"`.
    #[serde(default)]
    outcome_prices: Option<String>,

    #[serde(default)]
    accepting_orders: Option<bool>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    archived: Option<bool>,

    #[serde(default)]
    liquidity: Option<String>,
    #[serde(default)]
    volume: Option<String>,

    #[serde(default)]
    end_date_iso: Option<String>,
}

impl GammaMarket {
    /// Parse a JSON-encoded string array field ("[\"a\", \"b\"]").
    fn parse_string_array(raw: &Option<String>) -> Vec<String> {
        raw.as_deref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
    }

    fn outcome_pair(&self) -> (String, String) {
        let outcomes = Self::parse_string_array(&self.outcomes);
        let this = outcomes.first().cloned().unwrap_or_else(|| "Yes".to_string());
        let that = outcomes.get(1).cloned().unwrap_or_else(|| "No".to_string());
        (this, that)
    }

    fn price_pair(&self) -> (Decimal, Decimal) {
        let prices = Self::parse_string_array(&self.outcome_prices);
        let parse = |idx: usize| {
            prices
                .get(idx)
                .and_then(|p| p.parse::<Decimal>().ok())
                .unwrap_or(dec!(0.5))
        };
        (parse(0), parse(1))
    }

    fn decimal_field(raw: &Option<String>) -> Decimal {
        raw.as_deref()
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date_iso
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// `accepting_orders` is the only reliable liveness flag; `active`
    /// and `closed` are fallbacks when it is absent.
    fn is_accepting(&self) -> bool {
        match self.accepting_orders {
            Some(flag) => flag,
            None => !self.closed.unwrap_or(false) && self.active.unwrap_or(false),
        }
    }

    fn to_quote(&self) -> MarketQuote {
        let (this_option, that_option) = self.outcome_pair();
        let (this_odds, that_odds) = self.price_pair();
        MarketQuote {
            source_id: self.condition_id.clone(),
            title: self.question.clone(),
            this_option,
            that_option,
            this_odds,
            that_odds,
            accepting_orders: self.is_accepting(),
            archived: self.archived.unwrap_or(false),
            liquidity: Self::decimal_field(&self.liquidity),
            volume: Self::decimal_field(&self.volume),
            end_date: self.end_date(),
        }
    }

    /// Infer the terminal outcome of a closed market from pinned prices.
    /// An invalid market unwinds to an even 50/50 split.
    fn resolution(&self) -> Option<Resolution> {
        if !self.closed.unwrap_or(false) {
            return None;
        }
        let (this_price, that_price) = self.price_pair();
        if this_price >= RESOLVED_PRICE {
            Some(Resolution::This)
        } else if that_price >= RESOLVED_PRICE {
            Some(Resolution::That)
        } else if this_price == dec!(0.5) && that_price == dec!(0.5) {
            Some(Resolution::Invalid)
        } else {
            // Closed but prices not pinned yet, outcome still disputed
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Polymarket Gamma API client.
pub struct PolymarketClient {
    http: Client,
    base_url: String,
    fetch_limit: u32,
}

impl PolymarketClient {
    pub fn new(base_url: &str, fetch_limit: u32) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("TALLY/0.1.0 (virtual-credit-market)")
            .build()
            .context("Failed to build HTTP client for Polymarket")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            fetch_limit,
        })
    }

    async fn get_markets(&self, query: &str) -> Result<Vec<GammaMarket>> {
        let url = format!("{}/markets?{query}", self.base_url);
        debug!(url = %url, "Fetching Polymarket markets");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Polymarket API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Polymarket API error {status}: {body}");
        }

        resp.json()
            .await
            .context("Failed to parse Polymarket markets response")
    }
}

#[async_trait]
impl PriceSource for PolymarketClient {
    async fn fetch_markets(&self) -> Result<Vec<MarketQuote>> {
        let raw = self
            .get_markets(&format!("closed=false&limit={}&offset=0", self.fetch_limit))
            .await?;

        let quotes: Vec<MarketQuote> = raw
            .iter()
            .filter(|m| !m.condition_id.is_empty())
            .map(GammaMarket::to_quote)
            .collect();

        debug!(fetched = raw.len(), usable = quotes.len(), "Polymarket quotes normalized");
        Ok(quotes)
    }

    async fn fetch_resolution(&self, source_id: &str) -> Result<Option<Resolution>> {
        let raw = self
            .get_markets(&format!(
                "condition_ids={}",
                urlencoding::encode(source_id)
            ))
            .await?;

        match raw.first() {
            Some(market) => Ok(market.resolution()),
            None => {
                warn!(source_id, "Market vanished from the price source");
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gamma(json: serde_json::Value) -> GammaMarket {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_parse_gamma_market() {
        let market = gamma(serde_json::json!({
            "conditionId": "0xdeadbeef",
            "question": "Will BTC close above $100k this year?",
            "outcomes": "[\"Yes\", \"No\"]",
            "outcomePrices": "[\"0.62\", \"0.38\"]",
            "acceptingOrders": true,
            "archived": false,
            "liquidity": "150000.5",
            "volume": "2400000",
            "endDateIso": "2026-12-31T00:00:00Z"
        }));

        let quote = market.to_quote();
        assert_eq!(quote.source_id, "0xdeadbeef");
        assert_eq!(quote.this_option, "Yes");
        assert_eq!(quote.that_option, "No");
        assert_eq!(quote.this_odds, dec!(0.62));
        assert_eq!(quote.that_odds, dec!(0.38));
        assert!(quote.accepting_orders);
        assert_eq!(quote.liquidity, dec!(150000.5));
        assert!(quote.end_date.is_some());
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let market = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "Sparse market"
        }));

        let quote = market.to_quote();
        assert_eq!(quote.this_option, "Yes");
        assert_eq!(quote.that_option, "No");
        assert_eq!(quote.this_odds, dec!(0.5));
        assert!(!quote.accepting_orders);
        assert!(quote.end_date.is_none());
    }

    #[test]
    fn test_accepting_orders_beats_closed_flag() {
        // accepting_orders=true wins even when 'closed' claims otherwise
        let market = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "acceptingOrders": true,
            "closed": true
        }));
        assert!(market.is_accepting());

        // Without accepting_orders, fall back to closed/active
        let market = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "closed": false,
            "active": true
        }));
        assert!(market.is_accepting());
    }

    #[test]
    fn test_resolution_from_pinned_prices() {
        let won_this = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "closed": true,
            "outcomePrices": "[\"1\", \"0\"]"
        }));
        assert_eq!(won_this.resolution(), Some(Resolution::This));

        let won_that = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "closed": true,
            "outcomePrices": "[\"0.004\", \"0.996\"]"
        }));
        assert_eq!(won_that.resolution(), Some(Resolution::That));

        let invalid = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "closed": true,
            "outcomePrices": "[\"0.5\", \"0.5\"]"
        }));
        assert_eq!(invalid.resolution(), Some(Resolution::Invalid));
    }

    #[test]
    fn test_no_resolution_while_open_or_disputed() {
        let open = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "closed": false,
            "outcomePrices": "[\"1\", \"0\"]"
        }));
        assert_eq!(open.resolution(), None);

        let disputed = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "closed": true,
            "outcomePrices": "[\"0.80\", \"0.20\"]"
        }));
        assert_eq!(disputed.resolution(), None);
    }

    #[test]
    fn test_malformed_price_strings_fall_back() {
        let market = gamma(serde_json::json!({
            "conditionId": "0x1",
            "question": "q",
            "outcomePrices": "not json at all"
        }));
        let (this_odds, that_odds) = market.price_pair();
        assert_eq!(this_odds, dec!(0.5));
        assert_eq!(that_odds, dec!(0.5));
    }
}
