// ===============================
// src/venue.rs (venue capability + simulated/live variants)
// ===============================
//
// Two layers:
// - `ExchangeApi`: thin REST adapter per exchange (binance.rs, bybit.rs).
// - `Venue`: what the engine talks to. `SimulatedVenue` prices from public
//   market data and stages balance changes against the ledger; `LiveVenue`
//   sends real market orders and reads balances back from the exchange.
//   The mode is picked once at construction (see main.rs).
//
// Neither variant writes the ledger: the post-trade balances travel back in
// the `Fill` and are committed together with the trade row.
//
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::{Fill, OrderRequest, Side, UnitHint};
use crate::ledger::{Ledger, LedgerError};
use crate::metrics::{PRICE_FALLBACKS, VENUE_ERRORS};
use crate::sizing;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{venue} api error {code}: {msg}")]
    Api { venue: &'static str, code: i64, msg: String },
    #[error("unexpected {venue} response: {detail}")]
    Decode { venue: &'static str, detail: String },
    #[error("missing API credentials for {0}")]
    MissingCredentials(&'static str),
    #[error("insufficient {asset}: have {have}, need {need}")]
    InsufficientFunds { asset: String, have: f64, need: f64 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Exchange acknowledgement of a market order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub avg_price: Option<f64>,
    pub executed_qty: Option<f64>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Canonical venue name as stored in the ledger ("Binance", "Bybit").
    fn name(&self) -> &'static str;
    /// Reference price used when public market data cannot be read.
    fn fallback_price(&self) -> f64;
    /// Unit the exchange expects the market order size in.
    fn unit_hint(&self, side: Side) -> UnitHint;
    async fn ticker_price(&self, symbol: &str) -> Result<f64, VenueError>;
    async fn free_balance(&self, asset: &str) -> Result<f64, VenueError>;
    async fn market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError>;
}

#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;
    fn unit_hint(&self, side: Side) -> UnitHint;
    /// Never fails: a market-data error degrades to the fallback price.
    async fn last_price(&self, symbol: &str) -> f64;
    async fn balance(&self, asset: &str) -> Result<f64, VenueError>;
    async fn place_order(&self, req: &OrderRequest) -> Result<Fill, VenueError>;
}

// Tolerance for "have >= need" comparisons on float balances.
const EPS: f64 = 1e-9;

async fn price_or_fallback(api: &dyn ExchangeApi, symbol: &str) -> f64 {
    match api.ticker_price(symbol).await {
        Ok(px) if px > 0.0 && px.is_finite() => px,
        Ok(px) => {
            warn!(venue = api.name(), %symbol, px, "non-positive ticker price, using fallback");
            PRICE_FALLBACKS.with_label_values(&[api.name()]).inc();
            api.fallback_price()
        }
        Err(e) => {
            warn!(venue = api.name(), %symbol, error = %e, "ticker read failed, using fallback");
            PRICE_FALLBACKS.with_label_values(&[api.name()]).inc();
            api.fallback_price()
        }
    }
}

/// HMAC-SHA256 of `payload`, hex encoded (Binance query / Bybit header signing).
pub fn sign_payload(venue: &'static str, secret: &str, payload: &str) -> Result<String, VenueError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| VenueError::Decode { venue, detail: format!("signing key: {e}") })?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// -----------------------------------------------------------------------------
// Simulated: public prices, balances in the ledger, commission at `fee_rate`.
// -----------------------------------------------------------------------------
pub struct SimulatedVenue {
    api: Arc<dyn ExchangeApi>,
    ledger: Ledger,
    fee_rate: f64,
    quote: String,
}

impl SimulatedVenue {
    pub fn new(api: Arc<dyn ExchangeApi>, ledger: Ledger, fee_rate: f64, quote: impl Into<String>) -> Self {
        Self { api, ledger, fee_rate, quote: quote.into() }
    }
}

#[async_trait]
impl Venue for SimulatedVenue {
    fn name(&self) -> &str { self.api.name() }

    fn unit_hint(&self, side: Side) -> UnitHint { self.api.unit_hint(side) }

    async fn last_price(&self, symbol: &str) -> f64 {
        price_or_fallback(self.api.as_ref(), symbol).await
    }

    async fn balance(&self, asset: &str) -> Result<f64, VenueError> {
        Ok(self.ledger.get_balance(self.name(), asset).await?)
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<Fill, VenueError> {
        let venue = self.name();
        let price = self.last_price(&req.symbol).await;
        let quote_before = self.ledger.get_balance(venue, &self.quote).await?;
        let base_before = self.ledger.get_balance(venue, &req.base).await?;
        let gross = req.qty * price;

        let (base_after, quote_after, fee) = match req.side {
            Side::Buy => {
                // commission is charged on top of the quote spent
                let need = gross * (1.0 + self.fee_rate);
                if need > quote_before + EPS {
                    return Err(VenueError::InsufficientFunds {
                        asset: self.quote.clone(),
                        have: quote_before,
                        need,
                    });
                }
                let base_after = base_before + req.qty;
                let quote_after = (quote_before - need).max(0.0);
                let spent = quote_before - quote_after;
                (base_after, quote_after, sizing::buy_fee(spent, price, base_before, base_after))
            }
            Side::Sell => {
                if req.qty > base_before + EPS {
                    return Err(VenueError::InsufficientFunds {
                        asset: req.base.clone(),
                        have: base_before,
                        need: req.qty,
                    });
                }
                // commission is withheld from the quote proceeds
                let base_after = (base_before - req.qty).max(0.0);
                let quote_after = quote_before + gross * (1.0 - self.fee_rate);
                (base_after, quote_after, sizing::sell_fee(quote_before, gross, quote_after))
            }
        };

        info!(%venue, side = ?req.side, symbol = %req.symbol, qty = req.qty, price, fee, "simulated fill");
        Ok(Fill {
            price,
            qty: req.qty,
            fee,
            base_after,
            quote_after,
            raw: json!({
                "status": "simulated",
                "side": req.side,
                "symbol": req.symbol,
                "qty": req.qty,
                "price": price,
                "fee": fee,
            }),
        })
    }
}

// -----------------------------------------------------------------------------
// Live: real market orders; fee from exchange balances around the order.
// -----------------------------------------------------------------------------
pub struct LiveVenue {
    api: Arc<dyn ExchangeApi>,
    quote: String,
}

impl LiveVenue {
    pub fn new(api: Arc<dyn ExchangeApi>, quote: impl Into<String>) -> Self {
        Self { api, quote: quote.into() }
    }
}

#[async_trait]
impl Venue for LiveVenue {
    fn name(&self) -> &str { self.api.name() }

    fn unit_hint(&self, side: Side) -> UnitHint { self.api.unit_hint(side) }

    async fn last_price(&self, symbol: &str) -> f64 {
        price_or_fallback(self.api.as_ref(), symbol).await
    }

    async fn balance(&self, asset: &str) -> Result<f64, VenueError> {
        self.api.free_balance(asset).await.map_err(|e| {
            VENUE_ERRORS.with_label_values(&[self.api.name(), "balance"]).inc();
            e
        })
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<Fill, VenueError> {
        let venue = self.api.name();
        let ref_price = self.last_price(&req.symbol).await;
        let base_before = self.balance(&req.base).await?;
        let quote_before = self.balance(&self.quote).await?;

        let ack = self.api.market_order(req).await.map_err(|e| {
            VENUE_ERRORS.with_label_values(&[venue, "order"]).inc();
            error!(%venue, side = ?req.side, symbol = %req.symbol, qty = req.qty, error = %e, "market order failed");
            e
        })?;

        let price = ack.avg_price.filter(|p| *p > 0.0).unwrap_or(ref_price);
        let qty = ack.executed_qty.filter(|q| *q > 0.0).unwrap_or(req.qty);
        let gross = qty * price;

        // The order is already done at this point; a failed read-back must not
        // turn it into an error, so estimate the zero-fee balances instead.
        let (est_base, est_quote) = match req.side {
            Side::Buy => (base_before + qty, (quote_before - gross).max(0.0)),
            Side::Sell => ((base_before - qty).max(0.0), quote_before + gross),
        };
        let base_after = match self.balance(&req.base).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%venue, asset = %req.base, error = %e, "post-trade balance read failed, estimating");
                est_base
            }
        };
        let quote_after = match self.balance(&self.quote).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%venue, asset = %self.quote, error = %e, "post-trade balance read failed, estimating");
                est_quote
            }
        };

        let (qty, fee) = match req.side {
            Side::Buy => {
                // record what actually arrived, so unsold quantity matches holdings
                let received = base_after - base_before;
                let qty = if received > 0.0 && received <= qty + EPS { received } else { qty };
                let spent = quote_before - quote_after;
                let spent = if spent > 0.0 { spent } else { gross };
                (qty, sizing::buy_fee(spent, price, base_before, base_before + qty))
            }
            Side::Sell => (qty, sizing::sell_fee(quote_before, gross, quote_after)),
        };
        // deposits/withdrawals racing the order can push the delta below zero
        let fee = fee.max(0.0);

        info!(%venue, side = ?req.side, symbol = %req.symbol, qty, price, fee, "live fill");
        Ok(Fill { price, qty, fee, base_after, quote_after, raw: ack.raw })
    }
}

// -----------------------------------------------------------------------------
// Registry: lookup by name, default venue fallback.
// -----------------------------------------------------------------------------
pub struct VenueRegistry {
    venues: Vec<Arc<dyn Venue>>,
    default: String,
}

fn venue_key(name: &str) -> String {
    let n = name.trim().to_ascii_lowercase();
    n.strip_suffix("_exchange").map(str::to_string).unwrap_or(n)
}

impl VenueRegistry {
    pub fn new(default: &str) -> Self {
        Self { venues: Vec::new(), default: venue_key(default) }
    }

    pub fn register(&mut self, venue: Arc<dyn Venue>) {
        debug!(venue = venue.name(), "venue registered");
        self.venues.push(venue);
    }

    pub fn all(&self) -> &[Arc<dyn Venue>] { &self.venues }

    /// Exact (case-insensitive) lookup, no fallback.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Venue>> {
        let key = venue_key(name);
        self.venues.iter().find(|v| venue_key(v.name()) == key).cloned()
    }

    pub fn default_venue(&self) -> Option<Arc<dyn Venue>> {
        self.get(&self.default)
    }

    /// Named venue, or the default one (with a warning) if the name is unknown.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<dyn Venue>> {
        match name {
            Some(n) => self.get(n).or_else(|| {
                warn!(requested = %n, default = %self.default, "unknown venue, using default");
                self.default_venue()
            }),
            None => self.default_venue(),
        }
    }
}
