// ===============================
// src/engine.rs (signal intake -> venue -> risk -> order -> ledger)
// ===============================
//
// One signal runs to completion under the (venue, quote) and (venue, base)
// locks. Inside the locks: read price and balances, run the risk checks,
// size the order, then place it and commit trade + balances in a single
// ledger transaction, all under one deadline. If the deadline fires the
// uncommitted transaction is dropped and nothing is applied.
//
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::config::{Limits, VenueMode};
use crate::domain::{
    base_asset, normalize_symbol, ErrorEvent, Event, Fill, Intent, OrderRequest, Side, Signal, Trade,
};
use crate::ledger::{BalanceUpdate, Ledger, LedgerError, Recorded};
use crate::metrics::{EVENTS_DROPPED, SIGNALS, SIGNAL_LATENCY, TRADES};
use crate::positions;
use crate::risk::{self, RiskError};
use crate::router;
use crate::sizing;
use crate::venue::{Venue, VenueError, VenueRegistry};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Access denied")]
    Auth,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Rejected(#[from] RiskError),
    #[error("Invalid exchange")]
    InvalidExchange(Option<String>),
    #[error("venue error: {0}")]
    Venue(#[from] VenueError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SignalError {
    /// Soft rejections answer 200 with `status: "Error"` in the body.
    pub fn http_status(&self) -> u16 {
        match self {
            SignalError::Auth => 403,
            SignalError::Validation(_) => 400,
            SignalError::Rejected(_) | SignalError::InvalidExchange(_) => 200,
            SignalError::Venue(_) | SignalError::Ledger(_) | SignalError::Timeout(_) => 500,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, SignalError::Rejected(_) | SignalError::InvalidExchange(_))
    }

    /// Numeric context for rejections (balance, cap, available quantity...).
    pub fn context(&self) -> Value {
        match self {
            SignalError::Rejected(r) => r.context(),
            SignalError::InvalidExchange(name) => json!({ "exchange": name }),
            _ => json!({}),
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            SignalError::Auth => "auth",
            SignalError::Validation(_) => "validation",
            SignalError::Rejected(r) => r.metric_label(),
            SignalError::InvalidExchange(_) => "invalid_exchange",
            SignalError::Venue(_) | SignalError::Ledger(_) => "failed",
            SignalError::Timeout(_) => "timeout",
        }
    }
}

/// Result of an executed (or replayed) signal.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub request_id: String,
    pub exchange: String,
    pub order: Value,
    pub balance_after: f64,
    pub profit: Option<f64>,
    pub duplicate: bool,
    #[serde(skip)]
    pub trade: Trade,
}

impl Execution {
    fn from_trade(trade: Trade, duplicate: bool) -> Self {
        let venue_response = serde_json::from_str::<Value>(&trade.note)
            .unwrap_or_else(|_| Value::String(trade.note.clone()));
        Self {
            request_id: trade.request_id.clone(),
            exchange: trade.exchange.clone(),
            order: json!({
                "side": trade.side,
                "symbol": trade.symbol,
                "qty": trade.qty,
                "price": trade.price,
                "amount_usdt": trade.amount_usdt,
                "fee": trade.fee,
                "profit_no_fees": trade.profit_no_fees,
                "venue_response": venue_response,
            }),
            balance_after: trade.balance_after,
            profit: trade.profit,
            duplicate,
            trade,
        }
    }
}

/// `YYYYMMDD_HHMMSS_SYMBOL_SIDE_XXXXXXXX`
pub fn new_request_id(symbol: &str, side: Side) -> String {
    format!(
        "{}_{}_{}_{:08x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        symbol,
        side.as_str(),
        rand::random::<u32>()
    )
    .to_ascii_uppercase()
}

/// Per-(venue, asset) async locks, kept once created, plus per-request-id
/// slots that are dropped when released.
#[derive(Default)]
pub struct PairLocks {
    slots: StdMutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    requests: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PairLocks {
    fn slot(&self, venue: &str, asset: &str) -> Arc<Mutex<()>> {
        let mut map = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        map.entry((venue.to_string(), asset.to_string())).or_default().clone()
    }

    /// Lock every `(venue, asset)` pair, in sorted order so two signals over
    /// overlapping pairs cannot deadlock.
    pub async fn acquire(&self, venue: &str, assets: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys = assets.to_vec();
        keys.sort_unstable();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for asset in keys {
            guards.push(self.slot(venue, asset).lock_owned().await);
        }
        guards
    }

    /// One caller per request id at a time; a second caller with the same id
    /// waits here and then finds the first one's trade in the ledger.
    pub async fn acquire_request(&self, request_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.requests.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(request_id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Release a request slot, dropping its entry once nobody else waits on it.
    pub fn release_request(&self, request_id: &str, guard: OwnedMutexGuard<()>) {
        let mut map = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        drop(guard);
        if map.get(request_id).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(request_id);
        }
    }

    #[cfg(test)]
    fn pending_requests(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

pub struct Engine {
    ledger: Ledger,
    venues: VenueRegistry,
    limits: Limits,
    secret: String,
    price_priority: bool,
    signal_timeout: Duration,
    locks: PairLocks,
    events: Option<mpsc::Sender<Event>>,
}

impl Engine {
    pub fn new(ledger: Ledger, venues: VenueRegistry, limits: Limits, secret: impl Into<String>) -> Self {
        Self {
            ledger,
            venues,
            limits,
            secret: secret.into(),
            price_priority: true,
            signal_timeout: Duration::from_secs(30),
            locks: PairLocks::default(),
            events: None,
        }
    }

    pub fn with_price_priority(mut self, on: bool) -> Self {
        self.price_priority = on;
        self
    }

    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = timeout;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn ledger(&self) -> &Ledger { &self.ledger }
    pub fn venues(&self) -> &VenueRegistry { &self.venues }
    pub fn limits(&self) -> &Limits { &self.limits }

    /// Empty configured secret rejects everything.
    pub fn authorize(&self, presented: Option<&str>) -> Result<(), SignalError> {
        match presented {
            Some(s) if !self.secret.is_empty() && s == self.secret => Ok(()),
            _ => Err(SignalError::Auth),
        }
    }

    /// Startup: simulated mode tops up empty quote balances, live mode mirrors
    /// the venues' quote balances into the ledger.
    pub async fn seed_balances(&self, mode: VenueMode, amount: f64) -> Result<(), LedgerError> {
        let quote = self.limits.quote_asset.as_str();
        for v in self.venues.all() {
            match mode {
                VenueMode::Simulated => {
                    if self.ledger.get_balance(v.name(), quote).await? <= 0.0 {
                        self.ledger.set_balance(v.name(), quote, amount).await?;
                        info!(venue = v.name(), %quote, amount, "seeded simulated balance");
                        self.emit(Event::Note(format!("seeded {} {amount} {quote}", v.name())));
                    }
                }
                VenueMode::Live => match v.balance(quote).await {
                    Ok(b) => {
                        self.ledger.set_balance(v.name(), quote, b).await?;
                        info!(venue = v.name(), %quote, balance = b, "mirrored venue balance");
                        self.emit(Event::Note(format!("mirrored {} {b} {quote}", v.name())));
                    }
                    Err(e) => warn!(venue = v.name(), error = %e, "balance mirror failed"),
                },
            }
        }
        Ok(())
    }

    pub async fn handle_signal(&self, signal: Signal) -> Result<Execution, SignalError> {
        match self.intake(&signal) {
            Ok(intent) => self.execute(intent).await,
            Err(e) => {
                self.observe_failure(None, &signal, &e);
                Err(e)
            }
        }
    }

    fn intake(&self, signal: &Signal) -> Result<Intent, SignalError> {
        self.authorize(signal.secret.as_deref())?;

        let side = signal
            .action
            .as_deref()
            .and_then(Side::parse)
            .ok_or_else(|| SignalError::Validation("Invalid action".into()))?;

        let symbol = signal.symbol.as_deref().map(normalize_symbol).unwrap_or_default();
        if symbol.is_empty() {
            return Err(SignalError::Validation("Missing symbol".into()));
        }
        let quote = &self.limits.quote_asset;
        let base = base_asset(&symbol, quote)
            .ok_or_else(|| SignalError::Validation(format!("Symbol must be quoted in {quote}")))?;

        let usdt_amount = match (side, signal.usdt_amount) {
            (Side::Buy, Some(a)) if a.is_finite() && a > 0.0 => Some(a),
            (Side::Buy, _) => return Err(SignalError::Validation("Invalid usdt_amount".into())),
            (Side::Sell, Some(a)) if !a.is_finite() || a < 0.0 => {
                return Err(SignalError::Validation("Invalid usdt_amount".into()))
            }
            // a sell without an amount is checked as 0 against the cap
            (Side::Sell, a) => Some(a.unwrap_or(0.0)),
        };

        let request_id = signal
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| new_request_id(&symbol, side));
        let exchange = signal
            .exchange
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Intent { request_id, side, symbol, base, usdt_amount, exchange })
    }

    /// Run a validated intent. Used directly by the bulk sell-off.
    pub async fn execute(&self, intent: Intent) -> Result<Execution, SignalError> {
        let started = Instant::now();
        let slot = self.locks.acquire_request(&intent.request_id).await;
        let res = self.execute_inner(&intent).await;
        self.locks.release_request(&intent.request_id, slot);
        match &res {
            Ok(x) if x.duplicate => {
                SIGNALS.with_label_values(&["duplicate"]).inc();
            }
            Ok(x) => {
                SIGNALS.with_label_values(&["executed"]).inc();
                TRADES.with_label_values(&[&x.exchange, intent.side.as_str()]).inc();
                SIGNAL_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);
                self.emit(Event::TradeExecuted(x.trade.clone()));
            }
            Err(e) => self.observe_failure(Some(&intent), &Signal::default(), e),
        }
        res
    }

    async fn execute_inner(&self, intent: &Intent) -> Result<Execution, SignalError> {
        if let Some(stored) = self.ledger.get_trade(&intent.request_id).await? {
            info!(request_id = %intent.request_id, "replayed request, returning recorded trade");
            return Ok(Execution::from_trade(stored, true));
        }

        let venue = self.resolve_venue(intent).await?;
        let venue_name = venue.name().to_string();
        let quote = self.limits.quote_asset.as_str();
        let _guards = self.locks.acquire(&venue_name, &[quote, intent.base.as_str()]).await;

        let price = venue.last_price(&intent.symbol).await;
        let quote_balance = venue.balance(quote).await?;

        let qty = match intent.side {
            Side::Sell => {
                let held = venue.balance(&intent.base).await?;
                let unsold = self.ledger.unsold_quantity(&venue_name, &intent.symbol).await?;
                risk::sellable(held, unsold, price, &self.limits)?
            }
            Side::Buy => 0.0,
        };
        risk::check_notional(intent.usdt_amount, quote_balance, &self.limits)?;

        let qty = match intent.side {
            Side::Sell => qty,
            Side::Buy => {
                let notional = intent.usdt_amount.unwrap_or(0.0);
                let q = sizing::buy_quantity(notional, price, self.limits.qty_precision);
                if q <= 0.0 {
                    return Err(RiskError::TooSmall {
                        qty: q,
                        notional,
                        min_amount: price / 10f64.powi(self.limits.qty_precision as i32),
                    }
                    .into());
                }
                q
            }
        };

        let order = OrderRequest {
            client_id: intent.request_id.clone(),
            side: intent.side,
            symbol: intent.symbol.clone(),
            base: intent.base.clone(),
            qty,
            notional: qty * price,
            unit: venue.unit_hint(intent.side),
        };
        info!(
            request_id = %intent.request_id, venue = %venue_name, side = ?intent.side,
            symbol = %intent.symbol, qty, price, quote_balance, "placing order"
        );

        tokio::time::timeout(self.signal_timeout, self.place_and_record(venue.as_ref(), intent, &order))
            .await
            .map_err(|_| SignalError::Timeout(self.signal_timeout))?
    }

    async fn resolve_venue(&self, intent: &Intent) -> Result<Arc<dyn Venue>, SignalError> {
        if let Some(name) = intent.exchange.as_deref() {
            return self
                .venues
                .resolve(Some(name))
                .ok_or_else(|| SignalError::InvalidExchange(Some(name.to_string())));
        }
        let picked = match intent.side {
            Side::Buy if self.price_priority => {
                let amount = intent.usdt_amount.unwrap_or(0.0);
                let quote = &self.limits.quote_asset;
                Some(router::best_price_for_buy(&self.venues, &intent.symbol, amount, quote).await?)
            }
            Side::Buy => None,
            Side::Sell => router::holder_for_sell(&self.ledger, &self.venues, &intent.symbol).await?,
        };
        picked
            .or_else(|| self.venues.default_venue())
            .ok_or(SignalError::InvalidExchange(None))
    }

    async fn place_and_record(
        &self,
        venue: &dyn Venue,
        intent: &Intent,
        order: &OrderRequest,
    ) -> Result<Execution, SignalError> {
        let venue_name = venue.name().to_string();
        let fill: Fill = venue.place_order(order).await?;

        let realized = match intent.side {
            Side::Sell => {
                let last_buy = self.ledger.last_buy_price(&venue_name, &intent.symbol).await?;
                positions::realize(fill.price, last_buy, fill.qty, fill.fee)
            }
            Side::Buy => None,
        };

        let trade = Trade {
            request_id: intent.request_id.clone(),
            ts: Utc::now(),
            exchange: venue_name.clone(),
            side: intent.side,
            symbol: intent.symbol.clone(),
            price: fill.price,
            qty: fill.qty,
            amount_usdt: fill.qty * fill.price,
            fee: fill.fee,
            profit: realized.map(|r| r.profit),
            profit_no_fees: realized.map(|r| r.profit_no_fees),
            balance_after: fill.quote_after,
            note: fill.raw.to_string(),
        };
        let updates = [
            BalanceUpdate { asset: self.limits.quote_asset.clone(), amount: fill.quote_after },
            BalanceUpdate { asset: intent.base.clone(), amount: fill.base_after },
        ];

        match self.ledger.commit_trade(&trade, &updates).await {
            Ok(Recorded::Inserted) => {
                info!(
                    request_id = %trade.request_id, venue = %venue_name, side = ?trade.side,
                    qty = trade.qty, price = trade.price, fee = trade.fee, profit = ?trade.profit,
                    "trade recorded"
                );
                Ok(Execution::from_trade(trade, false))
            }
            Ok(Recorded::Duplicate) => {
                warn!(request_id = %trade.request_id, venue = %venue_name, "request id committed concurrently, keeping first record");
                let stored = self.ledger.get_trade(&trade.request_id).await?.unwrap_or(trade);
                Ok(Execution::from_trade(stored, true))
            }
            Err(e) => {
                // the venue already executed; the trade must not disappear silently
                error!(
                    request_id = %trade.request_id, venue = %venue_name, side = ?trade.side,
                    symbol = %trade.symbol, qty = trade.qty, price = trade.price, error = %e,
                    "order executed but ledger commit failed"
                );
                Err(e.into())
            }
        }
    }

    fn observe_failure(&self, intent: Option<&Intent>, signal: &Signal, e: &SignalError) {
        SIGNALS.with_label_values(&[e.outcome()]).inc();
        let request_id = intent.map(|i| i.request_id.clone()).or_else(|| signal.request_id.clone());
        let symbol = intent.map(|i| i.symbol.clone()).or_else(|| signal.symbol.clone());
        let side = intent.map(|i| i.side).or_else(|| signal.action.as_deref().and_then(Side::parse));
        let exchange = intent.and_then(|i| i.exchange.clone()).or_else(|| signal.exchange.clone());

        if e.is_rejection() {
            info!(request_id = ?request_id, symbol = ?symbol, side = ?side, reason = %e, context = %e.context(), "signal rejected");
        } else if e.http_status() >= 500 {
            error!(request_id = ?request_id, venue = ?exchange, symbol = ?symbol, side = ?side, error = %e, "signal failed");
        } else {
            warn!(request_id = ?request_id, symbol = ?symbol, reason = %e, "signal refused");
        }

        self.emit(Event::ErrorOccurred(ErrorEvent {
            ts: Utc::now(),
            request_id,
            exchange,
            symbol,
            side,
            reason: e.reason(),
            detail: e.context().to_string(),
        }));
    }

    pub(crate) fn emit(&self, ev: Event) {
        if let Some(tx) = &self.events {
            if tx.try_send(ev).is_err() {
                EVENTS_DROPPED.inc();
                warn!("event channel full or closed, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{engine_with_prices, FakeExchange, SECRET};
    use crate::venue::LiveVenue;

    fn buy(symbol: &str, amount: f64, exchange: Option<&str>) -> Signal {
        Signal {
            secret: Some(SECRET.into()),
            action: Some("buy".into()),
            symbol: Some(symbol.into()),
            usdt_amount: Some(amount),
            exchange: exchange.map(str::to_string),
            request_id: None,
        }
    }

    fn sell(symbol: &str, exchange: Option<&str>) -> Signal {
        Signal {
            secret: Some(SECRET.into()),
            action: Some("sell".into()),
            symbol: Some(symbol.into()),
            usdt_amount: None,
            exchange: exchange.map(str::to_string),
            request_id: None,
        }
    }

    #[test]
    fn generated_request_ids_are_unique_and_shaped() {
        let a = new_request_id("ETHUSDT", Side::Buy);
        let b = new_request_id("ETHUSDT", Side::Buy);
        assert_ne!(a, b);
        let parts: Vec<&str> = a.split('_').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[2], "ETHUSDT");
        assert_eq!(parts[3], "BUY");
        assert_eq!(parts[4].len(), 8);
    }

    #[tokio::test]
    async fn buy_then_sell_round_trip() {
        let (engine, fakes) = engine_with_prices(50.0, 50.0).await;
        let ledger = engine.ledger().clone();
        ledger.set_balance("Bybit", "USDT", 1000.0).await.unwrap();

        let x = engine.handle_signal(buy("ETHUSDT", 100.0, None)).await.unwrap();
        assert_eq!(x.exchange, "Bybit");
        assert_eq!(x.trade.side, Side::Buy);
        assert!((x.trade.qty - 2.0).abs() < 1e-9);
        assert_eq!(x.profit, None);
        assert!(ledger.get_balance("Bybit", "USDT").await.unwrap() < 900.0);
        assert!(ledger.get_balance("Bybit", "ETH").await.unwrap() > 0.0);
        assert_eq!(
            ledger.unsold_quantity("Bybit", "ETHUSDT").await.unwrap(),
            ledger.get_balance("Bybit", "ETH").await.unwrap()
        );
        assert_eq!(ledger.get_trade(&x.request_id).await.unwrap().unwrap().profit, None);

        fakes.bybit.set_price(Some(60.0));
        let s = engine.handle_signal(sell("ETHUSDT", None)).await.unwrap();
        assert_eq!(s.exchange, "Bybit");
        let held = 2.0;
        assert!((s.trade.qty - held).abs() < 1e-9);
        let profit = s.profit.unwrap();
        let gross = s.trade.profit_no_fees.unwrap();
        assert!((gross - (60.0 - 50.0) * held).abs() < 1e-9);
        assert!((profit - (gross - s.trade.fee)).abs() < 1e-9);
        assert_eq!(ledger.get_balance("Bybit", "ETH").await.unwrap(), 0.0);
        assert_eq!(ledger.unsold_quantity("Bybit", "ETHUSDT").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn replayed_request_id_changes_nothing() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        let ledger = engine.ledger().clone();
        ledger.set_balance("Bybit", "USDT", 1000.0).await.unwrap();
        let mut sig = buy("ETHUSDT", 50.0, Some("bybit"));
        sig.request_id = Some("fixed-1".into());

        let first = engine.handle_signal(sig.clone()).await.unwrap();
        assert!(!first.duplicate);
        let usdt = ledger.get_balance("Bybit", "USDT").await.unwrap();
        let eth = ledger.get_balance("Bybit", "ETH").await.unwrap();

        let again = engine.handle_signal(sig).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.trade, first.trade);
        assert_eq!(ledger.trade_count().await.unwrap(), 1);
        assert_eq!(ledger.get_balance("Bybit", "USDT").await.unwrap(), usdt);
        assert_eq!(ledger.get_balance("Bybit", "ETH").await.unwrap(), eth);
    }

    #[tokio::test]
    async fn over_cap_is_rejected_without_mutation() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        let ledger = engine.ledger().clone();
        ledger.set_balance("Bybit", "USDT", 1000.0).await.unwrap();
        let err = engine.handle_signal(buy("ETHUSDT", 150.0, Some("Bybit"))).await.unwrap_err();
        assert_eq!(err.reason(), "Amount exceeds 10% of balance");
        assert_eq!(err.http_status(), 200);
        assert_eq!(err.context()["max_amount"], 100.0);
        assert_eq!(ledger.get_balance("Bybit", "USDT").await.unwrap(), 1000.0);
        assert_eq!(ledger.trade_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sell_with_nothing_unsold_is_rejected() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        // coins on the venue but never bought through the ledger
        engine.ledger().set_balance("Bybit", "ETH", 3.0).await.unwrap();
        engine.ledger().set_balance("Bybit", "USDT", 1000.0).await.unwrap();
        let err = engine.handle_signal(sell("ETHUSDT", Some("bybit"))).await.unwrap_err();
        assert_eq!(err.reason(), "No coins to sell");
        assert_eq!(engine.ledger().get_balance("Bybit", "ETH").await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn auth_and_validation() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        let mut bad = buy("ETHUSDT", 10.0, None);
        bad.secret = Some("nope".into());
        assert_eq!(engine.handle_signal(bad).await.unwrap_err().http_status(), 403);

        let mut hold = buy("ETHUSDT", 10.0, None);
        hold.action = Some("hold".into());
        let err = engine.handle_signal(hold).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.reason(), "Invalid action");

        let mut no_amount = buy("ETHUSDT", 10.0, None);
        no_amount.usdt_amount = None;
        assert!(matches!(engine.handle_signal(no_amount).await, Err(SignalError::Validation(_))));

        assert!(matches!(
            engine.handle_signal(buy("ETHBTC", 10.0, None)).await,
            Err(SignalError::Validation(_))
        ));

        let open = Engine::new(engine.ledger().clone(), VenueRegistry::new("bybit"), Limits::default(), "");
        let mut empty = buy("ETHUSDT", 10.0, None);
        empty.secret = Some(String::new());
        assert!(matches!(open.handle_signal(empty).await, Err(SignalError::Auth)));
    }

    #[tokio::test]
    async fn concurrent_buys_on_one_pair_cannot_overspend() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        engine.ledger().set_balance("Bybit", "USDT", 1000.0).await.unwrap();
        let (a, b) = tokio::join!(
            engine.handle_signal(buy("ETHUSDT", 100.0, Some("bybit"))),
            engine.handle_signal(buy("ETHUSDT", 100.0, Some("bybit"))),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.iter().filter_map(|r| r.as_ref().err()).collect::<Vec<_>>();
        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0], SignalError::Rejected(RiskError::LimitExceeded { .. })));
        assert_eq!(engine.ledger().trade_count().await.unwrap(), 1);
        assert!((engine.ledger().get_balance("Bybit", "USDT").await.unwrap() - 899.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_venue_falls_back_to_default() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        engine.ledger().set_balance("Bybit", "USDT", 1000.0).await.unwrap();
        let x = engine.handle_signal(buy("ETHUSDT", 10.0, Some("kraken"))).await.unwrap();
        assert_eq!(x.exchange, "Bybit");

        let bare = Engine::new(engine.ledger().clone(), VenueRegistry::new("bybit"), Limits::default(), SECRET);
        let err = bare.handle_signal(buy("ETHUSDT", 10.0, Some("kraken"))).await.unwrap_err();
        assert_eq!(err.reason(), "Invalid exchange");
        assert_eq!(err.http_status(), 200);
    }

    #[tokio::test]
    async fn neither_venue_funded_is_insufficient_balance() {
        let (engine, _) = engine_with_prices(50.0, 49.0).await;
        let err = engine.handle_signal(buy("ETHUSDT", 10.0, None)).await.unwrap_err();
        assert_eq!(err.reason(), "Insufficient balance");
    }

    async fn live_engine(api: Arc<FakeExchange>, timeout: Duration) -> Engine {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut venues = VenueRegistry::new("binance");
        venues.register(Arc::new(LiveVenue::new(api, "USDT")));
        Engine::new(ledger, venues, Limits::default(), SECRET).with_signal_timeout(timeout)
    }

    #[tokio::test]
    async fn live_order_failure_leaves_no_trace() {
        let api = Arc::new(FakeExchange::new("Binance", Some(50.0)));
        api.set_balance("USDT", 1000.0);
        api.fail_orders(true);
        let engine = live_engine(api.clone(), Duration::from_secs(5)).await;
        engine.seed_balances(VenueMode::Live, 0.0).await.unwrap();

        let err = engine.handle_signal(buy("ETHUSDT", 100.0, Some("binance"))).await.unwrap_err();
        assert_eq!(err.http_status(), 500);
        assert_eq!(engine.ledger().trade_count().await.unwrap(), 0);
        assert_eq!(engine.ledger().get_balance("Binance", "USDT").await.unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn live_fill_mirrors_venue_balances() {
        let api = Arc::new(FakeExchange::new("Binance", Some(50.0)));
        api.set_balance("USDT", 1000.0);
        api.set_fill_commission(0.001);
        let engine = live_engine(api.clone(), Duration::from_secs(5)).await;

        let x = engine.handle_signal(buy("ETHUSDT", 100.0, None)).await.unwrap();
        assert_eq!(x.exchange, "Binance");
        assert!((x.trade.fee - 0.1).abs() < 1e-9);
        let l = engine.ledger();
        assert_eq!(l.get_balance("Binance", "ETH").await.unwrap(), api.balance_of("ETH"));
        assert_eq!(l.get_balance("Binance", "USDT").await.unwrap(), api.balance_of("USDT"));
        assert_eq!(api.orders()[0].client_id, x.request_id);
    }

    #[tokio::test]
    async fn concurrent_retries_of_one_request_place_a_single_order() {
        let api = Arc::new(FakeExchange::new("Binance", Some(50.0)));
        api.set_balance("USDT", 1000.0);
        api.set_order_delay(Duration::from_millis(50));
        let engine = live_engine(api.clone(), Duration::from_secs(5)).await;

        let mut sig = buy("ETHUSDT", 100.0, Some("binance"));
        sig.request_id = Some("same-1".into());
        let (a, b) = tokio::join!(engine.handle_signal(sig.clone()), engine.handle_signal(sig));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(api.orders().len(), 1);
        assert_eq!([a.duplicate, b.duplicate].iter().filter(|d| **d).count(), 1);
        assert_eq!(a.trade, b.trade);
        assert_eq!(engine.ledger().trade_count().await.unwrap(), 1);
        assert_eq!(engine.ledger().get_balance("Binance", "ETH").await.unwrap(), api.balance_of("ETH"));
        assert_eq!(engine.locks.pending_requests(), 0);
    }

    #[tokio::test]
    async fn stalled_venue_times_out_without_commit() {
        let api = Arc::new(FakeExchange::new("Binance", Some(50.0)));
        api.set_balance("USDT", 1000.0);
        api.set_order_delay(Duration::from_millis(300));
        let engine = live_engine(api, Duration::from_millis(50)).await;

        let err = engine.handle_signal(buy("ETHUSDT", 100.0, None)).await.unwrap_err();
        assert!(matches!(err, SignalError::Timeout(_)));
        assert_eq!(err.http_status(), 500);
        assert_eq!(engine.ledger().trade_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn simulated_seed_only_tops_up_empty_balances() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        let (tx, mut rx) = mpsc::channel(8);
        let engine = engine.with_events(tx);
        engine.ledger().set_balance("Binance", "USDT", 7.0).await.unwrap();
        engine.seed_balances(VenueMode::Simulated, 100.0).await.unwrap();
        assert_eq!(engine.ledger().get_balance("Binance", "USDT").await.unwrap(), 7.0);
        assert_eq!(engine.ledger().get_balance("Bybit", "USDT").await.unwrap(), 100.0);
        match rx.try_recv() {
            Ok(Event::Note(msg)) => assert_eq!(msg, "seeded Bybit 100 USDT"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_are_emitted_for_trades_and_errors() {
        let (engine, _) = engine_with_prices(50.0, 50.0).await;
        let (tx, mut rx) = mpsc::channel(8);
        let engine = engine.with_events(tx);
        engine.ledger().set_balance("Bybit", "USDT", 1000.0).await.unwrap();
        engine.handle_signal(buy("ETHUSDT", 10.0, Some("bybit"))).await.unwrap();
        engine.handle_signal(buy("ETHUSDT", 500.0, Some("bybit"))).await.unwrap_err();
        assert!(matches!(rx.recv().await, Some(Event::TradeExecuted(_))));
        match rx.recv().await {
            Some(Event::ErrorOccurred(e)) => assert_eq!(e.reason, "Amount exceeds 10% of balance"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
