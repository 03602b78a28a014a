// ===============================
// src/testkit.rs (test doubles: scripted exchange, in-memory wiring)
// ===============================
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::config::Limits;
use crate::domain::{base_asset, OrderRequest, Side, Trade, UnitHint};
use crate::engine::Engine;
use crate::ledger::Ledger;
use crate::venue::{ExchangeApi, OrderAck, SimulatedVenue, VenueError, VenueRegistry};

pub const SECRET: &str = "s3cret";

#[derive(Default)]
struct FakeState {
    price: Option<f64>,
    balances: HashMap<String, f64>,
    orders: Vec<OrderRequest>,
    fail_orders: bool,
    commission: f64,
    order_delay: Option<Duration>,
}

/// In-process exchange: settable ticker, wallet that market orders act on.
pub struct FakeExchange {
    name: &'static str,
    state: Mutex<FakeState>,
}

impl FakeExchange {
    pub fn new(name: &'static str, price: Option<f64>) -> Self {
        Self { name, state: Mutex::new(FakeState { price, ..Default::default() }) }
    }

    pub fn set_price(&self, price: Option<f64>) {
        self.state.lock().unwrap().price = price;
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.state.lock().unwrap().balances.insert(asset.to_string(), amount);
    }

    pub fn balance_of(&self, asset: &str) -> f64 {
        self.state.lock().unwrap().balances.get(asset).copied().unwrap_or(0.0)
    }

    /// Share of the bought coins (buy) or of the proceeds (sell) the exchange keeps.
    pub fn set_fill_commission(&self, rate: f64) {
        self.state.lock().unwrap().commission = rate;
    }

    pub fn fail_orders(&self, fail: bool) {
        self.state.lock().unwrap().fail_orders = fail;
    }

    pub fn set_order_delay(&self, delay: Duration) {
        self.state.lock().unwrap().order_delay = Some(delay);
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().orders.clone()
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    fn name(&self) -> &'static str { self.name }

    fn fallback_price(&self) -> f64 {
        if self.name == "Binance" { 25_000.0 } else { 100.0 }
    }

    fn unit_hint(&self, _side: Side) -> UnitHint { UnitHint::Base }

    async fn ticker_price(&self, symbol: &str) -> Result<f64, VenueError> {
        self.state.lock().unwrap().price.ok_or_else(|| VenueError::Decode {
            venue: self.name,
            detail: format!("no ticker for {symbol}"),
        })
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, VenueError> {
        Ok(self.balance_of(asset))
    }

    async fn market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        let delay = self.state.lock().unwrap().order_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state.lock().unwrap();
        if st.fail_orders {
            return Err(VenueError::Api { venue: self.name, code: -1, msg: "scripted failure".into() });
        }
        let px = st.price.unwrap_or(1.0);
        let gross = req.qty * px;
        let keep = 1.0 - st.commission;
        let quote = st.balances.get("USDT").copied().unwrap_or(0.0);
        let base = st.balances.get(&req.base).copied().unwrap_or(0.0);
        match req.side {
            Side::Buy => {
                st.balances.insert("USDT".into(), quote - gross);
                st.balances.insert(req.base.clone(), base + req.qty * keep);
            }
            Side::Sell => {
                st.balances.insert(req.base.clone(), base - req.qty);
                st.balances.insert("USDT".into(), quote + gross * keep);
            }
        }
        st.orders.push(req.clone());
        Ok(OrderAck {
            avg_price: Some(px),
            executed_qty: Some(req.qty),
            raw: json!({ "status": "FILLED", "clientOrderId": req.client_id }),
        })
    }
}

pub struct Fakes {
    pub binance: Arc<FakeExchange>,
    pub bybit: Arc<FakeExchange>,
}

pub fn trade(id: &str, exchange: &str, side: Side, symbol: &str, price: f64, qty: f64) -> Trade {
    Trade {
        request_id: id.to_string(),
        ts: Utc::now(),
        exchange: exchange.to_string(),
        side,
        symbol: symbol.to_string(),
        price,
        qty,
        amount_usdt: price * qty,
        fee: 0.0,
        profit: None,
        profit_no_fees: None,
        balance_after: 0.0,
        note: String::new(),
    }
}

pub fn order(side: Side, symbol: &str, qty: f64, notional: f64) -> OrderRequest {
    OrderRequest {
        client_id: format!("test-{}", rand::random::<u32>()),
        side,
        symbol: symbol.to_string(),
        base: base_asset(symbol, "USDT").unwrap_or_default(),
        qty,
        notional,
        unit: UnitHint::Base,
    }
}

/// Simulated Binance + Bybit over one in-memory ledger, no balances seeded.
/// Default venue is Bybit, simulated commission 0.1%.
pub async fn registry_with_prices(binance_px: f64, bybit_px: f64) -> (Ledger, VenueRegistry, Fakes) {
    let ledger = Ledger::in_memory().await.unwrap();
    let fakes = Fakes {
        binance: Arc::new(FakeExchange::new("Binance", Some(binance_px))),
        bybit: Arc::new(FakeExchange::new("Bybit", Some(bybit_px))),
    };
    let mut venues = VenueRegistry::new("bybit");
    venues.register(Arc::new(SimulatedVenue::new(fakes.binance.clone(), ledger.clone(), 0.001, "USDT")));
    venues.register(Arc::new(SimulatedVenue::new(fakes.bybit.clone(), ledger.clone(), 0.001, "USDT")));
    (ledger, venues, fakes)
}

/// Engine over `registry_with_prices`, secret `SECRET`, price priority on.
pub async fn engine_with_prices(binance_px: f64, bybit_px: f64) -> (Engine, Fakes) {
    let (ledger, venues, fakes) = registry_with_prices(binance_px, bybit_px).await;
    let engine = Engine::new(ledger, venues, Limits::default(), SECRET)
        .with_price_priority(true)
        .with_signal_timeout(Duration::from_secs(5));
    (engine, fakes)
}
