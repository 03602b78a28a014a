// ===============================
// src/liquidation.rs (bulk sell-off of every non-quote balance)
// ===============================
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{Event, Intent, Side};
use crate::engine::{new_request_id, Engine, SignalError};
use crate::metrics::LIQUIDATIONS;

#[derive(Debug, Clone, Serialize)]
pub struct AssetOutcome {
    pub exchange: String,
    pub coin: String,
    pub symbol: String,
    pub request_id: String,
    pub success: bool,
    pub qty: Option<f64>,
    pub price: Option<f64>,
    pub profit: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquidationSummary {
    pub status: &'static str,
    pub message: String,
    pub successful: u32,
    pub failed: u32,
    pub total_profit: f64,
    pub results: Vec<AssetOutcome>,
}

/// Sell every non-quote balance, optionally on one venue only, one asset at a
/// time with `pause` between orders. A failing asset is recorded and skipped.
pub async fn sell_all(
    engine: &Engine,
    exchange: Option<&str>,
    pause: Duration,
) -> Result<LiquidationSummary, SignalError> {
    let filter = match exchange.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => match engine.venues().get(name) {
            Some(v) => Some(v.name().to_string()),
            None => return Err(SignalError::InvalidExchange(Some(name.to_string()))),
        },
        None => None,
    };

    let quote = engine.limits().quote_asset.clone();
    let balances: Vec<_> = engine
        .ledger()
        .all_balances(filter.as_deref())
        .await?
        .into_iter()
        .filter(|b| b.coin != quote)
        .collect();

    let mut summary = LiquidationSummary {
        status: "ok",
        message: String::new(),
        successful: 0,
        failed: 0,
        total_profit: 0.0,
        results: Vec::with_capacity(balances.len()),
    };
    info!(assets = balances.len(), venue = ?filter, "liquidation: start");

    for (i, b) in balances.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let symbol = format!("{}{}", b.coin, quote);
        let intent = Intent {
            request_id: new_request_id(&symbol, Side::Sell),
            side: Side::Sell,
            symbol: symbol.clone(),
            base: b.coin.clone(),
            usdt_amount: None,
            exchange: Some(b.exchange.clone()),
        };
        let request_id = intent.request_id.clone();

        match engine.execute(intent).await {
            Ok(x) => {
                LIQUIDATIONS.with_label_values(&["ok"]).inc();
                summary.successful += 1;
                summary.total_profit += x.profit.unwrap_or(0.0);
                summary.results.push(AssetOutcome {
                    exchange: x.exchange,
                    coin: b.coin.clone(),
                    symbol,
                    request_id,
                    success: true,
                    qty: Some(x.trade.qty),
                    price: Some(x.trade.price),
                    profit: x.profit,
                    reason: None,
                });
            }
            Err(e) => {
                LIQUIDATIONS.with_label_values(&["failed"]).inc();
                warn!(venue = %b.exchange, coin = %b.coin, amount = b.amount, reason = %e, "liquidation: asset skipped");
                summary.failed += 1;
                summary.results.push(AssetOutcome {
                    exchange: b.exchange.clone(),
                    coin: b.coin.clone(),
                    symbol,
                    request_id,
                    success: false,
                    qty: None,
                    price: None,
                    profit: None,
                    reason: Some(e.reason()),
                });
            }
        }
    }

    summary.message = if balances.is_empty() {
        "No assets to sell".to_string()
    } else {
        format!("Liquidation finished: {} successful, {} failed", summary.successful, summary.failed)
    };
    if let Some(v) = &filter {
        summary.message.push_str(&format!(" on {v}"));
    }
    info!(successful = summary.successful, failed = summary.failed, total_profit = summary.total_profit, "liquidation: done");

    if let Ok(v) = serde_json::to_value(&summary) {
        engine.emit(Event::Liquidation(v));
    }
    Ok(summary)
}
