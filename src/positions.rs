// ===============================
// src/positions.rs (realized PnL, profit statistics & portfolio valuation)
// ===============================
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::ledger::{Ledger, LedgerError};
use crate::venue::VenueRegistry;

/// Realized result of one sell against the last recorded buy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Realized {
    pub profit: f64,
    pub profit_no_fees: f64,
}

/// Profit of selling `qty` at `sell_px` against `last_buy_px`.
/// Without a prior buy there is no cost basis, so nothing is realized
/// (reported as null, which is not the same as a zero profit).
pub fn realize(sell_px: f64, last_buy_px: Option<f64>, qty: f64, fee: f64) -> Option<Realized> {
    let cost = last_buy_px?;
    let gross = (sell_px - cost) * qty;
    Some(Realized { profit: gross - fee, profit_no_fees: gross })
}

/// Per-trade slice the statistics are built from.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfitRow {
    pub profit: Option<f64>,
    pub profit_no_fees: Option<f64>,
    pub fee: f64,
    pub amount_usdt: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfitSide {
    pub total: f64,
    pub profitable: u64,
    pub losing: u64,
    pub counted: u64,
    pub average: f64,
    pub best: f64,
    pub worst: f64,
    pub win_rate: f64,
}

impl ProfitSide {
    fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut s = ProfitSide::default();
        let mut best = f64::NEG_INFINITY;
        let mut worst = f64::INFINITY;
        for v in values {
            s.total += v;
            s.counted += 1;
            if v > 0.0 { s.profitable += 1; }
            if v < 0.0 { s.losing += 1; }
            best = best.max(v);
            worst = worst.min(v);
        }
        if s.counted > 0 {
            s.average = s.total / s.counted as f64;
            s.best = best;
            s.worst = worst;
            s.win_rate = s.profitable as f64 / s.counted as f64 * 100.0;
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfitStats {
    pub with_fees: ProfitSide,
    pub without_fees: ProfitSide,
    pub total_fees: f64,
    pub total_volume: f64,
    pub trades: u64,
}

impl ProfitStats {
    pub fn from_rows(rows: &[ProfitRow]) -> Self {
        Self {
            with_fees: ProfitSide::from_values(rows.iter().filter_map(|r| r.profit)),
            without_fees: ProfitSide::from_values(rows.iter().filter_map(|r| r.profit_no_fees)),
            total_fees: rows.iter().map(|r| r.fee).sum(),
            total_volume: rows.iter().map(|r| r.amount_usdt).sum(),
            trades: rows.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VenueValue {
    pub quote: f64,
    pub coins_value: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Portfolio {
    pub total: f64,
    pub by_venue: BTreeMap<String, VenueValue>,
}

/// Value every ledger balance in quote currency at each venue's last price.
pub async fn portfolio(ledger: &Ledger, venues: &VenueRegistry, quote: &str) -> Result<Portfolio, LedgerError> {
    let mut out = Portfolio::default();
    for b in ledger.all_balances(None).await? {
        let entry = out.by_venue.entry(b.exchange.clone()).or_default();
        if b.coin == quote {
            entry.quote += b.amount;
            continue;
        }
        let Some(venue) = venues.get(&b.exchange) else {
            warn!(exchange = %b.exchange, coin = %b.coin, "portfolio: venue not configured, coin not valued");
            continue;
        };
        let px = venue.last_price(&format!("{}{}", b.coin, quote)).await;
        debug!(coin = %b.coin, amount = b.amount, px, exchange = %b.exchange, "portfolio: valued");
        entry.coins_value += b.amount * px;
    }
    for v in out.by_venue.values_mut() {
        v.total = v.quote + v.coins_value;
    }
    out.total = out.by_venue.values().map(|v| v.total).sum();
    Ok(out)
}
