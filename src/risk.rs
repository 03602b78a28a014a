// ===============================
// src/risk.rs
// ===============================
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Limits;
use crate::sizing::floor_to_precision;

/// Pre-trade rejections. These are business outcomes, not failures: the HTTP
/// layer answers them with 200 and `status: "Error"`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("Amount exceeds 10% of balance")]
    LimitExceeded { balance: f64, max_amount: f64 },
    #[error("No coins to sell")]
    NoCoins { balance: f64, unsold: f64 },
    #[error("Amount too small")]
    TooSmall { qty: f64, notional: f64, min_amount: f64 },
    #[error("Insufficient balance")]
    InsufficientBalance { required: f64, balances: Vec<(String, f64)> },
}

impl RiskError {
    /// Extra fields merged into the rejection body.
    pub fn context(&self) -> Value {
        match self {
            RiskError::LimitExceeded { balance, max_amount } => {
                json!({ "balance": balance, "max_amount": max_amount })
            }
            RiskError::NoCoins { balance, unsold } => json!({ "balance": balance, "unsold": unsold }),
            RiskError::TooSmall { qty, notional, min_amount } => {
                json!({ "qty": qty, "notional": notional, "min_amount": min_amount })
            }
            RiskError::InsufficientBalance { required, balances } => {
                let by_venue: serde_json::Map<String, Value> =
                    balances.iter().map(|(v, b)| (v.clone(), json!(b))).collect();
                json!({ "required": required, "balances": by_venue })
            }
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RiskError::LimitExceeded { .. } => "limit",
            RiskError::NoCoins { .. } => "no_coins",
            RiskError::TooSmall { .. } => "too_small",
            RiskError::InsufficientBalance { .. } => "insufficient",
        }
    }
}

/// Balance-fraction cap. Must be evaluated against the balance read under the
/// (venue, asset) lock, otherwise two concurrent signals can both pass.
/// `None` (bulk sell-off) is not capped.
pub fn check_notional(usdt_amount: Option<f64>, quote_balance: f64, lim: &Limits) -> Result<(), RiskError> {
    let Some(amount) = usdt_amount else { return Ok(()) };
    let max_amount = quote_balance * lim.max_balance_fraction;
    if amount > max_amount {
        return Err(RiskError::LimitExceeded { balance: quote_balance, max_amount });
    }
    Ok(())
}

/// Quantity a sell may dispose of: never more than the venue holds, never more
/// than the ledger says is still unsold, floored to the quantity precision.
pub fn sellable(asset_balance: f64, unsold: f64, price: f64, lim: &Limits) -> Result<f64, RiskError> {
    let qty = floor_to_precision(asset_balance.min(unsold), lim.qty_precision);
    if qty <= 0.0 {
        return Err(RiskError::NoCoins { balance: asset_balance, unsold });
    }
    let notional = qty * price;
    if notional < lim.min_trade_usdt {
        return Err(RiskError::TooSmall { qty, notional, min_amount: lim.min_trade_usdt });
    }
    Ok(qty)
}
