// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Raw webhook body. Every field is optional here so that a missing field is
/// reported as a validation rejection instead of a JSON decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default)] pub secret: Option<String>,
    #[serde(default)] pub action: Option<String>,
    #[serde(default)] pub symbol: Option<String>,
    #[serde(default)] pub usdt_amount: Option<f64>,
    #[serde(default)] pub exchange: Option<String>,
    #[serde(default)] pub request_id: Option<String>,
}

/// A validated signal, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub request_id: String,
    pub side: Side,
    pub symbol: String,
    pub base: String,
    /// Requested notional. `None` skips the balance-fraction cap (bulk sell-off).
    pub usdt_amount: Option<f64>,
    pub exchange: Option<String>,
}

/// Append-only trade row. `profit`/`profit_no_fees` stay `None` for buys and
/// for sells without a prior buy on the same venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub request_id: String,
    pub ts: DateTime<Utc>,
    pub exchange: String,
    pub side: Side,
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    pub amount_usdt: f64,
    pub fee: f64,
    pub profit: Option<f64>,
    pub profit_no_fees: Option<f64>,
    pub balance_after: f64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow { pub exchange: String, pub coin: String, pub amount: f64 }

/// How the venue should read the order size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitHint { Base, Quote }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub client_id: String,
    pub side: Side,
    pub symbol: String,
    pub base: String,
    /// Size in base units.
    pub qty: f64,
    /// Same order expressed in quote currency (qty * reference price).
    pub notional: f64,
    pub unit: UnitHint,
}

/// What a venue reports back after a market order: the realised price and
/// quantity, the balance-delta fee and the post-trade balances of both legs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub base_after: f64,
    pub quote_after: f64,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub ts: DateTime<Utc>,
    pub request_id: Option<String>,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub reason: String,
    pub detail: String,
}

/// Outward events, consumed by the journal and by notification sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    TradeExecuted(Trade),
    ErrorOccurred(ErrorEvent),
    Liquidation(serde_json::Value),
    Note(String),
}

/// "btc/usdt" -> "BTCUSDT"
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Base asset of a normalized symbol quoted in `quote` ("ETHUSDT" -> "ETH").
pub fn base_asset(symbol: &str, quote: &str) -> Option<String> {
    symbol
        .strip_suffix(quote)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parse_is_case_insensitive() {
        assert_eq!(Side::parse(" BUY "), Some(Side::Buy));
        assert_eq!(Side::parse("Sell"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn symbols_split_into_base() {
        assert_eq!(normalize_symbol("eth/usdt"), "ETHUSDT");
        assert_eq!(base_asset("ETHUSDT", "USDT").as_deref(), Some("ETH"));
        assert_eq!(base_asset("USDT", "USDT"), None);
        assert_eq!(base_asset("ETHBTC", "USDT"), None);
    }

    #[test]
    fn signal_tolerates_missing_fields() {
        let s: Signal = serde_json::from_str(r#"{"action":"buy"}"#).unwrap();
        assert_eq!(s.action.as_deref(), Some("buy"));
        assert!(s.secret.is_none());
        assert!(s.usdt_amount.is_none());
    }
}
