// ===============================
// src/binance.rs (Binance spot REST adapter)
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::domain::{OrderRequest, Side, UnitHint};
use crate::sizing::floor_to_precision;
use crate::venue::{sign_payload, ExchangeApi, OrderAck, VenueError};

const VENUE: &str = "Binance";

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Decimal string without exponent and without trailing zeros ("2.500000" -> "2.5").
/// Truncates past 8 decimals; an order must never ask for more than was sized.
pub fn fmt_decimal(v: f64) -> String {
    let s = format!("{:.8}", floor_to_precision(v, 8));
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() { "0".to_string() } else { s.to_string() }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---- REST models ----
#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(default)]
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

fn parse_num(field: &str, raw: &str) -> Result<f64, VenueError> {
    raw.parse::<f64>().map_err(|_| VenueError::Decode {
        venue: VENUE,
        detail: format!("{field}={raw:?} is not a number"),
    })
}

pub struct BinanceClient {
    http: reqwest::Client,
    base_url: String,
    creds: Option<Credentials>,
    recv_window: u64,
}

impl BinanceClient {
    pub fn new(
        base_url: &str,
        creds: Option<Credentials>,
        recv_window: u64,
        timeout: Duration,
    ) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
            recv_window,
        })
    }

    fn creds(&self) -> Result<&Credentials, VenueError> {
        self.creds.as_ref().ok_or(VenueError::MissingCredentials(VENUE))
    }

    /// Append timestamp/recvWindow, sign the query and return `(url, api_key)`.
    fn signed_url(&self, path: &str, mut params: Vec<(&str, String)>) -> Result<(String, String), VenueError> {
        let creds = self.creds()?;
        params.push(("timestamp", timestamp_ms().to_string()));
        params.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_query(&params);
        let sig = sign_payload(VENUE, &creds.api_secret, &query)?;
        Ok((format!("{}{}?{}&signature={}", self.base_url, path, query, sig), creds.api_key.clone()))
    }

    async fn read<T: serde::de::DeserializeOwned>(rsp: reqwest::Response) -> Result<(T, serde_json::Value), VenueError> {
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(e) => VenueError::Api { venue: VENUE, code: e.code, msg: e.msg },
                Err(_) => VenueError::Api { venue: VENUE, code: i64::from(status.as_u16()), msg: body },
            });
        }
        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| VenueError::Decode { venue: VENUE, detail: e.to_string() })?;
        let typed = serde_json::from_value(raw.clone())
            .map_err(|e| VenueError::Decode { venue: VENUE, detail: e.to_string() })?;
        Ok((typed, raw))
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    fn name(&self) -> &'static str { VENUE }

    fn fallback_price(&self) -> f64 { 25_000.0 }

    fn unit_hint(&self, _side: Side) -> UnitHint { UnitHint::Base }

    async fn ticker_price(&self, symbol: &str) -> Result<f64, VenueError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let rsp = self.http.get(url).query(&[("symbol", symbol)]).send().await?;
        let (t, _) = Self::read::<TickerPrice>(rsp).await?;
        let px = parse_num("price", &t.price)?;
        debug!(venue = VENUE, %symbol, px, "ticker");
        Ok(px)
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, VenueError> {
        let (url, key) = self.signed_url("/api/v3/account", Vec::new())?;
        let rsp = self.http.get(url).header("X-MBX-APIKEY", key).send().await?;
        let (acct, _) = Self::read::<AccountInfo>(rsp).await?;
        match acct.balances.iter().find(|b| b.asset.eq_ignore_ascii_case(asset)) {
            Some(b) => parse_num("free", &b.free),
            None => Ok(0.0),
        }
    }

    async fn market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = vec![
            ("symbol", req.symbol.clone()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
        ];
        match req.unit {
            UnitHint::Base => params.push(("quantity", fmt_decimal(req.qty))),
            UnitHint::Quote => params.push(("quoteOrderQty", fmt_decimal(req.notional))),
        }
        // Binance caps client order ids at 36 chars; longer ids are left to the exchange.
        if !req.client_id.is_empty() && req.client_id.len() <= 36 {
            params.push(("newClientOrderId", req.client_id.clone()));
        }
        params.push(("newOrderRespType", "RESULT".to_string()));

        let (url, key) = self.signed_url("/api/v3/order", params)?;
        let rsp = self.http.post(url).header("X-MBX-APIKEY", key).send().await?;
        let (o, raw) = Self::read::<OrderResponse>(rsp).await?;

        let executed = o.executed_qty.as_deref().map(|q| parse_num("executedQty", q)).transpose()?;
        let quote = o.cummulative_quote_qty.as_deref().map(|q| parse_num("cummulativeQuoteQty", q)).transpose()?;
        let avg_price = match (executed, quote) {
            (Some(q), Some(c)) if q > 0.0 => Some(c / q),
            _ => None,
        };
        info!(venue = VENUE, client_id = %req.client_id, symbol = %req.symbol, ?executed, ?avg_price, "market order accepted");
        Ok(OrderAck { avg_price, executed_qty: executed, raw })
    }
}
