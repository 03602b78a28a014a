// ===============================
// src/bybit.rs (Bybit v5 spot REST adapter)
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::{debug, info};

use crate::binance::{fmt_decimal, timestamp_ms};
use crate::config::Credentials;
use crate::domain::{OrderRequest, Side, UnitHint};
use crate::venue::{sign_payload, ExchangeApi, OrderAck, VenueError};

const VENUE: &str = "Bybit";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    #[serde(default)]
    wallet_balance: String,
    #[serde(default)]
    available_to_withdraw: String,
}

impl WalletCoin {
    /// `availableToWithdraw` is blank on some unified accounts; fall back to the wallet total.
    fn free(&self) -> Option<f64> {
        self.available_to_withdraw
            .parse::<f64>()
            .ok()
            .or_else(|| self.wallet_balance.parse::<f64>().ok())
    }
}

pub struct BybitClient {
    http: reqwest::Client,
    base_url: String,
    creds: Option<Credentials>,
    recv_window: u64,
}

impl BybitClient {
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

    /// v5 auth headers; `payload` is the query string (GET) or the JSON body (POST).
    fn auth(&self, rb: reqwest::RequestBuilder, payload: &str) -> Result<reqwest::RequestBuilder, VenueError> {
        let creds = self.creds.as_ref().ok_or(VenueError::MissingCredentials(VENUE))?;
        let ts = timestamp_ms().to_string();
        let recv = self.recv_window.to_string();
        let sig = sign_payload(VENUE, &creds.api_secret, &format!("{ts}{}{recv}{payload}", creds.api_key))?;
        Ok(rb
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", ts)
            .header("X-BAPI-SIGN", sig)
            .header("X-BAPI-RECV-WINDOW", recv))
    }

    async fn read<T: DeserializeOwned>(rsp: reqwest::Response) -> Result<(T, serde_json::Value), VenueError> {
        let status = rsp.status();
        let body = rsp.text().await?;
        let raw: serde_json::Value = serde_json::from_str(&body).map_err(|_| VenueError::Api {
            venue: VENUE,
            code: i64::from(status.as_u16()),
            msg: body.clone(),
        })?;
        let head: Envelope<serde_json::Value> = serde_json::from_value(raw.clone())
            .map_err(|e| VenueError::Decode { venue: VENUE, detail: e.to_string() })?;
        if head.ret_code != 0 {
            return Err(VenueError::Api { venue: VENUE, code: head.ret_code, msg: head.ret_msg });
        }
        let result = head.result.ok_or_else(|| VenueError::Decode {
            venue: VENUE,
            detail: "missing result".to_string(),
        })?;
        let result = serde_json::from_value(result)
            .map_err(|e| VenueError::Decode { venue: VENUE, detail: e.to_string() })?;
        Ok((result, raw))
    }
}

#[async_trait]
impl ExchangeApi for BybitClient {
    fn name(&self) -> &'static str { VENUE }

    fn fallback_price(&self) -> f64 { 100.0 }

    // Spot market buys are sized in quote coin, sells in base coin.
    fn unit_hint(&self, side: Side) -> UnitHint {
        match side {
            Side::Buy => UnitHint::Quote,
            Side::Sell => UnitHint::Base,
        }
    }

    async fn ticker_price(&self, symbol: &str) -> Result<f64, VenueError> {
        let url = format!("{}/v5/market/tickers", self.base_url);
        let rsp = self
            .http
            .get(url)
            .query(&[("category", "spot"), ("symbol", symbol)])
            .send()
            .await?;
        let (res, _) = Self::read::<ListResult<Ticker>>(rsp).await?;
        let t = res.list.first().ok_or_else(|| VenueError::Decode {
            venue: VENUE,
            detail: format!("no ticker for {symbol}"),
        })?;
        let px = t.last_price.parse::<f64>().map_err(|_| VenueError::Decode {
            venue: VENUE,
            detail: format!("lastPrice={:?}", t.last_price),
        })?;
        debug!(venue = VENUE, %symbol, px, "ticker");
        Ok(px)
    }

    async fn free_balance(&self, asset: &str) -> Result<f64, VenueError> {
        let query = format!("accountType=UNIFIED&coin={}", urlencoding::encode(asset));
        let url = format!("{}/v5/account/wallet-balance?{}", self.base_url, query);
        let rsp = self.auth(self.http.get(url), &query)?.send().await?;
        let (res, _) = Self::read::<ListResult<WalletAccount>>(rsp).await?;
        let free = res
            .list
            .iter()
            .flat_map(|a| a.coin.iter())
            .find(|c| c.coin.eq_ignore_ascii_case(asset))
            .and_then(WalletCoin::free)
            .unwrap_or(0.0);
        Ok(free)
    }

    async fn market_order(&self, req: &OrderRequest) -> Result<OrderAck, VenueError> {
        let (qty, market_unit) = match req.unit {
            UnitHint::Quote => (fmt_decimal(req.notional), "quoteCoin"),
            UnitHint::Base => (fmt_decimal(req.qty), "baseCoin"),
        };
        let side = match req.side {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        };
        let mut body = json!({
            "category": "spot",
            "symbol": req.symbol,
            "side": side,
            "orderType": "Market",
            "qty": qty,
            "marketUnit": market_unit,
        });
        if !req.client_id.is_empty() && req.client_id.len() <= 36 {
            body["orderLinkId"] = json!(req.client_id);
        }
        let body = body.to_string();

        let url = format!("{}/v5/order/create", self.base_url);
        let rb = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone());
        let rsp = self.auth(rb, &body)?.send().await?;
        let (_, raw) = Self::read::<serde_json::Value>(rsp).await?;
        info!(venue = VENUE, client_id = %req.client_id, symbol = %req.symbol, %qty, %market_unit, "market order accepted");
        // create-order only acknowledges; the fill is read back from balances
        Ok(OrderAck { avg_price: None, executed_qty: None, raw })
    }
}
