// ===============================
// src/server.rs (HTTP surface: webhook, liquidation, read endpoints)
// ===============================
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use hyper::{
    body::to_bytes,
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::VenueMode;
use crate::domain::Signal;
use crate::engine::{Engine, Execution, SignalError};
use crate::liquidation;
use crate::metrics;
use crate::positions::{self, ProfitStats};

const DEFAULT_TRADES_LIMIT: u32 = 20;
const MAX_TRADES_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub mode: VenueMode,
    pub liquidation_pause: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct LiquidateBody {
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body.to_string()));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Some(b), Value::Object(e)) = (base.as_object_mut(), extra) {
        b.extend(e);
    }
    base
}

fn error_response(e: &SignalError) -> Response<Body> {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if status.is_server_error() {
        json!({ "status": "failed", "reason": e.reason(), "detail": format!("{e:?}") })
    } else {
        merge(json!({ "status": "Error", "reason": e.reason() }), e.context())
    };
    json_response(status, &body)
}

fn execution_response(x: &Execution) -> Response<Body> {
    let mut body = json!({
        "status": "ok",
        "request_id": x.request_id,
        "exchange": x.exchange,
        "order": x.order,
        "balance_after": x.balance_after,
        "profit": x.profit,
    });
    if x.duplicate {
        body["duplicate"] = json!(true);
    }
    json_response(StatusCode::OK, &body)
}

fn bad_request(detail: impl std::fmt::Display) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "status": "Error", "reason": "Invalid JSON", "detail": detail.to_string() }))
}

fn storage_failure(detail: impl std::fmt::Display) -> Response<Body> {
    error!(error = %detail, "read endpoint failed");
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &json!({ "status": "failed", "reason": "ledger error", "detail": detail.to_string() }),
    )
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn read_json<T: serde::de::DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let bytes = to_bytes(body).await.map_err(bad_request)?;
    serde_json::from_slice(&bytes).map_err(bad_request)
}

async fn handle_webhook(body: Body, state: &AppState) -> Response<Body> {
    let signal: Signal = match read_json(body).await {
        Ok(s) => s,
        Err(rsp) => return rsp,
    };
    debug!(action = ?signal.action, symbol = ?signal.symbol, exchange = ?signal.exchange, "webhook: signal");
    match state.engine.handle_signal(signal).await {
        Ok(x) => execution_response(&x),
        Err(e) => error_response(&e),
    }
}

async fn handle_liquidate(body: Body, state: &AppState) -> Response<Body> {
    let req: LiquidateBody = match read_json(body).await {
        Ok(b) => b,
        Err(rsp) => return rsp,
    };
    if let Err(e) = state.engine.authorize(req.secret.as_deref()) {
        return error_response(&e);
    }
    info!(exchange = ?req.exchange, "liquidation requested");
    match liquidation::sell_all(&state.engine, req.exchange.as_deref(), state.liquidation_pause).await {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => json_response(StatusCode::OK, &v),
            Err(e) => storage_failure(e),
        },
        Err(e) => error_response(&e),
    }
}

async fn handle_status(state: &AppState) -> Response<Body> {
    let venues: Vec<&str> = state.engine.venues().all().iter().map(|v| v.name()).collect();
    match state.engine.ledger().trade_count().await {
        Ok(trades) => json_response(
            StatusCode::OK,
            &json!({ "status": "ok", "mode": state.mode.as_str(), "venues": venues, "trades": trades }),
        ),
        Err(e) => storage_failure(e),
    }
}

async fn handle_balances(state: &AppState) -> Response<Body> {
    match state.engine.ledger().all_balances(None).await {
        Ok(rows) => json_response(StatusCode::OK, &json!({ "status": "ok", "balances": rows })),
        Err(e) => storage_failure(e),
    }
}

async fn handle_profit(state: &AppState) -> Response<Body> {
    match state.engine.ledger().profit_rows().await {
        Ok(rows) => {
            let stats = ProfitStats::from_rows(&rows);
            json_response(StatusCode::OK, &merge(json!({ "status": "ok" }), json!(stats)))
        }
        Err(e) => storage_failure(e),
    }
}

async fn handle_portfolio(state: &AppState) -> Response<Body> {
    let engine = &state.engine;
    match positions::portfolio(engine.ledger(), engine.venues(), &engine.limits().quote_asset).await {
        Ok(p) => json_response(StatusCode::OK, &merge(json!({ "status": "ok" }), json!(p))),
        Err(e) => storage_failure(e),
    }
}

async fn handle_trades(query: Option<&str>, state: &AppState) -> Response<Body> {
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_TRADES_LIMIT)
        .min(MAX_TRADES_LIMIT);
    match state.engine.ledger().recent_trades(limit).await {
        Ok(trades) => json_response(StatusCode::OK, &json!({ "status": "ok", "trades": trades })),
        Err(e) => storage_failure(e),
    }
}

fn handle_metrics() -> Response<Body> {
    let mut rsp = Response::new(Body::from(metrics::encode_metrics()));
    if let Ok(ct) = HeaderValue::from_str(&metrics::content_type()) {
        rsp.headers_mut().insert(CONTENT_TYPE, ct);
    }
    rsp
}

pub async fn route(req: Request<Body>, state: AppState) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    match (parts.method, path.as_str()) {
        (Method::POST, "/webhook") => handle_webhook(body, &state).await,
        (Method::POST, "/liquidate") => handle_liquidate(body, &state).await,
        (Method::GET, "/status") => handle_status(&state).await,
        (Method::GET, "/balances") => handle_balances(&state).await,
        (Method::GET, "/profit") => handle_profit(&state).await,
        (Method::GET, "/portfolio") => handle_portfolio(&state).await,
        (Method::GET, "/trades") => handle_trades(parts.uri.query(), &state).await,
        (Method::GET, "/metrics") => handle_metrics(),
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "status": "Error", "reason": "Not found" })),
    }
}

pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "http: listening");
    server.with_graceful_shutdown(shutdown).await
}
