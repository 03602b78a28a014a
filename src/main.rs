// ===============================
// src/main.rs
// ===============================
/*
 # kirim sinyal beli (simulated mode, default venue bybit)
curl -s -XPOST localhost:8000/webhook -d '{"secret":"...","action":"buy","symbol":"ETHUSDT","usdt_amount":5}'

# saldo, trade terakhir, profit, metrik
curl -s localhost:8000/balances
curl -s 'localhost:8000/trades?limit=5'
curl -s localhost:8000/profit
curl -s localhost:8000/metrics | egrep '^(signals_total|trades_total|config_venue_mode)'

# jual semua koin di satu venue
curl -s -XPOST localhost:8000/liquidate -d '{"secret":"...","exchange":"bybit"}'
*/
/*
=============================================================================
Project : signal_ledger: webhook signal execution & trade ledger in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Accepts buy/sell signals over HTTP, routes them to Binance or
          Bybit (simulated or live), applies balance-fraction risk limits,
          records every fill idempotently in a SQLite ledger, exposes
          Prometheus metrics, and journals events as JSONL.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod posttrade;
mod ledger;
mod sizing;
mod risk;
mod positions;
mod venue;
mod binance;          // Venue A: Binance spot REST
mod bybit;            // Venue B: Bybit v5 REST
mod router;
mod engine;
mod liquidation;
mod server;
#[cfg(test)]
mod testkit;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::VenueMode;
use crate::domain::Event;
use crate::engine::Engine;
use crate::ledger::Ledger;
use crate::venue::{ExchangeApi, LiveVenue, SimulatedVenue, VenueRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config & limits ----
    let (args, limits) = config::load();

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_VENUE_MODE
        .with_label_values(&[args.venue_mode.as_str()])
        .set(1);

    info!(
        venue_mode = %args.venue_mode.as_str(),
        default_exchange = %args.default_exchange,
        price_priority = args.price_priority,
        database = %args.database_url,
        http_port = args.http_port,
        max_balance_fraction = limits.max_balance_fraction,
        quote = %limits.quote_asset,
        binance_rest = %args.binance_rest_url,
        bybit_rest = %args.bybit_rest_url,
        "startup config"
    );
    if args.webhook_secret.is_empty() {
        warn!("WEBHOOK_SECRET is empty: every signal will be refused");
    }

    // ---- Ledger ----
    let ledger = Ledger::connect(&args.database_url)
        .await
        .with_context(|| format!("open ledger at {}", args.database_url))?;

    // ---- Venues (mode dipilih sekali di sini) ----
    let binance: Arc<dyn ExchangeApi> = Arc::new(binance::BinanceClient::new(
        &args.binance_rest_url,
        args.binance_creds.clone(),
        args.recv_window,
        args.venue_timeout,
    )?);
    let bybit: Arc<dyn ExchangeApi> = Arc::new(bybit::BybitClient::new(
        &args.bybit_rest_url,
        args.bybit_creds.clone(),
        args.recv_window,
        args.venue_timeout,
    )?);
    let apis = [
        (binance, args.binance_creds.is_some()),
        (bybit, args.bybit_creds.is_some()),
    ];
    let mut venues = VenueRegistry::new(&args.default_exchange);
    for (api, has_creds) in apis {
        match args.venue_mode {
            VenueMode::Simulated => venues.register(Arc::new(SimulatedVenue::new(
                api,
                ledger.clone(),
                args.sim_fee_rate,
                limits.quote_asset.clone(),
            ))),
            VenueMode::Live => {
                if !has_creds {
                    warn!(venue = api.name(), "live mode without API credentials: orders will fail");
                }
                venues.register(Arc::new(LiveVenue::new(api, limits.quote_asset.clone())));
            }
        }
    }
    if venues.default_venue().is_none() {
        warn!(default = %args.default_exchange, "DEFAULT_EXCHANGE is not a configured venue");
    }

    // ---- Events: engine -> posttrade -> recorder (opsional) ----
    let (ev_tx, ev_rx) = mpsc::channel::<Event>(1024);
    let (journal_tx, recorder_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };
    let posttrade_task = tokio::spawn(posttrade::run(ev_rx, journal_tx));

    // ---- Engine ----
    let engine = Engine::new(ledger, venues, limits, args.webhook_secret.clone())
        .with_price_priority(args.price_priority)
        .with_signal_timeout(args.signal_timeout)
        .with_events(ev_tx);
    engine
        .seed_balances(args.venue_mode, args.test_balance_usdt)
        .await
        .context("seed balances")?;

    // ---- HTTP ----
    let state = server::AppState {
        engine: Arc::new(engine),
        mode: args.venue_mode,
        liquidation_pause: args.liquidation_pause,
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    server::serve(state, addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("http server")?;

    // Server dropped -> engine dropped -> event channel closes -> pipeline drains.
    let _ = posttrade_task.await;
    if let Some(task) = recorder_task {
        let _ = task.await;
    }
    info!("bye");
    Ok(())
}
