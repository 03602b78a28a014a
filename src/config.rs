// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : signal_ledger: webhook signal execution & trade ledger in Rust
Module  : config.rs
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
use std::{env, str::FromStr, time::Duration};
use dotenvy::dotenv;

/// Mode eksekusi venue: akuntansi lokal (simulated) atau order sungguhan (live)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Simulated,
    Live,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<VenueMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "sim" | "test" | "mock" => Some(VenueMode::Simulated),
            "live" | "real" | "mainnet" => Some(VenueMode::Live),
            _ => None,
        }
    }

    pub fn from_env(key: &str, default_mode: VenueMode) -> VenueMode {
        env::var(key)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(default_mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Simulated => "simulated",
            VenueMode::Live => "live",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    fn from_env(key_var: &str, secret_var: &str) -> Option<Self> {
        let api_key = env::var(key_var).ok().filter(|s| !s.is_empty())?;
        let api_secret = env::var(secret_var).ok().filter(|s| !s.is_empty())?;
        Some(Self { api_key, api_secret })
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // intake
    pub webhook_secret: String,
    pub default_exchange: String,
    pub price_priority: bool,

    // mode
    pub venue_mode: VenueMode,
    pub test_balance_usdt: f64,
    pub sim_fee_rate: f64,

    // storage / files / http
    pub database_url: String,
    pub record_file: Option<String>,
    pub http_port: u16,

    // venues
    pub binance_rest_url: String,
    pub bybit_rest_url: String,
    pub binance_creds: Option<Credentials>,
    pub bybit_creds: Option<Credentials>,
    pub recv_window: u64,

    // timing
    pub venue_timeout: Duration,
    pub signal_timeout: Duration,
    pub liquidation_pause: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    /// Max share of the quote balance a single signal may request.
    pub max_balance_fraction: f64,
    /// Sells worth less than this (in quote) are refused.
    pub min_trade_usdt: f64,
    pub qty_precision: u32,
    pub quote_asset: String,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_balance_fraction: 0.10,
            min_trade_usdt: 1.0,
            qty_precision: 6,
            quote_asset: "USDT".to_string(),
        }
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().and_then(|s| parse_bool(&s)).unwrap_or(default)
}

pub fn load() -> (Args, Limits) {
    // Pastikan .env dibaca (WEBHOOK_SECRET, API key, dll)
    let _ = dotenv();

    // ===== Intake =====
    let webhook_secret = env::var("WEBHOOK_SECRET").unwrap_or_default();
    let default_exchange = env::var("DEFAULT_EXCHANGE")
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_else(|_| "bybit".to_string());
    let price_priority = env_bool("PRICE_PRIORITY", true);

    // ===== Mode =====
    let venue_mode = VenueMode::from_env("VENUE_MODE", VenueMode::Simulated);
    let test_balance_usdt = env_or("TEST_BALANCE_USDT", 100.0);
    let sim_fee_rate = env_or("SIM_FEE_RATE", 0.001);

    // ===== Storage / HTTP =====
    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://trades.db".to_string());
    let record_file = env::var("RECORD_FILE").ok().filter(|s| !s.is_empty());
    let http_port = env_or("HTTP_PORT", env_or("PORT", 8000u16));

    // ===== Venues =====
    let binance_rest_url = env::var("BINANCE_REST_URL")
        .unwrap_or_else(|_| "https://api.binance.com".to_string());
    let bybit_rest_url = env::var("BYBIT_REST_URL")
        .unwrap_or_else(|_| "https://api.bybit.com".to_string());
    let binance_creds = Credentials::from_env("API_KEY_BINANCE", "API_SECRET_BINANCE");
    let bybit_creds = Credentials::from_env("API_KEY_BYBIT", "API_SECRET_BYBIT");
    let recv_window = env_or("BINANCE_RECV_WINDOW", 5000u64);

    // ===== Timing =====
    let venue_timeout = Duration::from_secs(env_or("VENUE_TIMEOUT_SECS", 15u64));
    let signal_timeout = Duration::from_secs(env_or("SIGNAL_TIMEOUT_SECS", 30u64));
    let liquidation_pause = Duration::from_millis(env_or("LIQUIDATION_PAUSE_MS", 500u64));

    let args = Args {
        webhook_secret,
        default_exchange,
        price_priority,
        venue_mode,
        test_balance_usdt,
        sim_fee_rate,
        database_url,
        record_file,
        http_port,
        binance_rest_url,
        bybit_rest_url,
        binance_creds,
        bybit_creds,
        recv_window,
        venue_timeout,
        signal_timeout,
        liquidation_pause,
    };

    // ===== Limits =====
    let defaults = Limits::default();
    let limits = Limits {
        max_balance_fraction: env_or("MAX_BALANCE_FRACTION", defaults.max_balance_fraction),
        min_trade_usdt: env_or("MIN_TRADE_USDT", defaults.min_trade_usdt),
        qty_precision: env_or("QTY_PRECISION", defaults.qty_precision),
        quote_asset: env::var("QUOTE_ASSET")
            .map(|s| s.trim().to_ascii_uppercase())
            .unwrap_or(defaults.quote_asset),
    };
    (args, limits)
}
