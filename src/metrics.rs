// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Metric names/labels below are compile-time constants, so construction can only
// fail on a programming error.
fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(Opts::new(name, help), labels).expect("metric definition")
}

// -------- Intake --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "signals_total",
        "signals by terminal outcome (executed, duplicate, auth, validation, risk, invalid_exchange, failed)",
        &["outcome"],
    )
});

// Latency from signal accepted -> trade committed (milliseconds)
pub static SIGNAL_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("signal_latency_ms", "Latency from signal to committed trade (ms)")
            .buckets(vec![5.0, 25.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0]),
    )
    .expect("metric definition")
});

// -------- Execution --------
pub static TRADES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("trades_total", "committed trades", &["venue", "side"]));

pub static VENUE_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("venue_errors_total", "venue call failures", &["venue", "op"]));

pub static PRICE_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("price_fallbacks_total", "market-data reads replaced by the fallback price", &["venue"])
});

pub static VENUE_PRICE: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("venue_last_price", "last price seen by the router", &["venue"]));

// -------- Liquidation / events --------
pub static LIQUIDATIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("liquidations_total", "bulk sell-off assets by result", &["result"]));

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("events_dropped_total", "outward events dropped on a full channel")
        .expect("metric definition")
});

// ---- Config visibility ----
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_venue_mode", "venue mode (label: mode)"), &["mode"])
        .expect("metric definition")
});

pub fn init() {
    // Register all metrics to the custom registry; a second call only reports AlreadyReg.
    for m in [
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(SIGNAL_LATENCY.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(VENUE_ERRORS.clone())),
        REGISTRY.register(Box::new(PRICE_FALLBACKS.clone())),
        REGISTRY.register(Box::new(VENUE_PRICE.clone())),
        REGISTRY.register(Box::new(LIQUIDATIONS.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
