// ===============================
// src/posttrade.rs
// ===============================
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::Event;

/// Log every outward event, then hand it to the journal (if one is configured).
/// Notification sinks hook in here as further consumers of the same stream.
pub async fn run(mut ev_rx: mpsc::Receiver<Event>, journal: Option<mpsc::Sender<Event>>) {
    while let Some(ev) = ev_rx.recv().await {
        match &ev {
            Event::TradeExecuted(t) => info!(
                request_id = %t.request_id, venue = %t.exchange, side = ?t.side, symbol = %t.symbol,
                qty = t.qty, price = t.price, fee = t.fee, profit = ?t.profit, "TRADE"
            ),
            Event::ErrorOccurred(e) => warn!(
                request_id = ?e.request_id, venue = ?e.exchange, symbol = ?e.symbol, side = ?e.side,
                reason = %e.reason, detail = %e.detail, "ERROR"
            ),
            Event::Liquidation(summary) => info!(
                successful = %summary["successful"], failed = %summary["failed"],
                total_profit = %summary["total_profit"], "LIQUIDATION"
            ),
            Event::Note(msg) => info!(%msg, "NOTE"),
        }
        if let Some(tx) = &journal {
            if tx.send(ev).await.is_err() {
                warn!("posttrade: journal channel closed");
            }
        }
    }
    info!("posttrade: event stream closed");
}
