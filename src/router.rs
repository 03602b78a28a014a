// ===============================
// src/router.rs (venue selection: best price for buys, holdings for sells)
// ===============================
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::ledger::{Ledger, LedgerError};
use crate::metrics::VENUE_PRICE;
use crate::risk::RiskError;
use crate::venue::{Venue, VenueRegistry};

struct Quote {
    venue: Arc<dyn Venue>,
    price: f64,
    balance: f64,
}

/// Cheapest venue whose quote balance covers `usdt_amount`; if the cheapest
/// cannot pay, the next one that can. Balance read failures count as zero.
pub async fn best_price_for_buy(
    venues: &VenueRegistry,
    symbol: &str,
    usdt_amount: f64,
    quote_asset: &str,
) -> Result<Arc<dyn Venue>, RiskError> {
    let quotes = join_all(venues.all().iter().map(|v| async move {
        let price = v.last_price(symbol).await;
        let balance = v.balance(quote_asset).await.unwrap_or_else(|e| {
            warn!(venue = v.name(), error = %e, "router: balance read failed, treating as 0");
            0.0
        });
        VENUE_PRICE.with_label_values(&[v.name()]).set(price);
        Quote { venue: v.clone(), price, balance }
    }))
    .await;

    let mut ranked = quotes;
    ranked.sort_by(|a, b| a.price.total_cmp(&b.price));
    for q in &ranked {
        debug!(venue = q.venue.name(), price = q.price, balance = q.balance, %symbol, "router: candidate");
    }

    if let Some(q) = ranked.iter().find(|q| q.balance >= usdt_amount) {
        info!(venue = q.venue.name(), price = q.price, %symbol, usdt_amount, "router: best price venue");
        return Ok(q.venue.clone());
    }
    Err(RiskError::InsufficientBalance {
        required: usdt_amount,
        balances: ranked.iter().map(|q| (q.venue.name().to_string(), q.balance)).collect(),
    })
}

/// Venue with the largest unsold quantity of `symbol`, if any holds some.
pub async fn holder_for_sell(
    ledger: &Ledger,
    venues: &VenueRegistry,
    symbol: &str,
) -> Result<Option<Arc<dyn Venue>>, LedgerError> {
    let Some((name, unsold)) = ledger.venue_with_most_unsold(symbol).await? else {
        return Ok(None);
    };
    match venues.get(&name) {
        Some(v) => {
            info!(venue = %name, unsold, %symbol, "router: sell routed to holder");
            Ok(Some(v))
        }
        None => {
            warn!(venue = %name, %symbol, "router: holder venue not configured");
            Ok(None)
        }
    }
}
