// ===============================
// src/ledger.rs
// ===============================
//
// SQLite ledger: an append-only `trades` log plus a `balances` table keyed by
// (exchange, coin).
// - `request_id` is UNIQUE; a repeated key is answered with `Recorded::Duplicate`.
// - `commit_trade` writes the trade row and the balance upserts in one
//   transaction. If the key already exists nothing is applied.
// - Unsold quantity and last buy price are always computed from the log.
//
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{BalanceRow, Side, Trade};
use crate::positions::ProfitRow;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("balance of {asset} on {venue} would go negative ({amount})")]
    NegativeBalance { venue: String, asset: String, amount: f64 },
    #[error("corrupt trade row {request_id}: {detail}")]
    Corrupt { request_id: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub asset: String,
    pub amount: f64,
}

// Sub-nano residue from float arithmetic is treated as zero, not as a negative balance.
const DUST: f64 = 1e-9;

const TRADE_COLUMNS: &str = "request_id, ts, exchange, side, symbol, price, qty, amount_usdt, \
                             fee, profit, profit_no_fees, balance_after, note";

#[derive(Clone, Debug)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }
        // An in-memory database lives inside one connection, so keep exactly one open.
        let pool = SqlitePoolOptions::new()
            .max_connections(if memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        info!(%url, "ledger: ready");
        Ok(ledger)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, LedgerError> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL UNIQUE,
                ts TEXT NOT NULL,
                exchange TEXT NOT NULL,
                side TEXT NOT NULL,
                symbol TEXT NOT NULL,
                price REAL NOT NULL,
                qty REAL NOT NULL,
                amount_usdt REAL NOT NULL,
                fee REAL NOT NULL,
                profit REAL,
                profit_no_fees REAL,
                balance_after REAL NOT NULL,
                note TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_exchange_symbol_side
             ON trades (exchange, symbol, side)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS balances (
                exchange TEXT NOT NULL,
                coin TEXT NOT NULL,
                amount REAL NOT NULL CHECK (amount >= 0),
                PRIMARY KEY (exchange, coin)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---------------- balances ----------------

    pub async fn get_balance(&self, venue: &str, asset: &str) -> Result<f64, LedgerError> {
        let amount = sqlx::query_scalar::<_, f64>(
            "SELECT amount FROM balances WHERE exchange = ? AND coin = ?",
        )
        .bind(venue)
        .bind(asset)
        .fetch_optional(&self.pool)
        .await?;
        Ok(amount.unwrap_or(0.0))
    }

    pub async fn set_balance(&self, venue: &str, asset: &str, amount: f64) -> Result<(), LedgerError> {
        let amount = non_negative(venue, asset, amount)?;
        sqlx::query(
            "INSERT INTO balances (exchange, coin, amount) VALUES (?, ?, ?)
             ON CONFLICT (exchange, coin) DO UPDATE SET amount = excluded.amount",
        )
        .bind(venue)
        .bind(asset)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-zero balances, optionally for one venue (case-insensitive).
    pub async fn all_balances(&self, venue: Option<&str>) -> Result<Vec<BalanceRow>, LedgerError> {
        let rows = sqlx::query(
            "SELECT exchange, coin, amount FROM balances
             WHERE amount > 0 AND (? IS NULL OR lower(exchange) = lower(?))
             ORDER BY exchange, coin",
        )
        .bind(venue)
        .bind(venue)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(BalanceRow {
                    exchange: r.try_get("exchange")?,
                    coin: r.try_get("coin")?,
                    amount: r.try_get("amount")?,
                })
            })
            .collect()
    }

    // ---------------- trades ----------------

    /// Plain insert, ignoring a repeated key.
    #[cfg(test)]
    pub async fn record_trade(&self, trade: &Trade) -> Result<Recorded, LedgerError> {
        self.commit_trade(trade, &[]).await
    }

    /// Insert `trade` and apply `updates` to the trade's venue as one unit.
    pub async fn commit_trade(
        &self,
        trade: &Trade,
        updates: &[BalanceUpdate],
    ) -> Result<Recorded, LedgerError> {
        let updates = updates
            .iter()
            .map(|u| Ok((u.asset.as_str(), non_negative(&trade.exchange, &u.asset, u.amount)?)))
            .collect::<Result<Vec<_>, LedgerError>>()?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO trades ({TRADE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (request_id) DO NOTHING"
        ))
        .bind(&trade.request_id)
        .bind(trade.ts)
        .bind(&trade.exchange)
        .bind(trade.side.as_str())
        .bind(&trade.symbol)
        .bind(trade.price)
        .bind(trade.qty)
        .bind(trade.amount_usdt)
        .bind(trade.fee)
        .bind(trade.profit)
        .bind(trade.profit_no_fees)
        .bind(trade.balance_after)
        .bind(&trade.note)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            warn!(request_id = %trade.request_id, "ledger: trade already recorded, skipping");
            return Ok(Recorded::Duplicate);
        }

        for (asset, amount) in updates {
            sqlx::query(
                "INSERT INTO balances (exchange, coin, amount) VALUES (?, ?, ?)
                 ON CONFLICT (exchange, coin) DO UPDATE SET amount = excluded.amount",
            )
            .bind(&trade.exchange)
            .bind(asset)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Recorded::Inserted)
    }

    pub async fn get_trade(&self, request_id: &str) -> Result<Option<Trade>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {TRADE_COLUMNS} FROM trades WHERE request_id = ?"))
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    pub async fn recent_trades(&self, limit: u32) -> Result<Vec<Trade>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades ORDER BY id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    pub async fn trade_count(&self) -> Result<i64, LedgerError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?)
    }

    // ---------------- reconciliation reads ----------------

    /// Bought minus sold for (venue, symbol), floored at zero.
    pub async fn unsold_quantity(&self, venue: &str, symbol: &str) -> Result<f64, LedgerError> {
        let net = sqlx::query_scalar::<_, f64>(
            "SELECT TOTAL(CASE WHEN side = 'buy' THEN qty ELSE 0.0 END)
                  - TOTAL(CASE WHEN side = 'sell' THEN qty ELSE 0.0 END)
             FROM trades WHERE exchange = ? AND symbol = ?",
        )
        .bind(venue)
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;
        Ok(if net > DUST { net } else { 0.0 })
    }

    /// Price of the most recently recorded buy for (venue, symbol).
    pub async fn last_buy_price(&self, venue: &str, symbol: &str) -> Result<Option<f64>, LedgerError> {
        Ok(sqlx::query_scalar::<_, f64>(
            "SELECT price FROM trades WHERE exchange = ? AND symbol = ? AND side = 'buy'
             ORDER BY id DESC LIMIT 1",
        )
        .bind(venue)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Venue holding the largest positive unsold quantity of `symbol`.
    pub async fn venue_with_most_unsold(&self, symbol: &str) -> Result<Option<(String, f64)>, LedgerError> {
        let row = sqlx::query(
            "SELECT exchange,
                    TOTAL(CASE WHEN side = 'buy' THEN qty ELSE 0.0 END)
                  - TOTAL(CASE WHEN side = 'sell' THEN qty ELSE 0.0 END) AS unsold
             FROM trades WHERE symbol = ?
             GROUP BY exchange
             HAVING unsold > ?
             ORDER BY unsold DESC
             LIMIT 1",
        )
        .bind(symbol)
        .bind(DUST)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some((r.try_get("exchange")?, r.try_get("unsold")?))),
            None => Ok(None),
        }
    }

    pub async fn profit_rows(&self) -> Result<Vec<ProfitRow>, LedgerError> {
        let rows = sqlx::query("SELECT profit, profit_no_fees, fee, amount_usdt FROM trades ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(ProfitRow {
                    profit: r.try_get("profit")?,
                    profit_no_fees: r.try_get("profit_no_fees")?,
                    fee: r.try_get("fee")?,
                    amount_usdt: r.try_get("amount_usdt")?,
                })
            })
            .collect()
    }
}

fn non_negative(venue: &str, asset: &str, amount: f64) -> Result<f64, LedgerError> {
    if !amount.is_finite() || amount < -DUST {
        return Err(LedgerError::NegativeBalance {
            venue: venue.to_string(),
            asset: asset.to_string(),
            amount,
        });
    }
    Ok(amount.max(0.0))
}

fn trade_from_row(r: &SqliteRow) -> Result<Trade, LedgerError> {
    let request_id: String = r.try_get("request_id")?;
    let side_raw: String = r.try_get("side")?;
    let side = Side::parse(&side_raw).ok_or_else(|| LedgerError::Corrupt {
        request_id: request_id.clone(),
        detail: format!("unknown side {side_raw:?}"),
    })?;
    let ts: DateTime<Utc> = r.try_get("ts")?;
    Ok(Trade {
        request_id,
        ts,
        exchange: r.try_get("exchange")?,
        side,
        symbol: r.try_get("symbol")?,
        price: r.try_get("price")?,
        qty: r.try_get("qty")?,
        amount_usdt: r.try_get("amount_usdt")?,
        fee: r.try_get("fee")?,
        profit: r.try_get("profit")?,
        profit_no_fees: r.try_get("profit_no_fees")?,
        balance_after: r.try_get("balance_after")?,
        note: r.try_get("note")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::trade;

    #[tokio::test]
    async fn unknown_balance_defaults_to_zero_and_upserts() {
        let l = Ledger::in_memory().await.unwrap();
        assert_eq!(l.get_balance("Bybit", "USDT").await.unwrap(), 0.0);
        l.set_balance("Bybit", "USDT", 100.0).await.unwrap();
        l.set_balance("Bybit", "USDT", 42.5).await.unwrap();
        assert_eq!(l.get_balance("Bybit", "USDT").await.unwrap(), 42.5);
        assert_eq!(l.get_balance("Binance", "USDT").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn negative_balance_is_refused_before_write() {
        let l = Ledger::in_memory().await.unwrap();
        l.set_balance("Bybit", "BTC", 1.0).await.unwrap();
        let err = l.set_balance("Bybit", "BTC", -0.5).await.unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        assert_eq!(l.get_balance("Bybit", "BTC").await.unwrap(), 1.0);

        let t = trade("r-neg", "Bybit", Side::Sell, "BTCUSDT", 10.0, 1.0);
        let err = l
            .commit_trade(&t, &[BalanceUpdate { asset: "BTC".into(), amount: -1.0 }])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NegativeBalance { .. }));
        assert!(l.get_trade("r-neg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_request_id_is_a_noop() {
        let l = Ledger::in_memory().await.unwrap();
        l.set_balance("Binance", "USDT", 1000.0).await.unwrap();
        let t = trade("r-1", "Binance", Side::Buy, "ETHUSDT", 50.0, 2.0);
        let upd = [
            BalanceUpdate { asset: "USDT".into(), amount: 900.0 },
            BalanceUpdate { asset: "ETH".into(), amount: 2.0 },
        ];
        assert_eq!(l.commit_trade(&t, &upd).await.unwrap(), Recorded::Inserted);

        let replay = [
            BalanceUpdate { asset: "USDT".into(), amount: 800.0 },
            BalanceUpdate { asset: "ETH".into(), amount: 4.0 },
        ];
        assert_eq!(l.commit_trade(&t, &replay).await.unwrap(), Recorded::Duplicate);
        assert_eq!(l.record_trade(&t).await.unwrap(), Recorded::Duplicate);

        assert_eq!(l.trade_count().await.unwrap(), 1);
        assert_eq!(l.get_balance("Binance", "USDT").await.unwrap(), 900.0);
        assert_eq!(l.get_balance("Binance", "ETH").await.unwrap(), 2.0);
        assert_eq!(l.get_trade("r-1").await.unwrap(), Some(t));
    }

    #[tokio::test]
    async fn unsold_tracks_bought_minus_sold_through_a_sequence() {
        let l = Ledger::in_memory().await.unwrap();
        let steps = [
            (Side::Buy, 1.5),
            (Side::Buy, 0.5),
            (Side::Sell, 1.0),
            (Side::Buy, 0.25),
            (Side::Sell, 1.25),
        ];
        let (mut bought, mut sold) = (0.0, 0.0);
        for (i, (side, qty)) in steps.iter().enumerate() {
            let t = trade(&format!("seq-{i}"), "Bybit", *side, "SOLUSDT", 20.0, *qty);
            l.record_trade(&t).await.unwrap();
            match side {
                Side::Buy => bought += qty,
                Side::Sell => sold += qty,
            }
            let unsold = l.unsold_quantity("Bybit", "SOLUSDT").await.unwrap();
            assert!(unsold >= 0.0);
            assert!((unsold - (bought - sold)).abs() < 1e-9, "step {i}");
        }
        assert_eq!(l.unsold_quantity("Bybit", "SOLUSDT").await.unwrap(), 0.0);
        assert_eq!(l.unsold_quantity("Binance", "SOLUSDT").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn last_buy_price_is_the_latest_buy_on_that_venue() {
        let l = Ledger::in_memory().await.unwrap();
        assert_eq!(l.last_buy_price("Bybit", "BTCUSDT").await.unwrap(), None);
        l.record_trade(&trade("a", "Bybit", Side::Buy, "BTCUSDT", 100.0, 1.0)).await.unwrap();
        l.record_trade(&trade("b", "Bybit", Side::Buy, "BTCUSDT", 120.0, 1.0)).await.unwrap();
        l.record_trade(&trade("c", "Bybit", Side::Sell, "BTCUSDT", 130.0, 1.0)).await.unwrap();
        l.record_trade(&trade("d", "Binance", Side::Buy, "BTCUSDT", 90.0, 1.0)).await.unwrap();
        assert_eq!(l.last_buy_price("Bybit", "BTCUSDT").await.unwrap(), Some(120.0));
        assert_eq!(l.last_buy_price("Binance", "BTCUSDT").await.unwrap(), Some(90.0));
    }

    #[tokio::test]
    async fn holder_lookup_prefers_largest_unsold() {
        let l = Ledger::in_memory().await.unwrap();
        assert_eq!(l.venue_with_most_unsold("ETHUSDT").await.unwrap(), None);
        l.record_trade(&trade("1", "Bybit", Side::Buy, "ETHUSDT", 10.0, 1.0)).await.unwrap();
        l.record_trade(&trade("2", "Binance", Side::Buy, "ETHUSDT", 10.0, 3.0)).await.unwrap();
        l.record_trade(&trade("3", "Binance", Side::Sell, "ETHUSDT", 10.0, 2.5)).await.unwrap();
        let (venue, unsold) = l.venue_with_most_unsold("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(venue, "Bybit");
        assert!((unsold - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn balances_listing_skips_zero_and_filters_by_venue() {
        let l = Ledger::in_memory().await.unwrap();
        l.set_balance("Bybit", "USDT", 10.0).await.unwrap();
        l.set_balance("Bybit", "DOT", 0.0).await.unwrap();
        l.set_balance("Binance", "BTC", 0.01).await.unwrap();
        assert_eq!(l.all_balances(None).await.unwrap().len(), 2);
        let only = l.all_balances(Some("binance")).await.unwrap();
        assert_eq!(only, vec![BalanceRow { exchange: "Binance".into(), coin: "BTC".into(), amount: 0.01 }]);
    }
}
