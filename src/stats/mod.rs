//! Rolling spot/swap spread statistics.
//!
//! Samples of the opening and closing spread are recorded continuously;
//! the controller asks for the mean and standard deviation over a recent
//! window when it prices an escalated reduction or decides whether a
//! funding window is worth closing into.

use crate::error::{BotError, Result};
use crate::exchange::types::Ticker;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Samples older than this are pruned on insert.
const RETENTION_DAYS: i64 = 7;

/// Mean and population standard deviation of a spread window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadStat {
    pub avg: Decimal,
    pub std: Decimal,
}

/// Windowed spread statistics. `None` means the window holds no samples;
/// callers treat that as fatal rather than guessing a spread.
#[async_trait]
pub trait SpreadStats: Send + Sync {
    /// Stats of the spread paid when opening (buy spot at ask, sell swap at bid).
    async fn open_stat(&self, instrument: &str, hours: u32) -> Result<Option<SpreadStat>>;

    /// Stats of the spread paid when closing (sell spot at bid, buy swap at ask).
    async fn close_stat(&self, instrument: &str, hours: u32) -> Result<Option<SpreadStat>>;
}

/// Mean and population std over raw samples.
fn stat_of(values: &[Decimal]) -> Option<SpreadStat> {
    if values.is_empty() {
        return None;
    }
    let n = Decimal::from(values.len());
    let avg = values.iter().copied().sum::<Decimal>() / n;

    // Variance in f64; spread magnitudes are tiny so precision loss is
    // immaterial for a std estimate.
    let avg_f = avg.to_f64().unwrap_or(0.0);
    let variance = values
        .iter()
        .map(|v| {
            let d = v.to_f64().unwrap_or(0.0) - avg_f;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    let std = Decimal::from_f64(variance.sqrt()).unwrap_or(Decimal::ZERO);

    Some(SpreadStat { avg, std })
}

/// SQLite-backed sample log.
pub struct SqliteSpreadStats {
    conn: Mutex<Connection>,
}

impl SqliteSpreadStats {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| {
            BotError::Store(format!(
                "failed to open spread database at {:?}: {e}",
                db_path.as_ref()
            ))
        })?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS spread_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                open_pd TEXT NOT NULL,
                close_pd TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_spread_book ON spread_samples(instrument, timestamp);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one spread sample from simultaneous spot and swap tickers.
    pub fn record(&self, instrument: &str, spot: &Ticker, swap: &Ticker) -> Result<()> {
        if spot.ask_price.is_zero() || spot.bid_price.is_zero() {
            return Err(BotError::Store("spot ticker has empty book".to_string()));
        }
        let open_pd = (swap.bid_price - spot.ask_price) / spot.ask_price;
        let close_pd = (swap.ask_price - spot.bid_price) / spot.bid_price;

        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO spread_samples (instrument, open_pd, close_pd, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                instrument,
                open_pd.to_string(),
                close_pd.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        conn.execute(
            "DELETE FROM spread_samples WHERE timestamp < ?1",
            params![(Utc::now() - Duration::days(RETENTION_DAYS)).to_rfc3339()],
        )?;
        debug!(%instrument, %open_pd, %close_pd, "spread sample recorded");
        Ok(())
    }

    fn window(&self, instrument: &str, column: &str, hours: u32) -> Result<Vec<Decimal>> {
        // Column name is one of two internal constants, never user input.
        let sql = format!(
            "SELECT {column} FROM spread_samples WHERE instrument = ?1 AND timestamp >= ?2"
        );
        let cutoff = (Utc::now() - Duration::hours(i64::from(hours))).to_rfc3339();

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![instrument, cutoff], |row| {
            row.get::<_, String>(0)
        })?;

        let mut values = Vec::new();
        for row in rows {
            let raw = row?;
            values.push(
                Decimal::from_str(&raw)
                    .map_err(|e| BotError::Store(format!("bad spread sample: {e}")))?,
            );
        }
        Ok(values)
    }
}

#[async_trait]
impl SpreadStats for SqliteSpreadStats {
    async fn open_stat(&self, instrument: &str, hours: u32) -> Result<Option<SpreadStat>> {
        Ok(stat_of(&self.window(instrument, "open_pd", hours)?))
    }

    async fn close_stat(&self, instrument: &str, hours: u32) -> Result<Option<SpreadStat>> {
        Ok(stat_of(&self.window(instrument, "close_pd", hours)?))
    }
}

/// Fixed stats for tests.
pub struct FixedStats {
    pub open: Option<SpreadStat>,
    pub close: Option<SpreadStat>,
}

impl FixedStats {
    pub fn new(open: Option<SpreadStat>, close: Option<SpreadStat>) -> Self {
        Self { open, close }
    }

    /// Provider with no samples at all.
    pub fn empty() -> Self {
        Self::new(None, None)
    }
}

#[async_trait]
impl SpreadStats for FixedStats {
    async fn open_stat(&self, _instrument: &str, _hours: u32) -> Result<Option<SpreadStat>> {
        Ok(self.open)
    }

    async fn close_stat(&self, _instrument: &str, _hours: u32) -> Result<Option<SpreadStat>> {
        Ok(self.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::ticker;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stat_of_empty_is_none() {
        assert!(stat_of(&[]).is_none());
    }

    #[test]
    fn test_stat_of_constant_series_has_zero_std() {
        let stat = stat_of(&[dec!(0.001), dec!(0.001), dec!(0.001)]).unwrap();
        assert_eq!(stat.avg, dec!(0.001));
        assert_eq!(stat.std, Decimal::ZERO);
    }

    #[test]
    fn test_stat_of_mean() {
        let stat = stat_of(&[dec!(0.001), dec!(0.003)]).unwrap();
        assert_eq!(stat.avg, dec!(0.002));
        assert!(stat.std > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_record_and_query_window() {
        let stats = SqliteSpreadStats::open_in_memory().unwrap();
        let spot = ticker("BTC-USDT", dec!(50000), dec!(49999), dec!(1), dec!(50001), dec!(1));
        let swap = ticker(
            "BTC-USDT-SWAP",
            dec!(50010),
            dec!(50009),
            dec!(1),
            dec!(50011),
            dec!(1),
        );
        stats.record("BTC", &spot, &swap).unwrap();
        stats.record("BTC", &spot, &swap).unwrap();

        let open = stats.open_stat("BTC", 1).await.unwrap().unwrap();
        // (50009 - 50001) / 50001
        assert!(open.avg > Decimal::ZERO);
        assert_eq!(open.std, Decimal::ZERO);

        // No samples for an unknown instrument.
        assert!(stats.open_stat("ETH", 1).await.unwrap().is_none());
    }
}
