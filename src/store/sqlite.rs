//! SQLite-backed record store.
//!
//! Decimals are stored as TEXT to avoid float drift; timestamps as
//! RFC 3339 strings.

use crate::error::{BotError, Result};
use crate::store::{
    FundingSummary, LedgerEntry, LedgerTitle, OpCheckpoint, OpKind, Portfolio, RecordStore,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| {
            BotError::Store(format!(
                "failed to open database at {:?}: {e}",
                db_path.as_ref()
            ))
        })?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("record store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                instrument TEXT NOT NULL,
                title TEXT NOT NULL,
                amount TEXT NOT NULL,
                price TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_book ON ledger(account_id, instrument);
            CREATE INDEX IF NOT EXISTS idx_ledger_title ON ledger(title);

            CREATE TABLE IF NOT EXISTS portfolios (
                account_id INTEGER NOT NULL,
                instrument TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                size TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, instrument)
            );

            -- At most one in-flight operation per book
            CREATE TABLE IF NOT EXISTS op_checkpoints (
                account_id INTEGER NOT NULL,
                instrument TEXT NOT NULL,
                op TEXT NOT NULL,
                remaining TEXT NOT NULL,
                started_at TEXT NOT NULL,
                PRIMARY KEY (account_id, instrument)
            );
            "#,
        )?;

        debug!("database schema initialized");
        Ok(())
    }
}

fn parse_decimal(raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

impl RecordStore for SqliteStore {
    fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO ledger (account_id, instrument, title, amount, price, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.account_id,
                entry.instrument,
                entry.title.as_str(),
                entry.amount.to_string(),
                entry.price.to_string(),
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn recent_ledger(
        &self,
        account_id: i64,
        instrument: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT title, amount, price, timestamp
            FROM ledger
            WHERE account_id = ?1 AND instrument = ?2
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![account_id, instrument, limit], |row| {
            let title_raw: String = row.get(0)?;
            let amount_raw: String = row.get(1)?;
            let price_raw: String = row.get(2)?;
            let ts_raw: String = row.get(3)?;
            Ok((title_raw, amount_raw, price_raw, ts_raw))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (title_raw, amount_raw, price_raw, ts_raw) = row?;
            let Some(title) = LedgerTitle::parse(&title_raw) else {
                // Unknown titles are skipped rather than failing the read.
                continue;
            };
            entries.push(LedgerEntry {
                account_id,
                instrument: instrument.to_string(),
                title,
                amount: Decimal::from_str(&amount_raw)
                    .map_err(|e| BotError::Store(format!("bad ledger amount: {e}")))?,
                price: Decimal::from_str(&price_raw)
                    .map_err(|e| BotError::Store(format!("bad ledger price: {e}")))?,
                timestamp: DateTime::parse_from_rfc3339(&ts_raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| BotError::Store(format!("bad ledger timestamp: {e}")))?,
            });
        }
        Ok(entries)
    }

    fn funding_recorded_at(
        &self,
        account_id: i64,
        instrument: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            r#"
            SELECT COUNT(*) FROM ledger
            WHERE account_id = ?1 AND instrument = ?2 AND title = 'funding' AND timestamp = ?3
            "#,
            params![account_id, instrument, timestamp.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn funding_summary(
        &self,
        account_id: i64,
        instrument: &str,
    ) -> Result<Option<FundingSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT amount, timestamp FROM ledger
            WHERE account_id = ?1 AND instrument = ?2 AND title = 'funding'
            "#,
        )?;

        let rows = stmt.query_map(params![account_id, instrument], |row| {
            let amount_raw: String = row.get(0)?;
            let ts_raw: String = row.get(1)?;
            Ok((parse_decimal(&amount_raw)?, parse_timestamp(&ts_raw)?))
        })?;

        let mut summary: Option<FundingSummary> = None;
        for row in rows {
            let (amount, ts) = row?;
            match summary.as_mut() {
                None => {
                    summary = Some(FundingSummary {
                        total: amount,
                        first: ts,
                        last: ts,
                        count: 1,
                    });
                }
                Some(s) => {
                    s.total += amount;
                    s.first = s.first.min(ts);
                    s.last = s.last.max(ts);
                    s.count += 1;
                }
            }
        }
        Ok(summary)
    }

    fn find_portfolio(&self, account_id: i64, instrument: &str) -> Result<Option<Portfolio>> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT leverage, size, updated_at FROM portfolios
                WHERE account_id = ?1 AND instrument = ?2
                "#,
                params![account_id, instrument],
                |row| {
                    let leverage: u32 = row.get(0)?;
                    let size_raw: String = row.get(1)?;
                    let ts_raw: String = row.get(2)?;
                    Ok((leverage, parse_decimal(&size_raw)?, parse_timestamp(&ts_raw)?))
                },
            )
            .optional()?;

        Ok(row.map(|(leverage, size, updated_at)| Portfolio {
            account_id,
            instrument: instrument.to_string(),
            leverage,
            size,
            updated_at,
        }))
    }

    fn upsert_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO portfolios (account_id, instrument, leverage, size, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, instrument) DO UPDATE SET
                leverage = ?3,
                size = ?4,
                updated_at = ?5
            "#,
            params![
                portfolio.account_id,
                portfolio.instrument,
                portfolio.leverage,
                portfolio.size.to_string(),
                portfolio.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn find_checkpoint(&self, account_id: i64, instrument: &str) -> Result<Option<OpCheckpoint>> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT op, remaining, started_at FROM op_checkpoints
                WHERE account_id = ?1 AND instrument = ?2
                "#,
                params![account_id, instrument],
                |row| {
                    let op_raw: String = row.get(0)?;
                    let remaining_raw: String = row.get(1)?;
                    let ts_raw: String = row.get(2)?;
                    Ok((op_raw, parse_decimal(&remaining_raw)?, parse_timestamp(&ts_raw)?))
                },
            )
            .optional()?;

        let Some((op_raw, remaining, started_at)) = row else {
            return Ok(None);
        };
        let op = OpKind::parse(&op_raw)
            .ok_or_else(|| BotError::Store(format!("unknown checkpoint op '{op_raw}'")))?;
        Ok(Some(OpCheckpoint {
            account_id,
            instrument: instrument.to_string(),
            op,
            remaining,
            started_at,
        }))
    }

    fn put_checkpoint(&self, checkpoint: &OpCheckpoint) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO op_checkpoints (account_id, instrument, op, remaining, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, instrument) DO UPDATE SET
                op = ?3,
                remaining = ?4,
                started_at = ?5
            "#,
            params![
                checkpoint.account_id,
                checkpoint.instrument,
                checkpoint.op.as_str(),
                checkpoint.remaining.to_string(),
                checkpoint.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn clear_checkpoint(&self, account_id: i64, instrument: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM op_checkpoints WHERE account_id = ?1 AND instrument = ?2",
            params![account_id, instrument],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(title: LedgerTitle, amount: Decimal) -> LedgerEntry {
        LedgerEntry {
            account_id: 1,
            instrument: "BTC".to_string(),
            title,
            amount,
            price: dec!(50000),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ledger_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_ledger(&entry(LedgerTitle::SpotBuy, dec!(1000.5)))
            .unwrap();
        store
            .append_ledger(&entry(LedgerTitle::SwapOpenShort, dec!(1000.2)))
            .unwrap();

        let rows = store.recent_ledger(1, "BTC", 10).unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first.
        assert_eq!(rows[0].title, LedgerTitle::SwapOpenShort);
        assert_eq!(rows[1].amount, dec!(1000.5));
    }

    #[test]
    fn test_funding_summary_and_dedup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ts = Utc::now();
        let mut row = entry(LedgerTitle::Funding, dec!(1.25));
        row.timestamp = ts;
        store.append_ledger(&row).unwrap();

        assert!(store.funding_recorded_at(1, "BTC", ts).unwrap());
        let summary = store.funding_summary(1, "BTC").unwrap().unwrap();
        assert_eq!(summary.total, dec!(1.25));
        assert_eq!(summary.count, 1);

        // Other books are not visible.
        assert!(store.funding_summary(2, "BTC").unwrap().is_none());
    }

    #[test]
    fn test_portfolio_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut portfolio = Portfolio {
            account_id: 1,
            instrument: "BTC".to_string(),
            leverage: 3,
            size: dec!(0.4),
            updated_at: Utc::now(),
        };
        store.upsert_portfolio(&portfolio).unwrap();

        portfolio.size = dec!(0.5);
        store.upsert_portfolio(&portfolio).unwrap();

        let loaded = store.find_portfolio(1, "BTC").unwrap().unwrap();
        assert_eq!(loaded.leverage, 3);
        assert_eq!(loaded.size, dec!(0.5));
        assert!(store.find_portfolio(2, "BTC").unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_replaces_and_clears() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cp = OpCheckpoint {
            account_id: 1,
            instrument: "BTC".to_string(),
            op: OpKind::Add,
            remaining: dec!(40),
            started_at: Utc::now(),
        };
        store.put_checkpoint(&cp).unwrap();

        let mut updated = cp.clone();
        updated.remaining = dec!(10);
        store.put_checkpoint(&updated).unwrap();

        let loaded = store.find_checkpoint(1, "BTC").unwrap().unwrap();
        assert_eq!(loaded.remaining, dec!(10));

        store.clear_checkpoint(1, "BTC").unwrap();
        assert!(store.find_checkpoint(1, "BTC").unwrap().is_none());
    }
}
