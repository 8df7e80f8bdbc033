//! Trade ledger and portfolio persistence.
//!
//! The controller and executor record everything money-shaped here:
//! executed slices, realized funding, and the in-flight operation
//! checkpoint that lets a restarted process resume a partially executed
//! rebalance.

pub mod sqlite;

use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub use sqlite::SqliteStore;

/// What a ledger row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerTitle {
    /// Realized funding fee settlement.
    Funding,
    /// Position opened from flat.
    Open,
    /// Position fully closed.
    Close,
    /// Liquidation-price-triggered position increase.
    AutoAdd,
    /// Liquidation-price-triggered position decrease.
    AutoReduce,
    SpotBuy,
    SpotSell,
    SwapOpenShort,
    SwapCloseShort,
    /// Trade fees paid over one operation.
    Fee,
    /// Terminal notice written just before the controller halts on a
    /// fatal condition.
    Halt,
}

impl LedgerTitle {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerTitle::Funding => "funding",
            LedgerTitle::Open => "open",
            LedgerTitle::Close => "close",
            LedgerTitle::AutoAdd => "auto_add",
            LedgerTitle::AutoReduce => "auto_reduce",
            LedgerTitle::SpotBuy => "spot_buy",
            LedgerTitle::SpotSell => "spot_sell",
            LedgerTitle::SwapOpenShort => "swap_open_short",
            LedgerTitle::SwapCloseShort => "swap_close_short",
            LedgerTitle::Fee => "fee",
            LedgerTitle::Halt => "halt",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "funding" => LedgerTitle::Funding,
            "open" => LedgerTitle::Open,
            "close" => LedgerTitle::Close,
            "auto_add" => LedgerTitle::AutoAdd,
            "auto_reduce" => LedgerTitle::AutoReduce,
            "spot_buy" => LedgerTitle::SpotBuy,
            "spot_sell" => LedgerTitle::SpotSell,
            "swap_open_short" => LedgerTitle::SwapOpenShort,
            "swap_close_short" => LedgerTitle::SwapCloseShort,
            "fee" => LedgerTitle::Fee,
            "halt" => LedgerTitle::Halt,
            _ => return None,
        })
    }
}

/// One ledger row. `amount` is quote-currency notional for trades,
/// realized pnl for funding rows, total cost for fee rows.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: i64,
    pub instrument: String,
    pub title: LedgerTitle,
    pub amount: Decimal,
    /// Reference price at execution time; zero when not applicable.
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Tracked book for one account and instrument. Created when a position
/// is opened; the controller reads `leverage` from it and writes back
/// only `size`.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub account_id: i64,
    pub instrument: String,
    /// Target swap leverage for the book.
    pub leverage: u32,
    /// Hedged size in underlying units, backfilled after each operation.
    pub size: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Direction of an in-flight rebalance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Reduce,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Reduce => "reduce",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(OpKind::Add),
            "reduce" => Some(OpKind::Reduce),
            _ => None,
        }
    }
}

/// Checkpoint written before an executor starts trading and deleted when
/// it completes, so a restart can detect an interrupted operation.
#[derive(Debug, Clone)]
pub struct OpCheckpoint {
    pub account_id: i64,
    pub instrument: String,
    pub op: OpKind,
    /// Swap contracts still to execute.
    pub remaining: Decimal,
    pub started_at: DateTime<Utc>,
}

/// Aggregate view over funding ledger rows.
#[derive(Debug, Clone)]
pub struct FundingSummary {
    pub total: Decimal,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub count: u64,
}

/// Synchronous record store. SQLite in production, in-memory in tests.
pub trait RecordStore: Send + Sync {
    fn append_ledger(&self, entry: &LedgerEntry) -> Result<()>;

    /// Most recent ledger rows for one book, newest first.
    fn recent_ledger(&self, account_id: i64, instrument: &str, limit: usize)
        -> Result<Vec<LedgerEntry>>;

    /// Whether a funding row already exists at this settlement timestamp.
    /// Used to deduplicate backfill against the live recorder.
    fn funding_recorded_at(
        &self,
        account_id: i64,
        instrument: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool>;

    fn funding_summary(&self, account_id: i64, instrument: &str)
        -> Result<Option<FundingSummary>>;

    fn find_portfolio(&self, account_id: i64, instrument: &str) -> Result<Option<Portfolio>>;

    fn upsert_portfolio(&self, portfolio: &Portfolio) -> Result<()>;

    fn find_checkpoint(&self, account_id: i64, instrument: &str) -> Result<Option<OpCheckpoint>>;

    /// Insert or replace the checkpoint for this book.
    fn put_checkpoint(&self, checkpoint: &OpCheckpoint) -> Result<()>;

    fn clear_checkpoint(&self, account_id: i64, instrument: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    ledger: Vec<LedgerEntry>,
    portfolios: HashMap<(i64, String), Portfolio>,
    checkpoints: HashMap<(i64, String), OpCheckpoint>,
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for MemoryStore {
    fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        self.inner().ledger.push(entry.clone());
        Ok(())
    }

    fn recent_ledger(
        &self,
        account_id: i64,
        instrument: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .inner()
            .ledger
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id && e.instrument == instrument)
            .take(limit)
            .cloned()
            .collect())
    }

    fn funding_recorded_at(
        &self,
        account_id: i64,
        instrument: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.inner().ledger.iter().any(|e| {
            e.account_id == account_id
                && e.instrument == instrument
                && e.title == LedgerTitle::Funding
                && e.timestamp == timestamp
        }))
    }

    fn funding_summary(
        &self,
        account_id: i64,
        instrument: &str,
    ) -> Result<Option<FundingSummary>> {
        let inner = self.inner();
        let mut rows = inner
            .ledger
            .iter()
            .filter(|e| {
                e.account_id == account_id
                    && e.instrument == instrument
                    && e.title == LedgerTitle::Funding
            })
            .peekable();
        let Some(first) = rows.peek() else {
            return Ok(None);
        };
        let mut summary = FundingSummary {
            total: Decimal::ZERO,
            first: first.timestamp,
            last: first.timestamp,
            count: 0,
        };
        for row in rows {
            summary.total += row.amount;
            summary.first = summary.first.min(row.timestamp);
            summary.last = summary.last.max(row.timestamp);
            summary.count += 1;
        }
        Ok(Some(summary))
    }

    fn find_portfolio(&self, account_id: i64, instrument: &str) -> Result<Option<Portfolio>> {
        Ok(self
            .inner()
            .portfolios
            .get(&(account_id, instrument.to_string()))
            .cloned())
    }

    fn upsert_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        self.inner().portfolios.insert(
            (portfolio.account_id, portfolio.instrument.clone()),
            portfolio.clone(),
        );
        Ok(())
    }

    fn find_checkpoint(&self, account_id: i64, instrument: &str) -> Result<Option<OpCheckpoint>> {
        Ok(self
            .inner()
            .checkpoints
            .get(&(account_id, instrument.to_string()))
            .cloned())
    }

    fn put_checkpoint(&self, checkpoint: &OpCheckpoint) -> Result<()> {
        self.inner().checkpoints.insert(
            (checkpoint.account_id, checkpoint.instrument.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    fn clear_checkpoint(&self, account_id: i64, instrument: &str) -> Result<()> {
        self.inner()
            .checkpoints
            .remove(&(account_id, instrument.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn funding_row(ts: DateTime<Utc>, amount: Decimal) -> LedgerEntry {
        LedgerEntry {
            account_id: 1,
            instrument: "BTC".to_string(),
            title: LedgerTitle::Funding,
            amount,
            price: Decimal::ZERO,
            timestamp: ts,
        }
    }

    #[test]
    fn test_funding_dedup_by_timestamp() {
        let store = MemoryStore::new();
        let ts = Utc::now();
        store.append_ledger(&funding_row(ts, dec!(1.5))).unwrap();

        assert!(store.funding_recorded_at(1, "BTC", ts).unwrap());
        assert!(!store
            .funding_recorded_at(1, "BTC", ts + chrono::Duration::hours(8))
            .unwrap());
    }

    #[test]
    fn test_funding_summary_totals() {
        let store = MemoryStore::new();
        let ts = Utc::now();
        store.append_ledger(&funding_row(ts, dec!(1.5))).unwrap();
        store
            .append_ledger(&funding_row(ts + chrono::Duration::hours(8), dec!(2.5)))
            .unwrap();

        let summary = store.funding_summary(1, "BTC").unwrap().unwrap();
        assert_eq!(summary.total, dec!(4.0));
        assert_eq!(summary.count, 2);
        assert!(summary.first < summary.last);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.find_checkpoint(1, "BTC").unwrap().is_none());

        store
            .put_checkpoint(&OpCheckpoint {
                account_id: 1,
                instrument: "BTC".to_string(),
                op: OpKind::Reduce,
                remaining: dec!(30),
                started_at: Utc::now(),
            })
            .unwrap();

        let cp = store.find_checkpoint(1, "BTC").unwrap().unwrap();
        assert_eq!(cp.op, OpKind::Reduce);
        assert_eq!(cp.remaining, dec!(30));

        store.clear_checkpoint(1, "BTC").unwrap();
        assert!(store.find_checkpoint(1, "BTC").unwrap().is_none());
    }

    #[test]
    fn test_portfolio_upsert_scoped_by_book() {
        let store = MemoryStore::new();
        assert!(store.find_portfolio(1, "BTC").unwrap().is_none());

        let mut book = Portfolio {
            account_id: 1,
            instrument: "BTC".to_string(),
            leverage: 3,
            size: dec!(1),
            updated_at: Utc::now(),
        };
        store.upsert_portfolio(&book).unwrap();

        book.size = dec!(0.25);
        store.upsert_portfolio(&book).unwrap();

        let loaded = store.find_portfolio(1, "BTC").unwrap().unwrap();
        assert_eq!(loaded.leverage, 3);
        assert_eq!(loaded.size, dec!(0.25));
        assert!(store.find_portfolio(1, "ETH").unwrap().is_none());
        assert!(store.find_portfolio(2, "BTC").unwrap().is_none());
    }
}
