//! Error taxonomy for the basis bot.
//!
//! Leg-level exchange rejections are handled locally inside the executor
//! (retry-once policy); `HedgeImbalance` and `MissingStatistics` terminate
//! the whole controller loop.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// An order attempt was rejected by the exchange.
    #[error("exchange error {code}: {message}")]
    Exchange { code: String, message: String },

    /// Spot and swap sizes diverged beyond one contract's value. Always
    /// fatal: auto-correction risks compounding an unhedged exposure.
    #[error("hedge imbalance on {instrument}: spot {spot}, swap {swap}")]
    HedgeImbalance {
        instrument: String,
        spot: Decimal,
        swap: Decimal,
    },

    /// The statistics provider has no data for the requested window.
    /// Fatal precondition failure: no default spread is substituted.
    #[error("missing spread statistics for {instrument} over {hours}h lookback")]
    MissingStatistics { instrument: String, hours: u32 },

    /// Record store failure.
    #[error("record store error: {0}")]
    Store(String),

    /// The ticker stream closed and could not be resubscribed.
    #[error("ticker stream closed: {0}")]
    Stream(String),

    /// Monitoring was asked to start without an open position.
    #[error("no open position for {0}")]
    NoPosition(String),

    /// A spawned executor task panicked or was aborted.
    #[error("executor task failed: {0}")]
    Task(String),
}

impl BotError {
    pub fn exchange(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exchange {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

pub type Result<T, E = BotError> = std::result::Result<T, E>;
