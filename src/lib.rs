//! # Basis Bot
//!
//! Automated spot/perpetual-swap basis trading: hold a spot long hedged
//! by a swap short, collect funding, and rebalance the pair when the
//! liquidation price drifts out of its leverage band.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: OKX API client (REST + WebSocket) behind a gateway trait
//! - `position`: Derived position state and liquidation-risk reads
//! - `stats`: Rolling spot/swap spread statistics
//! - `executor`: Paired-order executor for add/reduce operations
//! - `monitor`: The rebalance controller state machine
//! - `store`: SQLite-backed ledger, portfolio and checkpoint records
//! - `utils`: Shared decimal arithmetic helpers

pub mod config;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod monitor;
pub mod position;
pub mod stats;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{BotError, Result};
