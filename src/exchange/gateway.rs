//! Venue-agnostic exchange gateway trait.
//!
//! The rebalance controller and the paired-order executor consume this
//! trait only; the live REST/WebSocket client and the scripted test
//! gateway both implement it.

use crate::error::Result;
use crate::exchange::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// Authenticated request/response and streaming ticker access to one venue.
///
/// Implementations surface venue rejections as
/// [`BotError::Exchange`](crate::error::BotError::Exchange) carrying the
/// venue's code and message.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Best bid/ask snapshot for one instrument.
    async fn get_ticker(&self, inst_id: &str) -> Result<Ticker>;

    /// Subscribe to the public ticker stream for the given instruments.
    ///
    /// The returned receiver yields events until the connection drops;
    /// callers resubscribe to restart the stream.
    async fn subscribe_tickers(&self, inst_ids: &[String]) -> Result<mpsc::Receiver<TickerEvent>>;

    /// Static metadata for an instrument.
    async fn get_instrument(&self, inst_id: &str, market: Market) -> Result<InstrumentSpec>;

    /// Submit one order; returns the venue acknowledgement.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Fetch current state and fills for an order.
    async fn get_order(&self, inst_id: &str, order_id: &str) -> Result<OrderDetail>;

    /// Cancel a batch of live orders.
    async fn cancel_orders(&self, inst_id: &str, order_ids: &[String]) -> Result<()>;

    /// Current leverage configuration for a swap instrument.
    async fn get_leverage(&self, inst_id: &str) -> Result<LeverageSetting>;

    /// Set isolated leverage for a swap instrument.
    async fn set_leverage(&self, inst_id: &str, leverage: u32) -> Result<()>;

    /// Taker/maker fee rates for a market.
    async fn get_trade_fee(&self, inst_id: &str, market: Market) -> Result<TradeFee>;

    /// Quote-currency (USDT) balance.
    async fn get_balance(&self) -> Result<Balance>;

    /// Spot holding of the base currency, in base units.
    async fn get_spot_holding(&self, currency: &str) -> Result<Decimal>;

    /// Swap position snapshot; `None` when no position is open.
    async fn get_swap_position(&self, inst_id: &str) -> Result<Option<SwapPosition>>;

    /// Current and predicted funding rate.
    async fn get_funding_info(&self, inst_id: &str) -> Result<FundingInfo>;

    /// Recent account bills of one type, newest first.
    async fn get_account_bills(&self, bill_type: BillType, limit: usize) -> Result<Vec<Bill>>;

    /// Move isolated margin out of (or into) a swap position.
    /// `amount > 0` adds margin, `amount < 0` releases it.
    async fn adjust_position_margin(&self, inst_id: &str, amount: Decimal) -> Result<()>;
}
