//! Type definitions for exchange API payloads and domain orders.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// Which leg of the hedge an order trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    Spot,
    Swap,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Market::Spot => write!(f, "spot"),
            Market::Swap => write!(f, "swap"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Order type. Rebalancing legs are submitted fill-or-kill so a pair either
/// executes at the observed book or cancels as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
    Fok,
}

/// Order lifecycle state. `Filled` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled)
    }
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub inst_id: String,
    pub market: Market,
    pub side: Side,
    pub order_type: OrderType,
    /// Base-currency units for spot, whole contracts for swap.
    pub size: Decimal,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
}

/// Acknowledgement returned when an order is accepted.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
}

/// Full order status from a follow-up query.
#[derive(Debug, Clone)]
pub struct OrderDetail {
    pub order_id: String,
    pub state: OrderState,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
    /// Signed fee in the venue's fee currency: base units for spot,
    /// quote (USDT) for swap. Negative = paid.
    pub fee: Decimal,
}

/// Best bid/ask snapshot for one instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last: Decimal,
    #[serde(rename = "bidPx", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(rename = "bidSz", with = "rust_decimal::serde::str")]
    pub bid_size: Decimal,
    #[serde(rename = "askPx", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(rename = "askSz", with = "rust_decimal::serde::str")]
    pub ask_size: Decimal,
    #[serde(deserialize_with = "de_millis_str")]
    pub ts: i64,
}

/// Event delivered on the ticker stream.
#[derive(Debug, Clone)]
pub enum TickerEvent {
    Ticker(Ticker),
    Connected,
    Disconnected,
}

/// Static instrument metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentSpec {
    #[serde(rename = "instId")]
    pub inst_id: String,
    /// Minimum order size in base units (spot) or contracts (swap).
    #[serde(rename = "minSz", with = "rust_decimal::serde::str")]
    pub min_size: Decimal,
    /// Size increment.
    #[serde(rename = "lotSz", with = "rust_decimal::serde::str")]
    pub lot_size: Decimal,
    /// Price increment.
    #[serde(rename = "tickSz", with = "rust_decimal::serde::str")]
    pub tick_size: Decimal,
    /// Underlying units per contract; zero for spot instruments.
    #[serde(rename = "ctVal", default, deserialize_with = "de_decimal_or_zero")]
    pub contract_value: Decimal,
}

/// Quote-currency balance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Current and predicted funding rate for a swap.
#[derive(Debug, Clone, Deserialize)]
pub struct FundingInfo {
    #[serde(rename = "fundingRate", with = "rust_decimal::serde::str")]
    pub current_rate: Decimal,
    #[serde(rename = "nextFundingRate", default, deserialize_with = "de_decimal_or_zero")]
    pub next_rate: Decimal,
    #[serde(rename = "fundingTime", deserialize_with = "de_millis_str")]
    pub funding_time: i64,
}

/// Swap position snapshot.
#[derive(Debug, Clone, Default)]
pub struct SwapPosition {
    /// Signed contracts; short positions are negative.
    pub contracts: Decimal,
    pub avg_price: Decimal,
    pub liquidation_price: Decimal,
    pub margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub last: Decimal,
}

/// Account bill row (realized funding, fees).
#[derive(Debug, Clone)]
pub struct Bill {
    pub inst_id: String,
    pub bill_type: BillType,
    pub pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Bill categories the bot consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillType {
    Funding,
    Fee,
    Other,
}

/// Leverage configuration for a swap instrument.
#[derive(Debug, Clone)]
pub struct LeverageSetting {
    pub leverage: Decimal,
    pub isolated: bool,
}

/// Taker/maker fee rates. Quoted as negative numbers by some venues;
/// stored here as positive cost rates.
#[derive(Debug, Clone, Copy)]
pub struct TradeFee {
    pub taker: Decimal,
    pub maker: Decimal,
}

/// Numerics that arrive as strings and may be empty (spot instruments
/// carry no contract value, some venues omit the predicted rate).
pub(crate) fn de_decimal_or_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    raw.parse::<Decimal>().map_err(serde::de::Error::custom)
}

/// Millisecond timestamps arrive as JSON strings on some venues.
pub(crate) fn de_millis_str<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse::<i64>().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ticker_parses_string_fields() {
        let json = r#"{
            "instId": "BTC-USDT-SWAP",
            "last": "50000.1",
            "bidPx": "50000.0",
            "bidSz": "12",
            "askPx": "50000.2",
            "askSz": "8",
            "ts": "1700000000000"
        }"#;
        let ticker: Ticker = serde_json::from_str(json).unwrap();
        assert_eq!(ticker.bid_price, dec!(50000.0));
        assert_eq!(ticker.ask_size, dec!(8));
        assert_eq!(ticker.ts, 1_700_000_000_000);
    }

    #[test]
    fn test_spot_spec_tolerates_empty_contract_value() {
        let json = r#"{"instId":"BTC-USDT","minSz":"0.0001","lotSz":"0.0001","tickSz":"0.1","ctVal":""}"#;
        let spec: InstrumentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.contract_value, Decimal::ZERO);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Canceled.is_terminal());
        assert!(!OrderState::Live.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
    }

}
