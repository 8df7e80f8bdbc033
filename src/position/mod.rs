//! Derived position state: sizes, margin, and liquidation price.
//!
//! Nothing here is stored; every read goes through the gateway so the
//! controller always decides on live state.

use crate::error::{BotError, Result};
use crate::exchange::types::{InstrumentSpec, Market, SwapPosition};
use crate::exchange::ExchangeGateway;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Instrument identifiers derived from one base currency.
#[derive(Debug, Clone)]
pub struct InstrumentIds {
    pub currency: String,
    pub spot: String,
    pub swap: String,
}

impl InstrumentIds {
    pub fn new(currency: &str) -> Self {
        Self {
            currency: currency.to_string(),
            spot: format!("{currency}-USDT"),
            swap: format!("{currency}-USDT-SWAP"),
        }
    }
}

/// Read-only view of one account's hedge in one instrument.
pub struct PositionReader {
    gateway: Arc<dyn ExchangeGateway>,
    ids: InstrumentIds,
    swap_spec: InstrumentSpec,
}

impl PositionReader {
    /// Fetches swap contract metadata once; sizes afterwards are pure reads.
    pub async fn new(gateway: Arc<dyn ExchangeGateway>, currency: &str) -> Result<Self> {
        let ids = InstrumentIds::new(currency);
        let swap_spec = gateway.get_instrument(&ids.swap, Market::Swap).await?;
        Ok(Self {
            gateway,
            ids,
            swap_spec,
        })
    }

    pub fn ids(&self) -> &InstrumentIds {
        &self.ids
    }

    pub fn contract_value(&self) -> Decimal {
        self.swap_spec.contract_value
    }

    /// Spot holding in base units.
    pub async fn spot_size(&self) -> Result<Decimal> {
        self.gateway.get_spot_holding(&self.ids.currency).await
    }

    pub async fn swap_position(&self) -> Result<Option<SwapPosition>> {
        self.gateway.get_swap_position(&self.ids.swap).await
    }

    /// Short swap exposure in base units (positive).
    pub async fn swap_size(&self) -> Result<Decimal> {
        Ok(match self.swap_position().await? {
            Some(pos) => pos.contracts.abs() * self.swap_spec.contract_value,
            None => Decimal::ZERO,
        })
    }

    /// Liquidation price of the short; zero when no position is open,
    /// which callers treat as "no active hedge".
    pub async fn liquidation_price(&self) -> Result<Decimal> {
        Ok(self
            .swap_position()
            .await?
            .map(|pos| pos.liquidation_price)
            .unwrap_or(Decimal::ZERO))
    }

    /// Available quote balance.
    pub async fn usdt_balance(&self) -> Result<Decimal> {
        Ok(self.gateway.get_balance().await?.available)
    }

    pub async fn position_exists(&self) -> Result<bool> {
        Ok(self.swap_position().await?.is_some())
    }

    /// The hedge is balanced iff the legs differ by less than one contract.
    pub async fn hedge_is_balanced(&self) -> Result<bool> {
        let spot = self.spot_size().await?;
        let swap = self.swap_size().await?;
        Ok((spot - swap).abs() < self.swap_spec.contract_value)
    }

    /// Balanced-or-fatal variant for call sites where an imbalance must
    /// halt instead of being reasoned about.
    pub async fn assert_hedged(&self) -> Result<()> {
        let spot = self.spot_size().await?;
        let swap = self.swap_size().await?;
        if (spot - swap).abs() < self.swap_spec.contract_value {
            return Ok(());
        }
        warn!(
            instrument = %self.ids.currency,
            %spot,
            %swap,
            "hedge imbalance detected"
        );
        Err(BotError::HedgeImbalance {
            instrument: self.ids.currency.clone(),
            spot,
            swap,
        })
    }

    /// Release isolated margin held above `notional / leverage` back to the
    /// trading balance and return the freed amount plus what was already
    /// available, i.e. the quote size an add operation can deploy.
    ///
    /// Returns zero when the position carries no excess margin; the caller
    /// latches that as margin-exhausted and stops trying to add.
    pub async fn release_excess_margin(&self, leverage: u32) -> Result<Decimal> {
        let Some(pos) = self.swap_position().await? else {
            return Ok(Decimal::ZERO);
        };
        let notional = pos.contracts.abs() * self.swap_spec.contract_value * pos.last;
        if notional.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let required = notional / Decimal::from(leverage);
        let excess = pos.margin - required;
        if excess <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        info!(
            instrument = %self.ids.currency,
            %excess,
            "releasing excess position margin"
        );
        self.gateway
            .adjust_position_margin(&self.ids.swap, -excess)
            .await?;
        let available = self.gateway.get_balance().await?.available;
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{ticker, MockGateway};
    use rust_decimal_macros::dec;

    fn swap_spec() -> InstrumentSpec {
        InstrumentSpec {
            inst_id: "BTC-USDT-SWAP".to_string(),
            min_size: dec!(1),
            lot_size: dec!(1),
            tick_size: dec!(0.1),
            contract_value: dec!(0.01),
        }
    }

    async fn reader(gw: Arc<MockGateway>) -> PositionReader {
        PositionReader::new(gw, "BTC").await.unwrap()
    }

    #[tokio::test]
    async fn test_hedge_balanced_within_one_contract() {
        let gw = Arc::new(MockGateway::new().with_instrument(Market::Swap, swap_spec()));
        gw.set_spot_holding(dec!(1.005)).await;
        gw.set_swap_contracts(dec!(-100)).await; // 1.0 BTC short
        let reader = reader(gw).await;

        assert!(reader.hedge_is_balanced().await.unwrap());
        assert!(reader.assert_hedged().await.is_ok());
    }

    #[tokio::test]
    async fn test_hedge_imbalance_is_fatal() {
        let gw = Arc::new(MockGateway::new().with_instrument(Market::Swap, swap_spec()));
        gw.set_spot_holding(dec!(1.5)).await;
        gw.set_swap_contracts(dec!(-100)).await;
        let reader = reader(gw).await;

        assert!(!reader.hedge_is_balanced().await.unwrap());
        let err = reader.assert_hedged().await.unwrap_err();
        assert!(matches!(err, BotError::HedgeImbalance { .. }));
    }

    #[tokio::test]
    async fn test_no_position_reads_as_zero_liquidation() {
        let gw = Arc::new(MockGateway::new().with_instrument(Market::Swap, swap_spec()));
        let reader = reader(gw).await;

        assert_eq!(reader.liquidation_price().await.unwrap(), Decimal::ZERO);
        assert!(!reader.position_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_excess_margin_zero_when_tight() {
        let gw = Arc::new(MockGateway::new().with_instrument(Market::Swap, swap_spec()));
        gw.push_ticker(ticker(
            "BTC-USDT-SWAP",
            dec!(50000),
            dec!(49999),
            dec!(1),
            dec!(50001),
            dec!(1),
        ))
        .await;
        gw.set_swap_contracts(dec!(-100)).await; // notional 50000
        gw.set_position_margin(dec!(16000)).await; // below 50000/3
        let reader = reader(Arc::clone(&gw)).await;

        let released = reader.release_excess_margin(3).await.unwrap();
        assert_eq!(released, Decimal::ZERO);
        assert!(gw.margin_adjustments().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_excess_margin_frees_surplus() {
        let gw = Arc::new(MockGateway::new().with_instrument(Market::Swap, swap_spec()));
        gw.push_ticker(ticker(
            "BTC-USDT-SWAP",
            dec!(50000),
            dec!(49999),
            dec!(1),
            dec!(50001),
            dec!(1),
        ))
        .await;
        gw.set_swap_contracts(dec!(-100)).await;
        gw.set_position_margin(dec!(20000)).await; // required ~16666.67
        gw.set_balance(dec!(1000)).await;
        let reader = reader(Arc::clone(&gw)).await;

        let released = reader.release_excess_margin(3).await.unwrap();
        assert!(released > dec!(1000));
        let adjustments = gw.margin_adjustments().await;
        assert_eq!(adjustments.len(), 1);
        assert!(adjustments[0] < Decimal::ZERO);
    }
}
