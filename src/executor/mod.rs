//! Paired-order executor.
//!
//! One executor drives one add or reduce operation: it watches the ticker
//! stream, fires spot+swap fill-or-kill pairs when the spread clears the
//! threshold, reconciles each slice against the hedge-balance invariant,
//! and keeps a resumable checkpoint in the record store. A shared exit
//! flag lets the controller stop it cooperatively between slices.

mod add;
mod reduce;
#[cfg(test)]
mod tests;

pub use add::AddParams;
pub use reduce::ReduceParams;

use crate::error::{BotError, Result};
use crate::exchange::types::{
    InstrumentSpec, Market, OrderAck, OrderDetail, OrderRequest, OrderState,
};
use crate::exchange::ExchangeGateway;
use crate::position::InstrumentIds;
use crate::stats::{SpreadStat, SpreadStats};
use crate::store::{LedgerEntry, LedgerTitle, OpKind, RecordStore};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Entry threshold for opening pairs: demand a swap premium in the rich
/// tail of the recent spread distribution.
pub(crate) fn entry_threshold(stat: &SpreadStat) -> Decimal {
    stat.avg + dec!(2) * stat.std
}

/// Close threshold for reducing pairs: accept only a premium in the cheap
/// tail. Both thresholds sit two sigma from the mean; any widening comes
/// from re-sampling a shorter window, not from switching tails.
pub(crate) fn close_threshold(stat: &SpreadStat) -> Decimal {
    stat.avg - dec!(2) * stat.std
}

/// Cooperative cancellation flag shared between a controller and the
/// executor task it launched. Polled between slices, never preemptive.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of polling one leg pair to terminal state.
pub(crate) enum PairOutcome {
    /// Both legs filled; details for reconciliation.
    Filled { spot: OrderDetail, swap: OrderDetail },
    /// Both fill-or-kill legs canceled with nothing filled.
    Killed,
    /// A retry was exhausted or cancellation interrupted the poll.
    Aborted,
}

/// Running totals across the slices of one operation.
#[derive(Debug, Default)]
pub(crate) struct SliceTotals {
    pub spot_filled: Decimal,
    /// Filled swap size in base units.
    pub swap_filled: Decimal,
    /// Signed quote flow on the spot leg (negative when buying).
    pub spot_notional: Decimal,
    /// Signed quote flow on the swap leg.
    pub swap_notional: Decimal,
    pub fee_total: Decimal,
}

pub struct Executor {
    pub(crate) gateway: Arc<dyn ExchangeGateway>,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) stats: Arc<dyn SpreadStats>,
    pub(crate) account_id: i64,
    pub(crate) ids: InstrumentIds,
    pub(crate) spot_spec: InstrumentSpec,
    pub(crate) swap_spec: InstrumentSpec,
    pub(crate) exit: ExitFlag,
}

impl Executor {
    pub async fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn RecordStore>,
        stats: Arc<dyn SpreadStats>,
        account_id: i64,
        currency: &str,
        exit: ExitFlag,
    ) -> Result<Self> {
        let ids = InstrumentIds::new(currency);
        let spot_spec = gateway.get_instrument(&ids.spot, Market::Spot).await?;
        let swap_spec = gateway.get_instrument(&ids.swap, Market::Swap).await?;
        Ok(Self {
            gateway,
            store,
            stats,
            account_id,
            ids,
            spot_spec,
            swap_spec,
            exit,
        })
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.exit.clone()
    }

    /// Ensure the swap account is configured isolated at `leverage`.
    /// The venue occasionally reports stale settings, so re-check after
    /// each write, bounded to a few attempts.
    pub async fn set_swap_leverage(&self, leverage: u32) -> Result<()> {
        for _ in 0..5 {
            let setting = self.gateway.get_leverage(&self.ids.swap).await?;
            if setting.isolated && setting.leverage == Decimal::from(leverage) {
                return Ok(());
            }
            info!(
                current = %setting.leverage,
                target = leverage,
                "updating swap leverage"
            );
            self.gateway.set_leverage(&self.ids.swap, leverage).await?;
        }
        Err(BotError::exchange(
            "leverage",
            format!("leverage did not settle at {leverage}x"),
        ))
    }

    /// After a one-sided submission failure, fetch the surviving leg's
    /// terminal state so an unpaired FOK fill is observed and settled
    /// into the operation totals rather than silently dropped.
    pub(crate) async fn surviving_leg(
        &self,
        inst_id: &str,
        outcome: Result<OrderAck>,
    ) -> Option<OrderDetail> {
        let ack = match outcome {
            Ok(ack) => ack,
            Err(e) => {
                warn!(instrument = inst_id, error = %e, "leg submission rejected");
                return None;
            }
        };
        match self.gateway.get_order(inst_id, &ack.order_id).await {
            Ok(detail) => {
                warn!(
                    instrument = inst_id,
                    order_id = %ack.order_id,
                    state = ?detail.state,
                    filled = %detail.filled_size,
                    "surviving leg of a failed pair"
                );
                Some(detail)
            }
            Err(e) => {
                warn!(
                    instrument = inst_id,
                    order_id = %ack.order_id,
                    error = %e,
                    "could not fetch surviving leg"
                );
                None
            }
        }
    }

    /// Poll both legs until terminal, applying the retry-once policy:
    /// a canceled leg is re-attempted with its `retry` request while the
    /// other leg has filled. A second failure aborts.
    pub(crate) async fn poll_pair(
        &self,
        spot_ack: OrderAck,
        swap_ack: OrderAck,
        spot_retry: OrderRequest,
        swap_retry: OrderRequest,
    ) -> Result<PairOutcome> {
        let mut spot_id = spot_ack.order_id;
        let mut swap_id = swap_ack.order_id;
        let mut spot_retried = false;
        let mut swap_retried = false;

        loop {
            let spot = self.gateway.get_order(&self.ids.spot, &spot_id).await?;
            let swap = self.gateway.get_order(&self.ids.swap, &swap_id).await?;

            match (spot.state, swap.state) {
                (OrderState::Filled, OrderState::Filled) => {
                    return Ok(PairOutcome::Filled { spot, swap });
                }
                (OrderState::Canceled, OrderState::Canceled) => {
                    // First attempt killed as a unit: nothing filled.
                    // After a retry, a cancel means the retry failed too.
                    if spot_retried || swap_retried {
                        warn!("retried leg canceled, aborting operation");
                        return Ok(PairOutcome::Aborted);
                    }
                    return Ok(PairOutcome::Killed);
                }
                (OrderState::Filled, OrderState::Canceled) => {
                    if swap_retried {
                        warn!("swap retry canceled, aborting operation");
                        return Ok(PairOutcome::Aborted);
                    }
                    warn!(size = %swap_retry.size, "swap leg canceled, retrying at market");
                    swap_retried = true;
                    let ack = self.gateway.place_order(&swap_retry).await?;
                    swap_id = ack.order_id;
                }
                (OrderState::Canceled, OrderState::Filled) => {
                    if spot_retried {
                        warn!("spot retry canceled, aborting operation");
                        return Ok(PairOutcome::Aborted);
                    }
                    warn!(
                        price = ?spot_retry.price,
                        "spot leg canceled, retrying with adjusted limit"
                    );
                    spot_retried = true;
                    let ack = self.gateway.place_order(&spot_retry).await?;
                    spot_id = ack.order_id;
                }
                _ => {
                    if self.exit.is_set() {
                        // Cancel whatever is still live before giving up.
                        let mut live = Vec::new();
                        if !spot.state.is_terminal() {
                            live.push(spot_id.clone());
                        }
                        if !live.is_empty() {
                            self.gateway.cancel_orders(&self.ids.spot, &live).await?;
                        }
                        if !swap.state.is_terminal() {
                            self.gateway
                                .cancel_orders(&self.ids.swap, &[swap_id.clone()])
                                .await?;
                        }
                        return Ok(PairOutcome::Aborted);
                    }
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    /// Slice-level hedge reconciliation. An imbalance here means one leg
    /// of the pair executed materially more than the other; that is never
    /// auto-corrected.
    pub(crate) fn reconcile_slice(&self, spot_filled: Decimal, swap_filled: Decimal) -> Result<()> {
        if (spot_filled - swap_filled).abs() < self.swap_spec.contract_value {
            return Ok(());
        }
        error!(
            instrument = %self.ids.currency,
            %spot_filled,
            %swap_filled,
            "slice hedge imbalance"
        );
        Err(BotError::HedgeImbalance {
            instrument: self.ids.currency.clone(),
            spot: spot_filled,
            swap: swap_filled,
        })
    }

    /// Write the operation's ledger rows (only nonzero ones), drop the
    /// checkpoint, and log the final hedge state.
    pub(crate) async fn finalize(
        &self,
        op: OpKind,
        totals: &SliceTotals,
    ) -> Result<()> {
        if !totals.spot_notional.is_zero() {
            let timestamp = Utc::now();
            let (spot_title, swap_title) = match op {
                OpKind::Add => (LedgerTitle::SpotBuy, LedgerTitle::SwapOpenShort),
                OpKind::Reduce => (LedgerTitle::SpotSell, LedgerTitle::SwapCloseShort),
            };
            self.store.append_ledger(&LedgerEntry {
                account_id: self.account_id,
                instrument: self.ids.currency.clone(),
                title: spot_title,
                amount: totals.spot_notional,
                price: Decimal::ZERO,
                timestamp,
            })?;
            self.store.append_ledger(&LedgerEntry {
                account_id: self.account_id,
                instrument: self.ids.currency.clone(),
                title: swap_title,
                amount: totals.swap_notional,
                price: Decimal::ZERO,
                timestamp,
            })?;
            self.store.append_ledger(&LedgerEntry {
                account_id: self.account_id,
                instrument: self.ids.currency.clone(),
                title: LedgerTitle::Fee,
                amount: totals.fee_total,
                price: Decimal::ZERO,
                timestamp,
            })?;
        }

        self.store
            .clear_checkpoint(self.account_id, &self.ids.currency)?;

        let spot = self.gateway.get_spot_holding(&self.ids.currency).await?;
        let swap = match self.gateway.get_swap_position(&self.ids.swap).await? {
            Some(pos) => pos.contracts.abs() * self.swap_spec.contract_value,
            None => Decimal::ZERO,
        };
        if (spot - swap).abs() < self.swap_spec.contract_value {
            info!(filled = %totals.swap_filled, "operation finished hedged");
        } else {
            warn!(%spot, %swap, "operation finished with hedge imbalance");
        }
        Ok(())
    }

    /// Fee accounting for one filled pair: spot fees are charged in base
    /// units, swap fees in quote.
    pub(crate) fn pair_fees(spot: &OrderDetail, swap: &OrderDetail) -> Decimal {
        spot.fee * spot.avg_price + swap.fee
    }
}
