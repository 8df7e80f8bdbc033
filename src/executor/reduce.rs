//! Position reduction and full close-out.

use super::{Executor, PairOutcome, SliceTotals};
use crate::error::{BotError, Result};
use crate::exchange::types::{Market, OrderRequest, OrderType, Side, Ticker, TickerEvent};
use crate::store::{LedgerEntry, LedgerTitle, OpCheckpoint, OpKind};
use crate::utils::decimal::{round_down_to, round_to_tick, whole_contracts};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

/// Parameters for one reduce operation.
#[derive(Debug, Clone)]
pub struct ReduceParams {
    /// Underlying size to reduce the position down to (not by).
    pub target_size: Decimal,
    /// Highest acceptable close premium of swap over spot.
    pub price_diff: Decimal,
    /// Hours before the threshold is re-derived from recent stats; zero
    /// disables acceleration.
    pub accelerate_after: u32,
}

impl Executor {
    /// Shrink hedged exposure: sell spot, buy swap to close, until the
    /// short is at the target size. Returns the swap size closed in base
    /// units.
    pub async fn reduce(&self, params: &ReduceParams) -> Result<Decimal> {
        let mut totals = SliceTotals::default();
        let result = self.reduce_loop(params, &mut totals).await;
        let finalize = self.finalize(OpKind::Reduce, &totals).await;
        result.and(finalize)?;
        Ok(totals.swap_filled)
    }

    async fn reduce_loop(&self, params: &ReduceParams, totals: &mut SliceTotals) -> Result<()> {
        let contract_value = self.swap_spec.contract_value;
        let lot_size = self.spot_spec.lot_size;

        let current = match self.gateway.get_swap_position(&self.ids.swap).await? {
            Some(pos) => pos.contracts.abs() * contract_value,
            None => {
                warn!(instrument = %self.ids.currency, "no position to reduce");
                return Ok(());
            }
        };
        let mut remaining = current - params.target_size;
        info!(
            instrument = %self.ids.currency,
            %current,
            target = %params.target_size,
            "amount to reduce"
        );
        if remaining < contract_value {
            return Ok(());
        }

        let mut price_diff = params.price_diff;
        let mut time_to_accelerate =
            Utc::now() + Duration::hours(i64::from(params.accelerate_after));

        self.store.put_checkpoint(&OpCheckpoint {
            account_id: self.account_id,
            instrument: self.ids.currency.clone(),
            op: OpKind::Reduce,
            remaining,
            started_at: Utc::now(),
        })?;

        let subscription = [self.ids.spot.clone(), self.ids.swap.clone()];

        'operation: while remaining >= contract_value && !self.exit.is_set() {
            let mut stream = self.gateway.subscribe_tickers(&subscription).await?;
            let mut spot_ticker: Option<Ticker> = None;
            let mut swap_ticker: Option<Ticker> = None;
            let mut received_any = false;

            while let Some(event) = stream.recv().await {
                if self.exit.is_set() {
                    break 'operation;
                }

                if params.accelerate_after > 0 && Utc::now() > time_to_accelerate {
                    match self
                        .stats
                        .close_stat(&self.ids.currency, params.accelerate_after)
                        .await?
                    {
                        Some(stat) => {
                            price_diff = super::close_threshold(&stat);
                            info!(%price_diff, "recomputed close threshold");
                        }
                        None => warn!("no recent spread samples, threshold unchanged"),
                    }
                    time_to_accelerate =
                        Utc::now() + Duration::hours(i64::from(params.accelerate_after));
                }

                match event {
                    TickerEvent::Ticker(t) if t.inst_id == self.ids.spot => {
                        received_any = true;
                        spot_ticker = Some(t);
                    }
                    TickerEvent::Ticker(t) if t.inst_id == self.ids.swap => {
                        received_any = true;
                        swap_ticker = Some(t);
                    }
                    TickerEvent::Disconnected => break,
                    _ => continue,
                }
                let (Some(spot_t), Some(swap_t)) = (&spot_ticker, &swap_ticker) else {
                    continue;
                };

                // Sell spot into the bid, buy the swap back at the ask.
                let best_bid = spot_t.bid_price;
                let best_ask = swap_t.ask_price;

                // Exit condition: close premium at or below the threshold.
                if best_ask > best_bid * (Decimal::ONE + price_diff) {
                    continue;
                }

                let spot_holding = self.gateway.get_spot_holding(&self.ids.currency).await?;
                let order_size = remaining
                    .min(round_down_to(spot_t.bid_size, lot_size))
                    .min(swap_t.ask_size * contract_value)
                    .min(spot_holding);
                let order_size = round_down_to(order_size, contract_value);
                if order_size <= Decimal::ZERO {
                    continue;
                }
                let contract_size = whole_contracts(order_size, contract_value);
                let spot_size = round_down_to(order_size, lot_size);

                let spot_order = OrderRequest {
                    inst_id: self.ids.spot.clone(),
                    market: Market::Spot,
                    side: Side::Sell,
                    order_type: OrderType::Fok,
                    size: spot_size,
                    price: Some(best_bid),
                };
                let swap_order = OrderRequest {
                    inst_id: self.ids.swap.clone(),
                    market: Market::Swap,
                    side: Side::Buy,
                    order_type: OrderType::Fok,
                    size: contract_size,
                    price: Some(best_ask),
                };

                // Both submissions must run to completion even if one
                // errors, or a surviving FOK leg could fill unobserved.
                let (spot_res, swap_res) = tokio::join!(
                    self.gateway.place_order(&spot_order),
                    self.gateway.place_order(&swap_order),
                );
                let (spot_ack, swap_ack) = match (spot_res, swap_res) {
                    (Ok(spot_ack), Ok(swap_ack)) => (spot_ack, swap_ack),
                    (spot_res, swap_res) => {
                        warn!("paired order submission failed, aborting reduce");
                        if let Some(spot) = self.surviving_leg(&self.ids.spot, spot_res).await {
                            totals.spot_filled += spot.filled_size;
                            totals.spot_notional += spot.filled_size * spot.avg_price;
                            totals.fee_total += spot.fee * spot.avg_price;
                        }
                        if let Some(swap) = self.surviving_leg(&self.ids.swap, swap_res).await {
                            let filled = swap.filled_size * contract_value;
                            totals.swap_filled += filled;
                            totals.swap_notional -= filled * swap.avg_price;
                            totals.fee_total += swap.fee;
                        }
                        self.exit.trigger();
                        break 'operation;
                    }
                };

                // Retry policy mirror: canceled swap buys back at market,
                // canceled spot re-prices 2% below the original bid.
                let spot_retry = OrderRequest {
                    order_type: OrderType::Limit,
                    price: Some(round_to_tick(
                        best_bid * dec!(0.98),
                        self.spot_spec.tick_size,
                    )),
                    ..spot_order.clone()
                };
                let swap_retry = OrderRequest {
                    order_type: OrderType::Market,
                    price: None,
                    ..swap_order.clone()
                };

                match self.poll_pair(spot_ack, swap_ack, spot_retry, swap_retry).await? {
                    PairOutcome::Filled { spot, swap } => {
                        let spot_filled = spot.filled_size;
                        let swap_filled = swap.filled_size * contract_value;
                        self.reconcile_slice(spot_filled, swap_filled)?;

                        totals.spot_filled += spot_filled;
                        totals.swap_filled += swap_filled;
                        totals.spot_notional += spot_filled * spot.avg_price;
                        totals.swap_notional -= swap_filled * swap.avg_price;
                        totals.fee_total += Self::pair_fees(&spot, &swap);

                        remaining -= swap_filled;
                        info!(
                            closed = %swap_filled,
                            remaining = %remaining,
                            "slice hedged"
                        );
                        self.store.put_checkpoint(&OpCheckpoint {
                            account_id: self.account_id,
                            instrument: self.ids.currency.clone(),
                            op: OpKind::Reduce,
                            remaining,
                            started_at: Utc::now(),
                        })?;
                        // Resubscribe after trading.
                        break;
                    }
                    PairOutcome::Killed | PairOutcome::Aborted => {
                        self.exit.trigger();
                        break 'operation;
                    }
                }
            }

            if !received_any && !self.exit.is_set() {
                return Err(BotError::Stream(
                    "ticker subscription yielded no events".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Close the whole position and record the closing ledger row.
    pub async fn close_all(&self, params: &ReduceParams) -> Result<Decimal> {
        let params = ReduceParams {
            target_size: Decimal::ZERO,
            ..params.clone()
        };
        let closed = self.reduce(&params).await?;

        if self.gateway.get_swap_position(&self.ids.swap).await?.is_none() {
            self.store.append_ledger(&LedgerEntry {
                account_id: self.account_id,
                instrument: self.ids.currency.clone(),
                title: LedgerTitle::Close,
                amount: Decimal::ZERO,
                price: Decimal::ZERO,
                timestamp: Utc::now(),
            })?;
            info!(instrument = %self.ids.currency, %closed, "position closed");
        } else {
            warn!(instrument = %self.ids.currency, "position not fully closed");
        }
        Ok(closed)
    }
}
