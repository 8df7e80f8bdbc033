//! Position opening and enlargement.

use super::{Executor, PairOutcome, SliceTotals};
use crate::error::{BotError, Result};
use crate::exchange::types::{Market, OrderRequest, OrderType, Side, Ticker, TickerEvent};
use crate::store::{LedgerEntry, LedgerTitle, OpCheckpoint, OpKind, Portfolio};
use crate::utils::decimal::{round_down_to, round_to_tick, whole_contracts};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

/// Parameters for one add operation. Exactly one of `usdt_size` /
/// `target_size` should be nonzero; `usdt_size` is total quote capital to
/// deploy (margin included), `target_size` is underlying units to add.
#[derive(Debug, Clone)]
pub struct AddParams {
    pub usdt_size: Decimal,
    pub target_size: Decimal,
    pub leverage: u32,
    /// Required swap premium over spot before a pair is fired.
    pub price_diff: Decimal,
    /// Hours before the threshold is re-derived from recent stats; zero
    /// disables acceleration.
    pub accelerate_after: u32,
}

impl Executor {
    /// Add hedged exposure: buy spot, sell swap to open, slice by slice,
    /// until the filled swap size reaches the target. Returns the total
    /// swap size filled in base units.
    pub async fn add(&self, params: &AddParams) -> Result<Decimal> {
        let mut totals = SliceTotals::default();
        let result = self.add_loop(params, &mut totals).await;
        let finalize = self.finalize(OpKind::Add, &totals).await;
        result.and(finalize)?;
        Ok(totals.swap_filled)
    }

    async fn add_loop(&self, params: &AddParams, totals: &mut SliceTotals) -> Result<()> {
        let leverage = Decimal::from(params.leverage);
        // Quote capital funds both the spot leg (1) and the swap margin
        // (1/leverage), so the underlying target is usdt·L/(L+1)/price.
        let mut target = if !params.usdt_size.is_zero() {
            let last = self.gateway.get_ticker(&self.ids.spot).await?.last;
            params.usdt_size * leverage / (leverage + Decimal::ONE) / last
        } else {
            params.target_size
        };
        info!(instrument = %self.ids.currency, %target, "amount to add");

        let min_size = self.spot_spec.min_size;
        let lot_size = self.spot_spec.lot_size;
        let contract_value = self.swap_spec.contract_value;

        if target < contract_value {
            warn!(%target, %contract_value, "target below one contract, nothing to add");
            return Ok(());
        }

        let trade_fee = self
            .gateway
            .get_trade_fee(&self.ids.spot, Market::Spot)
            .await?
            .taker;
        self.set_swap_leverage(params.leverage).await?;
        let mut usdt_balance = self.gateway.get_balance().await?.available;

        let mut price_diff = params.price_diff;
        let mut time_to_accelerate =
            Utc::now() + Duration::hours(i64::from(params.accelerate_after));

        self.store.put_checkpoint(&OpCheckpoint {
            account_id: self.account_id,
            instrument: self.ids.currency.clone(),
            op: OpKind::Add,
            remaining: target,
            started_at: Utc::now(),
        })?;

        let subscription = [self.ids.spot.clone(), self.ids.swap.clone()];

        'operation: while target >= contract_value && !self.exit.is_set() {
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
                        .open_stat(&self.ids.currency, params.accelerate_after)
                        .await?
                    {
                        Some(stat) => {
                            price_diff = super::entry_threshold(&stat);
                            info!(%price_diff, "recomputed entry threshold");
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

                let last = spot_t.last;
                let best_ask = spot_t.ask_price;
                let best_bid = swap_t.bid_price;

                // Entry condition: swap premium covers the threshold.
                if best_bid < best_ask * (Decimal::ONE + price_diff) {
                    continue;
                }

                let required = |size: Decimal| size * last * (Decimal::ONE + Decimal::ONE / leverage);
                if usdt_balance < required(target) {
                    while usdt_balance < required(target) {
                        target -= min_size;
                    }
                    if target < min_size {
                        warn!(
                            %usdt_balance,
                            "insufficient quote balance, aborting add"
                        );
                        self.exit.trigger();
                        break 'operation;
                    }
                    continue;
                }

                // Size to the thinner side of the book, in whole contracts.
                let order_size = target
                    .min(round_down_to(spot_t.ask_size, min_size))
                    .min(swap_t.bid_size * contract_value);
                let order_size = round_down_to(order_size, contract_value);
                if order_size <= Decimal::ZERO {
                    continue;
                }
                let contract_size = whole_contracts(order_size, contract_value);
                // The spot leg nets the same underlying after the taker fee.
                let spot_size = round_down_to(order_size / (Decimal::ONE + trade_fee), lot_size);

                let spot_order = OrderRequest {
                    inst_id: self.ids.spot.clone(),
                    market: Market::Spot,
                    side: Side::Buy,
                    order_type: OrderType::Fok,
                    size: spot_size,
                    price: Some(best_ask),
                };
                let swap_order = OrderRequest {
                    inst_id: self.ids.swap.clone(),
                    market: Market::Swap,
                    side: Side::Sell,
                    order_type: OrderType::Fok,
                    size: contract_size,
                    price: Some(best_bid),
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
                        warn!("paired order submission failed, aborting add");
                        if let Some(spot) = self.surviving_leg(&self.ids.spot, spot_res).await {
                            totals.spot_filled += spot.filled_size;
                            totals.spot_notional -= spot.filled_size * spot.avg_price;
                            totals.fee_total += spot.fee * spot.avg_price;
                        }
                        if let Some(swap) = self.surviving_leg(&self.ids.swap, swap_res).await {
                            let filled = swap.filled_size * contract_value;
                            totals.swap_filled += filled;
                            totals.swap_notional += filled * swap.avg_price;
                            totals.fee_total += swap.fee;
                        }
                        self.exit.trigger();
                        break 'operation;
                    }
                };

                // Retry policy: canceled swap goes to market, canceled spot
                // re-prices 2% above the original ask.
                let spot_retry = OrderRequest {
                    order_type: OrderType::Limit,
                    price: Some(round_to_tick(
                        best_ask * dec!(1.02),
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
                        totals.spot_notional -= spot_filled * spot.avg_price;
                        totals.swap_notional += swap_filled * swap.avg_price;
                        totals.fee_total += Self::pair_fees(&spot, &swap);

                        target -= swap_filled;
                        info!(
                            added = %swap_filled,
                            remaining = %target,
                            "slice hedged"
                        );
                        self.store.put_checkpoint(&OpCheckpoint {
                            account_id: self.account_id,
                            instrument: self.ids.currency.clone(),
                            op: OpKind::Add,
                            remaining: target,
                            started_at: Utc::now(),
                        })?;

                        usdt_balance = self.gateway.get_balance().await?.available;
                        target = target
                            .min(usdt_balance * leverage / (leverage + Decimal::ONE) / best_ask);
                        // Resubscribe after trading.
                        break;
                    }
                    PairOutcome::Killed | PairOutcome::Aborted => {
                        self.exit.trigger();
                        break 'operation;
                    }
                }
            }

            // A subscription that yields nothing cannot drive the loop.
            if !received_any && !self.exit.is_set() {
                return Err(BotError::Stream(
                    "ticker subscription yielded no events".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Open a position from flat: record the opening ledger row unless one
    /// is already active, then fund and run `add`.
    pub async fn open(&self, params: &AddParams) -> Result<Decimal> {
        let last_entry = self
            .store
            .recent_ledger(self.account_id, &self.ids.currency, 1)?
            .into_iter()
            .next();
        match last_entry {
            Some(entry) if entry.title != LedgerTitle::Close => {
                info!(
                    instrument = %self.ids.currency,
                    "position already active, adding to it"
                );
            }
            _ => {
                self.store.append_ledger(&LedgerEntry {
                    account_id: self.account_id,
                    instrument: self.ids.currency.clone(),
                    title: LedgerTitle::Open,
                    amount: Decimal::ZERO,
                    price: Decimal::ZERO,
                    timestamp: Utc::now(),
                })?;
            }
        }

        let leverage = Decimal::from(params.leverage);
        let usdt_size = if !params.target_size.is_zero() {
            let last = self.gateway.get_ticker(&self.ids.spot).await?.last;
            last * params.target_size * (Decimal::ONE + Decimal::ONE / leverage)
        } else {
            params.usdt_size
        };

        let usdt_balance = self.gateway.get_balance().await?.available;
        if usdt_balance < usdt_size {
            warn!(%usdt_balance, %usdt_size, "insufficient quote balance to open");
            return Ok(Decimal::ZERO);
        }

        let params = AddParams {
            usdt_size,
            target_size: Decimal::ZERO,
            ..params.clone()
        };
        let filled = self.add(&params).await?;

        // Opening establishes the book record the controller reads
        // leverage from; size reflects whatever actually executed.
        let size = match self.gateway.get_swap_position(&self.ids.swap).await? {
            Some(pos) => pos.contracts.abs() * self.swap_spec.contract_value,
            None => Decimal::ZERO,
        };
        self.store.upsert_portfolio(&Portfolio {
            account_id: self.account_id,
            instrument: self.ids.currency.clone(),
            leverage: params.leverage,
            size,
            updated_at: Utc::now(),
        })?;
        Ok(filled)
    }
}
