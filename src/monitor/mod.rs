//! Rebalance controller.
//!
//! One `Monitor` owns the hedge for one account and instrument. It ticks
//! on the swap price, refreshes funding and liquidation data once per
//! hour, and keeps the position inside its leverage band by launching
//! paired-order executor tasks: reduce when the liquidation price creeps
//! up toward the mark, add when released margin shows the position is
//! running below target leverage. A reduce that drags is escalated with
//! progressively wider spread thresholds; a funding window that no longer
//! pays for its own reopen cost closes the position entirely.

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::exchange::types::{BillType, InstrumentSpec, Market};
use crate::exchange::ExchangeGateway;
use crate::executor::{
    close_threshold, entry_threshold, AddParams, Executor, ExitFlag, ReduceParams,
};
use crate::position::{InstrumentIds, PositionReader};
use crate::stats::{SpreadStat, SpreadStats};
use crate::store::{LedgerEntry, LedgerTitle, OpKind, Portfolio, RecordStore};
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Funding rows fetched per backfill pass; three months of 8-hour
/// settlements is well under this.
const BACKFILL_BILLS: usize = 300;

/// Reduce fires when the liquidation price rises above
/// `last · (1 + 1/(leverage+1))`, one leverage notch tighter than the
/// position's own band.
fn reduce_trigger(liquidation: Decimal, last: Decimal, leverage: Decimal) -> bool {
    liquidation < last * (Decimal::ONE + Decimal::ONE / (leverage + Decimal::ONE))
}

/// Add fires when the liquidation price sits beyond the notch below the
/// target leverage, meaning the position carries more margin than it needs.
fn add_trigger(liquidation: Decimal, last: Decimal, leverage: Decimal) -> bool {
    liquidation > last * (Decimal::ONE + Decimal::ONE / (leverage - Decimal::ONE))
}

/// Inner band two notches tighter than target; crossing it while a reduce
/// is already running warrants a one-time escalation.
fn proximity_trigger(liquidation: Decimal, last: Decimal, leverage: Decimal) -> bool {
    liquidation < last * (Decimal::ONE + Decimal::ONE / (leverage + dec!(2)))
}

/// Size to reduce the short down to when the outer band is crossed.
fn reduce_target(swap_size: Decimal, leverage: Decimal) -> Decimal {
    swap_size / ((leverage + Decimal::ONE) * (leverage + Decimal::ONE))
}

/// Escalation target: shrink the short in proportion to how far the
/// liquidation price has moved inside the target band. Clamped at zero,
/// i.e. a deep breach asks for a full close.
fn escalation_target(
    swap_size: Decimal,
    liquidation: Decimal,
    last: Decimal,
    leverage: Decimal,
) -> Decimal {
    let band = Decimal::ONE + Decimal::ONE / leverage;
    (swap_size * (Decimal::ONE - liquidation / last / band)).max(Decimal::ZERO)
}

/// Round-trip cost of closing the hedge now and reopening it later, in
/// rate terms: the generous side of the open spread minus the generous
/// side of the close spread, plus taker fees on all four legs.
fn reopen_cost(open: &SpreadStat, close: &SpreadStat, round_trip_fee: Decimal) -> Decimal {
    (open.avg + open.std) - (close.avg - close.std) + dec!(2) * round_trip_fee
}

/// Whether this clock hour sits inside the pre-funding window and the
/// expected funding no longer pays for a later reopen.
fn funding_window_close(
    hour: u32,
    pre_funding_hours: u32,
    cycle_hours: u32,
    expected_funding: Decimal,
    cost: Decimal,
) -> bool {
    (hour + pre_funding_hours) % cycle_hours == 0 && expected_funding < cost
}

/// Time source for the control loop, swapped out in tests to drive the
/// minute-gated and deadline paths.
trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Handle over one spawned executor run. Cancellation is cooperative:
/// the flag is polled between slices, so `stop_and_join` can take up to
/// one slice to come back.
struct ExecutorTask {
    exit: ExitFlag,
    handle: JoinHandle<Result<Decimal>>,
}

impl ExecutorTask {
    fn spawn_add(executor: Executor, params: AddParams) -> Self {
        let exit = executor.exit_flag();
        let handle = tokio::spawn(async move { executor.add(&params).await });
        Self { exit, handle }
    }

    fn spawn_reduce(executor: Executor, params: ReduceParams) -> Self {
        let exit = executor.exit_flag();
        let handle = tokio::spawn(async move { executor.reduce(&params).await });
        Self { exit, handle }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Await the task result. Filled size on success.
    async fn join(self) -> Result<Decimal> {
        self.handle
            .await
            .map_err(|e| BotError::Task(e.to_string()))?
    }

    /// Request a cooperative stop, then poll until the task has wound
    /// down. Guarantees no two executors ever trade concurrently.
    async fn stop_and_join(self) -> Result<Decimal> {
        self.exit.trigger();
        while !self.handle.is_finished() {
            sleep(Duration::from_millis(200)).await;
        }
        self.join().await
    }
}

/// One in-flight rebalance operation.
struct RunningOp {
    kind: OpKind,
    task: ExecutorTask,
    deadline: DateTime<Utc>,
    /// Proximity escalation already spent for this operation.
    accelerated: bool,
    /// Quote capital the add was asked to deploy; tracks the remainder
    /// across timeout relaunches.
    usdt_remaining: Decimal,
}

pub struct Monitor {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn RecordStore>,
    stats: Arc<dyn SpreadStats>,
    reader: PositionReader,
    account_id: i64,
    leverage: u32,
    ids: InstrumentIds,
    spot_spec: InstrumentSpec,
    swap_spec: InstrumentSpec,
    accelerate_after_hours: u32,
    stat_lookback_hours: u32,
    min_tick_spacing: Duration,
    funding_cycle_hours: u32,
    pre_funding_close_hours: u32,
    clock: Arc<dyn Clock>,
    exit: ExitFlag,
}

impl Monitor {
    pub async fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn RecordStore>,
        stats: Arc<dyn SpreadStats>,
        config: &Config,
    ) -> Result<Self> {
        let ids = InstrumentIds::new(&config.portfolio.instrument);
        let spot_spec = gateway.get_instrument(&ids.spot, Market::Spot).await?;
        let swap_spec = gateway.get_instrument(&ids.swap, Market::Swap).await?;
        let reader = PositionReader::new(Arc::clone(&gateway), &config.portfolio.instrument).await?;

        // The persisted book is authoritative for leverage once it exists;
        // it is created here on first run, seeded from the live position.
        let account_id = config.portfolio.account_id;
        let leverage = match store.find_portfolio(account_id, &ids.currency)? {
            Some(book) => book.leverage,
            None => {
                store.upsert_portfolio(&Portfolio {
                    account_id,
                    instrument: ids.currency.clone(),
                    leverage: config.portfolio.leverage,
                    size: reader.swap_size().await?,
                    updated_at: Utc::now(),
                })?;
                config.portfolio.leverage
            }
        };

        Ok(Self {
            gateway,
            store,
            stats,
            reader,
            account_id,
            leverage,
            ids,
            spot_spec,
            swap_spec,
            accelerate_after_hours: config.monitor.accelerate_after_hours,
            stat_lookback_hours: config.monitor.stat_lookback_hours,
            min_tick_spacing: Duration::from_secs(config.monitor.min_tick_spacing_secs),
            funding_cycle_hours: config.monitor.funding_cycle_hours,
            pre_funding_close_hours: config.monitor.pre_funding_close_hours,
            clock: Arc::new(SystemClock),
            exit: ExitFlag::new(),
        })
    }

    /// Flag that stops the watch loop; wire it to signal handling.
    pub fn exit_flag(&self) -> ExitFlag {
        self.exit.clone()
    }

    /// Fresh executor sharing this monitor's collaborators but carrying
    /// its own exit flag, so stopping one operation never poisons the next.
    fn executor(&self) -> Executor {
        Executor {
            gateway: Arc::clone(&self.gateway),
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            account_id: self.account_id,
            ids: self.ids.clone(),
            spot_spec: self.spot_spec.clone(),
            swap_spec: self.swap_spec.clone(),
            exit: ExitFlag::new(),
        }
    }

    fn leverage_dec(&self) -> Decimal {
        Decimal::from(self.leverage)
    }

    fn accel_deadline(&self) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::hours(i64::from(self.accelerate_after_hours))
    }

    async fn require_open_stat(&self, hours: u32) -> Result<SpreadStat> {
        self.stats
            .open_stat(&self.ids.currency, hours)
            .await?
            .ok_or_else(|| BotError::MissingStatistics {
                instrument: self.ids.currency.clone(),
                hours,
            })
    }

    async fn require_close_stat(&self, hours: u32) -> Result<SpreadStat> {
        self.stats
            .close_stat(&self.ids.currency, hours)
            .await?
            .ok_or_else(|| BotError::MissingStatistics {
                instrument: self.ids.currency.clone(),
                hours,
            })
    }

    fn append_ledger(&self, title: LedgerTitle, amount: Decimal) -> Result<()> {
        self.store.append_ledger(&LedgerEntry {
            account_id: self.account_id,
            instrument: self.ids.currency.clone(),
            title,
            amount,
            price: Decimal::ZERO,
            timestamp: Utc::now(),
        })
    }

    /// Write the current hedged size back to the book record.
    async fn backfill_portfolio_size(&self) -> Result<()> {
        self.store.upsert_portfolio(&Portfolio {
            account_id: self.account_id,
            instrument: self.ids.currency.clone(),
            leverage: self.leverage,
            size: self.reader.swap_size().await?,
            updated_at: Utc::now(),
        })
    }

    /// A position counts as open only while the gateway reports swap
    /// contracts and the ledger has not recorded a close since.
    async fn position_open(&self) -> Result<bool> {
        if !self.reader.position_exists().await? {
            return Ok(false);
        }
        let last = self
            .store
            .recent_ledger(self.account_id, &self.ids.currency, 1)?
            .into_iter()
            .next();
        if let Some(entry) = last {
            if entry.title == LedgerTitle::Close {
                warn!(
                    instrument = %self.ids.currency,
                    "ledger says closed but swap contracts remain"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record the latest realized funding settlement for this swap.
    pub async fn record_funding(&self) -> Result<()> {
        let bills = self.gateway.get_account_bills(BillType::Funding, 100).await?;
        let Some(bill) = bills.into_iter().find(|b| b.inst_id == self.ids.swap) else {
            warn!(instrument = %self.ids.swap, "no funding bill found");
            return Ok(());
        };
        if self
            .store
            .funding_recorded_at(self.account_id, &self.ids.currency, bill.timestamp)?
        {
            return Ok(());
        }
        self.store.append_ledger(&LedgerEntry {
            account_id: self.account_id,
            instrument: self.ids.currency.clone(),
            title: LedgerTitle::Funding,
            amount: bill.pnl,
            price: Decimal::ZERO,
            timestamp: bill.timestamp,
        })?;
        info!(instrument = %self.ids.currency, funding = %bill.pnl, "funding recorded");
        Ok(())
    }

    /// Backfill recent funding settlements from the account bill archive,
    /// deduplicated against rows already in the ledger. Returns the number
    /// of rows inserted.
    pub async fn backfill_funding(&self) -> Result<u64> {
        let bills = self
            .gateway
            .get_account_bills(BillType::Funding, BACKFILL_BILLS)
            .await?;
        let mut inserted = 0;
        for bill in bills.into_iter().filter(|b| b.inst_id == self.ids.swap) {
            if self
                .store
                .funding_recorded_at(self.account_id, &self.ids.currency, bill.timestamp)?
            {
                continue;
            }
            self.store.append_ledger(&LedgerEntry {
                account_id: self.account_id,
                instrument: self.ids.currency.clone(),
                title: LedgerTitle::Funding,
                amount: bill.pnl,
                price: Decimal::ZERO,
                timestamp: bill.timestamp,
            })?;
            inserted += 1;
        }
        info!(instrument = %self.ids.currency, inserted, "funding backfill done");
        Ok(inserted)
    }

    /// Annualized return of the carry over the last `days` days (whole
    /// recorded history when zero): realized funding plus fees, against
    /// the position's current gross value.
    pub async fn apr(&self, days: u32) -> Result<Decimal> {
        let Some(pos) = self.reader.swap_position().await? else {
            return Ok(Decimal::ZERO);
        };
        let size = pos.contracts.abs() * self.swap_spec.contract_value * pos.last
            + pos.margin
            + pos.unrealized_pnl;
        if size < dec!(10) {
            return Ok(Decimal::ZERO);
        }

        let cutoff = (days > 0)
            .then(|| Utc::now() - chrono::Duration::days(i64::from(days)));
        let rows = self
            .store
            .recent_ledger(self.account_id, &self.ids.currency, 1000)?;
        let mut pnl = Decimal::ZERO;
        let mut earliest: Option<DateTime<Utc>> = None;
        for row in rows {
            if !matches!(row.title, LedgerTitle::Funding | LedgerTitle::Fee) {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if row.timestamp < cutoff {
                    continue;
                }
            }
            pnl += row.amount;
            earliest = Some(match earliest {
                Some(t) => t.min(row.timestamp),
                None => row.timestamp,
            });
        }

        let period_days = match (days, earliest) {
            (0, Some(first)) => {
                Decimal::from((Utc::now() - first).num_seconds().max(1)) / dec!(86400)
            }
            (0, None) => return Ok(Decimal::ZERO),
            (d, _) => Decimal::from(d),
        };
        Ok(pnl / size / period_days * dec!(365))
    }

    /// Run the control loop until the position closes, the exit flag is
    /// set, or a fatal condition halts monitoring.
    pub async fn watch(&self) -> Result<()> {
        match self.watch_loop().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(instrument = %self.ids.currency, error = %e, "controller halted");
                // Best effort: the halt itself must not mask the cause.
                let _ = self.append_ledger(LedgerTitle::Halt, Decimal::ZERO);
                Err(e)
            }
        }
    }

    async fn watch_loop(&self) -> Result<()> {
        if !self.position_open().await? {
            info!(instrument = %self.ids.swap, "no open position to monitor");
            return Ok(());
        }

        let spot_fee = self
            .gateway
            .get_trade_fee(&self.ids.spot, Market::Spot)
            .await?
            .taker;
        let swap_fee = self
            .gateway
            .get_trade_fee(&self.ids.swap, Market::Swap)
            .await?
            .taker;
        let round_trip_fee = spot_fee + swap_fee;

        let mut liquidation_price = self.reader.liquidation_price().await?;
        info!(
            instrument = %self.ids.currency,
            leverage = self.leverage,
            %liquidation_price,
            "monitoring started"
        );

        let mut hourly_done = false;
        let mut margin_reducible = true;
        let mut active: Option<RunningOp> = None;

        while !self.exit.is_set() {
            let began = Instant::now();
            let now = self.clock.now();

            let ticker = match self.gateway.get_ticker(&self.ids.swap).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "swap ticker read failed");
                    if let Some(op) = active.take() {
                        // Let the in-flight operation settle before halting.
                        op.task.join().await?;
                    }
                    return Err(e);
                }
            };
            let last = ticker.last;

            // Hourly refresh, gated so it runs exactly once per clock hour.
            if !hourly_done && now.minute() == 1 {
                let funding = self.gateway.get_funding_info(&self.ids.swap).await?;
                liquidation_price = self.reader.liquidation_price().await?;
                if liquidation_price.is_zero() {
                    return Err(BotError::NoPosition(self.ids.swap.clone()));
                }

                let open = self.require_open_stat(self.stat_lookback_hours).await?;
                let close = self.require_close_stat(self.stat_lookback_hours).await?;
                let cost = reopen_cost(&open, &close, round_trip_fee);
                let expected = funding.current_rate + funding.next_rate;
                if funding_window_close(
                    now.hour(),
                    self.pre_funding_close_hours,
                    self.funding_cycle_hours,
                    expected,
                    cost,
                ) {
                    info!(
                        current = %funding.current_rate,
                        next = %funding.next_rate,
                        reopen_cost = %cost,
                        "funding no longer pays the reopen cost, closing"
                    );
                    if let Some(op) = active.take() {
                        op.task.stop_and_join().await?;
                    }
                    let params = ReduceParams {
                        target_size: Decimal::ZERO,
                        price_diff: close.avg - close.std,
                        accelerate_after: self.accelerate_after_hours,
                    };
                    self.executor().close_all(&params).await?;
                    self.backfill_portfolio_size().await?;
                    return Ok(());
                }
                if now.hour() % self.funding_cycle_hours == 0 {
                    self.record_funding().await?;
                    info!(
                        current = %funding.current_rate,
                        next = %funding.next_rate,
                        "funding settled"
                    );
                }
                hourly_done = true;
            } else if hourly_done && now.minute() == 2 {
                hourly_done = false;
            }

            active = match active {
                None => {
                    self.evaluate_thresholds(liquidation_price, last, &mut margin_reducible)
                        .await?
                }
                Some(op) if op.task.is_finished() => {
                    let filled = op.task.join().await?;
                    info!(kind = op.kind.as_str(), %filled, "operation finished");
                    liquidation_price = self.reader.liquidation_price().await?;
                    self.backfill_portfolio_size().await?;
                    None
                }
                Some(op) => {
                    self.monitor_active(op, &mut liquidation_price, last, now)
                        .await?
                }
            };

            let elapsed = began.elapsed();
            if elapsed < self.min_tick_spacing {
                sleep(self.min_tick_spacing - elapsed).await;
            }
        }

        if let Some(op) = active.take() {
            if let Err(e) = op.task.stop_and_join().await {
                warn!(error = %e, "in-flight operation failed during shutdown");
            }
        }
        info!(instrument = %self.ids.currency, "monitoring stopped");
        Ok(())
    }

    /// Idle-state decision: launch at most one operation per tick.
    async fn evaluate_thresholds(
        &self,
        liquidation_price: Decimal,
        last: Decimal,
        margin_reducible: &mut bool,
    ) -> Result<Option<RunningOp>> {
        let leverage = self.leverage_dec();

        if reduce_trigger(liquidation_price, last, leverage) {
            self.reader.assert_hedged().await?;
            let close = self.require_close_stat(self.stat_lookback_hours).await?;
            warn!(
                %liquidation_price,
                %last,
                "liquidation price approaching, reducing"
            );
            self.append_ledger(LedgerTitle::AutoReduce, Decimal::ZERO)?;

            let swap_size = self.reader.swap_size().await?;
            let params = ReduceParams {
                target_size: reduce_target(swap_size, leverage),
                price_diff: close_threshold(&close),
                accelerate_after: self.accelerate_after_hours,
            };
            let task = ExecutorTask::spawn_reduce(self.executor(), params);
            return Ok(Some(RunningOp {
                kind: OpKind::Reduce,
                task,
                deadline: self.accel_deadline(),
                accelerated: false,
                usdt_remaining: Decimal::ZERO,
            }));
        }

        if *margin_reducible && add_trigger(liquidation_price, last, leverage) {
            self.reader.assert_hedged().await?;
            let open = self.require_open_stat(self.stat_lookback_hours).await?;
            info!(
                %liquidation_price,
                %last,
                "margin above target leverage, adding"
            );
            self.append_ledger(LedgerTitle::AutoAdd, Decimal::ZERO)?;

            let usdt_size = self.reader.release_excess_margin(self.leverage).await?;
            if usdt_size.is_zero() {
                warn!("no margin left to release, add path disabled");
                *margin_reducible = false;
                return Ok(None);
            }
            let params = AddParams {
                usdt_size,
                target_size: Decimal::ZERO,
                leverage: self.leverage,
                price_diff: entry_threshold(&open),
                accelerate_after: self.accelerate_after_hours,
            };
            let task = ExecutorTask::spawn_add(self.executor(), params);
            return Ok(Some(RunningOp {
                kind: OpKind::Add,
                task,
                deadline: self.accel_deadline(),
                accelerated: false,
                usdt_remaining: usdt_size,
            }));
        }

        Ok(None)
    }

    /// Escalation checks for an operation still in flight.
    async fn monitor_active(
        &self,
        op: RunningOp,
        liquidation_price: &mut Decimal,
        last: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<RunningOp>> {
        let leverage = self.leverage_dec();
        let RunningOp {
            kind,
            task,
            deadline,
            accelerated,
            usdt_remaining,
        } = op;

        match kind {
            OpKind::Reduce => {
                if !accelerated && proximity_trigger(*liquidation_price, last, leverage) {
                    warn!(
                        %liquidation_price,
                        %last,
                        "liquidation price crossed the inner band, escalating reduce"
                    );
                    task.stop_and_join().await?;

                    let close = self.require_close_stat(1).await?;
                    *liquidation_price = self.reader.liquidation_price().await?;
                    let swap_size = self.reader.swap_size().await?;
                    let params = ReduceParams {
                        target_size: escalation_target(
                            swap_size,
                            *liquidation_price,
                            last,
                            leverage,
                        ),
                        price_diff: close.avg - dec!(1.5) * close.std,
                        accelerate_after: self.accelerate_after_hours,
                    };
                    let task = ExecutorTask::spawn_reduce(self.executor(), params);
                    return Ok(Some(RunningOp {
                        kind,
                        task,
                        deadline: self.accel_deadline(),
                        accelerated: true,
                        usdt_remaining: Decimal::ZERO,
                    }));
                }

                if now > deadline {
                    info!("reduce still running past its deadline, widening threshold");
                    task.stop_and_join().await?;

                    let close = self.require_close_stat(self.accelerate_after_hours).await?;
                    *liquidation_price = self.reader.liquidation_price().await?;
                    let swap_size = self.reader.swap_size().await?;
                    let params = ReduceParams {
                        target_size: escalation_target(
                            swap_size,
                            *liquidation_price,
                            last,
                            leverage,
                        ),
                        price_diff: close_threshold(&close),
                        accelerate_after: self.accelerate_after_hours,
                    };
                    let task = ExecutorTask::spawn_reduce(self.executor(), params);
                    return Ok(Some(RunningOp {
                        kind,
                        task,
                        deadline: self.accel_deadline(),
                        accelerated,
                        usdt_remaining: Decimal::ZERO,
                    }));
                }

                Ok(Some(RunningOp {
                    kind,
                    task,
                    deadline,
                    accelerated,
                    usdt_remaining,
                }))
            }
            OpKind::Add => {
                if now > deadline {
                    info!("add still running past its deadline, widening threshold");
                    let filled = task.stop_and_join().await?;

                    let open = self.require_open_stat(self.accelerate_after_hours).await?;
                    // Deployed quote: spot notional plus the margin slice.
                    let spent =
                        filled * last * (Decimal::ONE + Decimal::ONE / leverage);
                    let remaining = usdt_remaining - spent;
                    if remaining <= Decimal::ZERO {
                        info!("add target reached across relaunches");
                        *liquidation_price = self.reader.liquidation_price().await?;
                        return Ok(None);
                    }
                    let params = AddParams {
                        usdt_size: remaining,
                        target_size: Decimal::ZERO,
                        leverage: self.leverage,
                        price_diff: entry_threshold(&open),
                        accelerate_after: self.accelerate_after_hours,
                    };
                    let task = ExecutorTask::spawn_add(self.executor(), params);
                    return Ok(Some(RunningOp {
                        kind,
                        task,
                        deadline: self.accel_deadline(),
                        accelerated,
                        usdt_remaining: remaining,
                    }));
                }

                Ok(Some(RunningOp {
                    kind,
                    task,
                    deadline,
                    accelerated,
                    usdt_remaining,
                }))
            }
        }
    }
}
