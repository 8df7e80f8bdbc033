//! Scripted in-memory gateway for executor and controller tests.
//!
//! Tickers are queued ahead of time and drained across resubscriptions;
//! order outcomes are scripted per market so tests can simulate one leg
//! filling while the other cancels.

use crate::error::{BotError, Result};
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::*;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Scripted outcome for the next order placed on a market.
#[derive(Debug, Clone)]
pub enum FillScript {
    /// Order fills completely at its limit price (or `last` for market orders).
    Fill,
    /// FOK kill: order is acknowledged then reported canceled with no fill.
    Cancel,
    /// The API call itself fails with an exchange error.
    Reject { code: String, message: String },
}

#[derive(Debug, Default)]
struct MockState {
    tickers: VecDeque<TickerEvent>,
    /// Last ticker consumed per instrument; replayed when stalling and
    /// served by `get_ticker` once the queue is drained.
    last_tickers: HashMap<String, Ticker>,
    /// Keep subscriptions open after the queue drains, replaying the
    /// last tickers, so a controller test can hold a task in flight.
    stall: bool,
    subscriptions: u64,
    scripts: HashMap<Market, VecDeque<FillScript>>,
    orders: HashMap<String, OrderDetail>,
    placed: Vec<OrderRequest>,
    canceled_ids: Vec<String>,
    balance: Balance,
    spot_holding: Decimal,
    swap_contracts: Decimal,
    liquidation_price: Decimal,
    position_margin: Decimal,
    leverage: u32,
    funding: Option<FundingInfo>,
    bills: Vec<Bill>,
    margin_adjustments: Vec<Decimal>,
}

/// In-memory gateway with scripted tickers and order outcomes.
pub struct MockGateway {
    state: Arc<RwLock<MockState>>,
    order_id_counter: AtomicU64,
    instruments: HashMap<(String, Market), InstrumentSpec>,
    spot_taker_fee: Decimal,
    swap_taker_fee: Decimal,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState {
                balance: Balance {
                    total: dec!(100000),
                    available: dec!(100000),
                },
                leverage: 3,
                ..Default::default()
            })),
            order_id_counter: AtomicU64::new(1),
            instruments: HashMap::new(),
            spot_taker_fee: dec!(0.001),
            swap_taker_fee: dec!(0.0005),
        }
    }

    /// Register instrument metadata served by `get_instrument`.
    pub fn with_instrument(mut self, market: Market, spec: InstrumentSpec) -> Self {
        self.instruments.insert((spec.inst_id.clone(), market), spec);
        self
    }

    pub async fn push_ticker(&self, ticker: Ticker) {
        self.state
            .write()
            .await
            .tickers
            .push_back(TickerEvent::Ticker(ticker));
    }

    /// Queue the outcome for the next order placed on `market`.
    pub async fn script_order(&self, market: Market, script: FillScript) {
        self.state
            .write()
            .await
            .scripts
            .entry(market)
            .or_default()
            .push_back(script);
    }

    pub async fn set_balance(&self, available: Decimal) {
        let mut state = self.state.write().await;
        state.balance = Balance {
            total: available,
            available,
        };
    }

    pub async fn set_spot_holding(&self, size: Decimal) {
        self.state.write().await.spot_holding = size;
    }

    pub async fn set_swap_contracts(&self, contracts: Decimal) {
        self.state.write().await.swap_contracts = contracts;
    }

    pub async fn set_liquidation_price(&self, price: Decimal) {
        self.state.write().await.liquidation_price = price;
    }

    pub async fn set_position_margin(&self, margin: Decimal) {
        self.state.write().await.position_margin = margin;
    }

    pub async fn set_funding(&self, funding: FundingInfo) {
        self.state.write().await.funding = Some(funding);
    }

    pub async fn push_bill(&self, bill: Bill) {
        self.state.write().await.bills.push(bill);
    }

    /// All order requests placed so far, in submission order.
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.placed.clone()
    }

    /// Orders still in a non-terminal state (should be empty after an
    /// executor run: no lingering open orders).
    pub async fn live_orders(&self) -> Vec<OrderDetail> {
        self.state
            .read()
            .await
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn margin_adjustments(&self) -> Vec<Decimal> {
        self.state.read().await.margin_adjustments.clone()
    }

    /// Keep ticker streams open after the queue drains, replaying the
    /// last seen tickers instead of closing.
    pub async fn keep_stream_open(&self) {
        self.state.write().await.stall = true;
    }

    /// Number of `subscribe_tickers` calls so far.
    pub async fn subscription_count(&self) -> u64 {
        self.state.read().await.subscriptions
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn taker_fee(&self, market: Market) -> Decimal {
        match market {
            Market::Spot => self.spot_taker_fee,
            Market::Swap => self.swap_taker_fee,
        }
    }

    fn contract_value(&self, inst_id: &str) -> Decimal {
        self.instruments
            .get(&(inst_id.to_string(), Market::Swap))
            .map(|s| s.contract_value)
            .unwrap_or(Decimal::ONE)
    }

    /// Apply a filled order to holdings and balance.
    fn settle_fill(&self, state: &mut MockState, order: &OrderRequest, detail: &OrderDetail) {
        match order.market {
            Market::Spot => {
                let notional = detail.filled_size * detail.avg_price;
                match order.side {
                    Side::Buy => {
                        // Spot fee is charged in base units on buys.
                        state.spot_holding += detail.filled_size + detail.fee;
                        state.balance.available -= notional;
                        state.balance.total -= notional;
                    }
                    Side::Sell => {
                        state.spot_holding -= detail.filled_size;
                        state.balance.available += notional + detail.fee * detail.avg_price;
                        state.balance.total += notional + detail.fee * detail.avg_price;
                    }
                }
            }
            Market::Swap => {
                match order.side {
                    // Buy closes short exposure, sell opens it.
                    Side::Buy => state.swap_contracts += detail.filled_size,
                    Side::Sell => state.swap_contracts -= detail.filled_size,
                }
                state.balance.available += detail.fee;
                state.balance.total += detail.fee;
            }
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn get_ticker(&self, inst_id: &str) -> Result<Ticker> {
        // Peek the next queued ticker for this instrument without consuming
        // the stream script; fall back to the last consumed one.
        let state = self.state.read().await;
        state
            .tickers
            .iter()
            .find_map(|ev| match ev {
                TickerEvent::Ticker(t) if t.inst_id == inst_id => Some(t.clone()),
                _ => None,
            })
            .or_else(|| state.last_tickers.get(inst_id).cloned())
            .ok_or_else(|| BotError::exchange("mock", format!("no ticker queued for {inst_id}")))
    }

    async fn subscribe_tickers(&self, inst_ids: &[String]) -> Result<mpsc::Receiver<TickerEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let state = Arc::clone(&self.state);
        let wanted: Vec<String> = inst_ids.to_vec();
        self.state.write().await.subscriptions += 1;
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut s = state.write().await;
                    loop {
                        let skip = match s.tickers.front() {
                            Some(TickerEvent::Ticker(t)) => !wanted.contains(&t.inst_id),
                            Some(_) => false,
                            None => break None,
                        };
                        let ev = s.tickers.pop_front();
                        if let Some(TickerEvent::Ticker(t)) = &ev {
                            s.last_tickers.insert(t.inst_id.clone(), t.clone());
                        }
                        if !skip {
                            break ev;
                        }
                    }
                };
                match next {
                    Some(ev) => {
                        if tx.send(ev).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        if !state.read().await.stall {
                            return; // queue drained; receiver closes
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                        let replay: Vec<TickerEvent> = {
                            let s = state.read().await;
                            wanted
                                .iter()
                                .filter_map(|id| s.last_tickers.get(id).cloned())
                                .map(TickerEvent::Ticker)
                                .collect()
                        };
                        for ev in replay {
                            if tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn get_instrument(&self, inst_id: &str, market: Market) -> Result<InstrumentSpec> {
        self.instruments
            .get(&(inst_id.to_string(), market))
            .cloned()
            .ok_or_else(|| BotError::exchange("mock", format!("unknown instrument {inst_id}")))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state.write().await;
        state.placed.push(order.clone());

        let script = state
            .scripts
            .get_mut(&order.market)
            .and_then(|q| q.pop_front())
            .unwrap_or(FillScript::Fill);

        match script {
            FillScript::Reject { code, message } => {
                debug!(inst_id = %order.inst_id, %code, "mock order rejected");
                Err(BotError::Exchange { code, message })
            }
            FillScript::Cancel => {
                let order_id = self.next_order_id();
                state.orders.insert(
                    order_id.clone(),
                    OrderDetail {
                        order_id: order_id.clone(),
                        state: OrderState::Canceled,
                        filled_size: Decimal::ZERO,
                        avg_price: Decimal::ZERO,
                        fee: Decimal::ZERO,
                    },
                );
                Ok(OrderAck {
                    order_id,
                    state: OrderState::Canceled,
                })
            }
            FillScript::Fill => {
                let order_id = self.next_order_id();
                let price = order.price.unwrap_or_else(|| {
                    state
                        .tickers
                        .iter()
                        .find_map(|ev| match ev {
                            TickerEvent::Ticker(t) if t.inst_id == order.inst_id => Some(t.last),
                            _ => None,
                        })
                        .unwrap_or(dec!(1))
                });
                let fee = match order.market {
                    // Base-currency fee on spot buys, quote on everything else.
                    Market::Spot => -order.size * self.taker_fee(Market::Spot),
                    Market::Swap => {
                        let notional = order.size * self.contract_value(&order.inst_id) * price;
                        -notional * self.taker_fee(Market::Swap)
                    }
                };
                let detail = OrderDetail {
                    order_id: order_id.clone(),
                    state: OrderState::Filled,
                    filled_size: order.size,
                    avg_price: price,
                    fee,
                };
                self.settle_fill(&mut state, order, &detail);
                state.orders.insert(order_id.clone(), detail);
                debug!(inst_id = %order.inst_id, %order_id, "mock order filled");
                Ok(OrderAck {
                    order_id,
                    state: OrderState::Filled,
                })
            }
        }
    }

    async fn get_order(&self, _inst_id: &str, order_id: &str) -> Result<OrderDetail> {
        self.state
            .read()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BotError::exchange("mock", format!("unknown order {order_id}")))
    }

    async fn cancel_orders(&self, _inst_id: &str, order_ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in order_ids {
            if let Some(order) = state.orders.get_mut(id) {
                order.state = OrderState::Canceled;
            }
            state.canceled_ids.push(id.clone());
        }
        Ok(())
    }

    async fn get_leverage(&self, _inst_id: &str) -> Result<LeverageSetting> {
        let state = self.state.read().await;
        Ok(LeverageSetting {
            leverage: Decimal::from(state.leverage),
            isolated: true,
        })
    }

    async fn set_leverage(&self, _inst_id: &str, leverage: u32) -> Result<()> {
        self.state.write().await.leverage = leverage;
        Ok(())
    }

    async fn get_trade_fee(&self, _inst_id: &str, market: Market) -> Result<TradeFee> {
        Ok(TradeFee {
            taker: self.taker_fee(market),
            maker: self.taker_fee(market) / dec!(2),
        })
    }

    async fn get_balance(&self) -> Result<Balance> {
        Ok(self.state.read().await.balance)
    }

    async fn get_spot_holding(&self, _currency: &str) -> Result<Decimal> {
        Ok(self.state.read().await.spot_holding)
    }

    async fn get_swap_position(&self, inst_id: &str) -> Result<Option<SwapPosition>> {
        let state = self.state.read().await;
        if state.swap_contracts == Decimal::ZERO {
            return Ok(None);
        }
        let last = state
            .tickers
            .iter()
            .find_map(|ev| match ev {
                TickerEvent::Ticker(t) if t.inst_id == inst_id => Some(t.last),
                _ => None,
            })
            .or_else(|| state.last_tickers.get(inst_id).map(|t| t.last))
            .unwrap_or(Decimal::ZERO);
        Ok(Some(SwapPosition {
            contracts: state.swap_contracts,
            avg_price: last,
            liquidation_price: state.liquidation_price,
            margin: state.position_margin,
            unrealized_pnl: Decimal::ZERO,
            leverage: Decimal::from(state.leverage),
            last,
        }))
    }

    async fn get_funding_info(&self, _inst_id: &str) -> Result<FundingInfo> {
        self.state
            .read()
            .await
            .funding
            .clone()
            .ok_or_else(|| BotError::exchange("mock", "no funding info set"))
    }

    async fn get_account_bills(&self, bill_type: BillType, limit: usize) -> Result<Vec<Bill>> {
        let state = self.state.read().await;
        Ok(state
            .bills
            .iter()
            .rev()
            .filter(|b| b.bill_type == bill_type)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn adjust_position_margin(&self, _inst_id: &str, amount: Decimal) -> Result<()> {
        let mut state = self.state.write().await;
        state.position_margin += amount;
        state.balance.available -= amount;
        state.margin_adjustments.push(amount);
        Ok(())
    }
}

/// Build a ticker for tests.
pub fn ticker(
    inst_id: &str,
    last: Decimal,
    bid: Decimal,
    bid_size: Decimal,
    ask: Decimal,
    ask_size: Decimal,
) -> Ticker {
    Ticker {
        inst_id: inst_id.to_string(),
        last,
        bid_price: bid,
        bid_size,
        ask_price: ask,
        ask_size,
        ts: Utc::now().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap_spec() -> InstrumentSpec {
        InstrumentSpec {
            inst_id: "BTC-USDT-SWAP".to_string(),
            min_size: dec!(1),
            lot_size: dec!(1),
            tick_size: dec!(0.1),
            contract_value: dec!(0.01),
        }
    }

    #[tokio::test]
    async fn test_fill_script_updates_holdings() {
        let gw = MockGateway::new().with_instrument(Market::Swap, swap_spec());
        gw.push_ticker(ticker(
            "BTC-USDT-SWAP",
            dec!(50000),
            dec!(50000),
            dec!(10),
            dec!(50001),
            dec!(10),
        ))
        .await;

        let ack = gw
            .place_order(&OrderRequest {
                inst_id: "BTC-USDT-SWAP".to_string(),
                market: Market::Swap,
                side: Side::Sell,
                order_type: OrderType::Fok,
                size: dec!(5),
                price: Some(dec!(50000)),
            })
            .await
            .unwrap();

        assert_eq!(ack.state, OrderState::Filled);
        let detail = gw.get_order("BTC-USDT-SWAP", &ack.order_id).await.unwrap();
        assert_eq!(detail.filled_size, dec!(5));
        // Short 5 contracts now open.
        let pos = gw.get_swap_position("BTC-USDT-SWAP").await.unwrap().unwrap();
        assert_eq!(pos.contracts, dec!(-5));
    }

    #[tokio::test]
    async fn test_cancel_script_reports_no_fill() {
        let gw = MockGateway::new();
        gw.script_order(Market::Spot, FillScript::Cancel).await;

        let ack = gw
            .place_order(&OrderRequest {
                inst_id: "BTC-USDT".to_string(),
                market: Market::Spot,
                side: Side::Buy,
                order_type: OrderType::Fok,
                size: dec!(0.1),
                price: Some(dec!(50000)),
            })
            .await
            .unwrap();

        assert_eq!(ack.state, OrderState::Canceled);
        let detail = gw.get_order("BTC-USDT", &ack.order_id).await.unwrap();
        assert_eq!(detail.filled_size, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_subscription_drains_queue_across_resubscribes() {
        let gw = MockGateway::new();
        for _ in 0..3 {
            gw.push_ticker(ticker(
                "BTC-USDT",
                dec!(100),
                dec!(99),
                dec!(1),
                dec!(101),
                dec!(1),
            ))
            .await;
        }

        let mut rx = gw
            .subscribe_tickers(&["BTC-USDT".to_string()])
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        // Remaining events survive for the next subscription.
        let mut rx = gw
            .subscribe_tickers(&["BTC-USDT".to_string()])
            .await
            .unwrap();
        let mut seen = 0;
        while rx.recv().await.is_some() {
            seen += 1;
        }
        assert!(seen >= 1);
    }
}
