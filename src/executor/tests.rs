use super::*;
use crate::exchange::mock::{ticker, FillScript, MockGateway};
use crate::exchange::types::{InstrumentSpec, Market, OrderType, Side};
use crate::stats::FixedStats;
use crate::store::{LedgerTitle, MemoryStore, RecordStore};
use rust_decimal_macros::dec;

#[test]
fn test_exit_flag_is_shared() {
    let flag = ExitFlag::new();
    let other = flag.clone();
    assert!(!other.is_set());
    flag.trigger();
    assert!(other.is_set());
}

#[test]
fn test_spread_thresholds_keep_their_tails() {
    let stat = SpreadStat {
        avg: dec!(0.001),
        std: dec!(0.0004),
    };
    assert_eq!(entry_threshold(&stat), dec!(0.0018));
    assert_eq!(close_threshold(&stat), dec!(0.0002));
    // The close ceiling never crosses to the rich side of the mean.
    assert!(close_threshold(&stat) < stat.avg);
    assert!(entry_threshold(&stat) > stat.avg);
}

fn spot_spec() -> InstrumentSpec {
    InstrumentSpec {
        inst_id: "BTC-USDT".to_string(),
        min_size: dec!(0.0001),
        lot_size: dec!(0.0001),
        tick_size: dec!(0.1),
        contract_value: Decimal::ZERO,
    }
}

fn swap_spec() -> InstrumentSpec {
    InstrumentSpec {
        inst_id: "BTC-USDT-SWAP".to_string(),
        min_size: dec!(1),
        lot_size: dec!(1),
        tick_size: dec!(0.1),
        contract_value: dec!(0.01),
    }
}

fn gateway() -> Arc<MockGateway> {
    Arc::new(
        MockGateway::new()
            .with_instrument(Market::Spot, spot_spec())
            .with_instrument(Market::Swap, swap_spec()),
    )
}

async fn executor(gw: Arc<MockGateway>, store: Arc<MemoryStore>) -> Executor {
    Executor::new(
        gw,
        store,
        Arc::new(FixedStats::empty()),
        1,
        "BTC",
        ExitFlag::new(),
    )
    .await
    .unwrap()
}

/// Queue a spot/swap ticker pair with a swap premium above threshold.
async fn queue_premium_tick(gw: &MockGateway) {
    gw.push_ticker(ticker(
        "BTC-USDT",
        dec!(50000),
        dec!(49999),
        dec!(5),
        dec!(50000),
        dec!(5),
    ))
    .await;
    gw.push_ticker(ticker(
        "BTC-USDT-SWAP",
        dec!(50100),
        dec!(50100),
        dec!(1000),
        dec!(50101),
        dec!(1000),
    ))
    .await;
}

fn add_params(target: Decimal) -> AddParams {
    AddParams {
        usdt_size: Decimal::ZERO,
        target_size: target,
        leverage: 3,
        price_diff: dec!(0.001),
        accelerate_after: 0,
    }
}

#[tokio::test]
async fn test_add_fills_target_and_stays_hedged() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, dec!(1));

    // Hedge-balance invariant after the operation.
    let spot = gw.get_spot_holding("BTC").await.unwrap();
    let swap = gw
        .get_swap_position("BTC-USDT-SWAP")
        .await
        .unwrap()
        .unwrap();
    assert!((spot - swap.contracts.abs() * dec!(0.01)).abs() < dec!(0.01));

    // Ledger rows for spot, swap, and fees; checkpoint gone.
    let rows = store.recent_ledger(1, "BTC", 10).unwrap();
    let titles: Vec<_> = rows.iter().map(|r| r.title).collect();
    assert!(titles.contains(&LedgerTitle::SpotBuy));
    assert!(titles.contains(&LedgerTitle::SwapOpenShort));
    assert!(titles.contains(&LedgerTitle::Fee));
    assert!(store.find_checkpoint(1, "BTC").unwrap().is_none());

    // No lingering open orders.
    assert!(gw.live_orders().await.is_empty());
}

#[tokio::test]
async fn test_add_below_one_contract_places_no_orders() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(0.005))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(gw.placed_orders().await.is_empty());
    assert!(store.recent_ledger(1, "BTC", 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_add_no_entry_below_premium_threshold() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    // Swap premium of 0.02% with a 0.1% threshold: no trade.
    gw.push_ticker(ticker(
        "BTC-USDT",
        dec!(50000),
        dec!(49999),
        dec!(5),
        dec!(50000),
        dec!(5),
    ))
    .await;
    gw.push_ticker(ticker(
        "BTC-USDT-SWAP",
        dec!(50010),
        dec!(50010),
        dec!(1000),
        dec!(50011),
        dec!(1000),
    ))
    .await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    // Queue drains without an entry, which surfaces as a stream error
    // rather than a silent spin.
    let result = exec.add(&add_params(dec!(1))).await;
    assert!(gw.placed_orders().await.is_empty());
    assert!(result.is_err());
}

#[tokio::test]
async fn test_add_retries_canceled_swap_leg_at_market() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.push_ticker(ticker(
        "BTC-USDT-SWAP",
        dec!(50100),
        dec!(50100),
        dec!(1000),
        dec!(50101),
        dec!(1000),
    ))
    .await;
    gw.script_order(Market::Swap, FillScript::Cancel).await;
    // Next swap order (the market retry) fills by default.
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, dec!(1));

    let placed = gw.placed_orders().await;
    let market_retries: Vec<_> = placed
        .iter()
        .filter(|o| o.market == Market::Swap && o.order_type == OrderType::Market)
        .collect();
    assert_eq!(market_retries.len(), 1);
    assert!(gw.live_orders().await.is_empty());
}

#[tokio::test]
async fn test_add_retries_canceled_spot_leg_with_higher_limit() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.script_order(Market::Spot, FillScript::Cancel).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, dec!(1));

    let placed = gw.placed_orders().await;
    let limit_retry = placed
        .iter()
        .find(|o| {
            o.market == Market::Spot
                && o.side == Side::Buy
                && o.order_type == OrderType::Limit
        })
        .expect("spot retry placed");
    // Re-priced 2% above the original 50000 ask.
    assert_eq!(limit_retry.price, Some(dec!(51000)));
}

#[tokio::test]
async fn test_add_aborts_when_both_legs_killed() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.script_order(Market::Spot, FillScript::Cancel).await;
    gw.script_order(Market::Swap, FillScript::Cancel).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(exec.exit_flag().is_set());
    // Nothing filled, so no trade ledger rows.
    assert!(store.recent_ledger(1, "BTC", 10).unwrap().is_empty());
    assert!(store.find_checkpoint(1, "BTC").unwrap().is_none());
}

#[tokio::test]
async fn test_add_aborts_after_retry_also_cancels() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.script_order(Market::Swap, FillScript::Cancel).await;
    gw.script_order(Market::Swap, FillScript::Cancel).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(exec.exit_flag().is_set());
    assert!(gw.live_orders().await.is_empty());
}

#[tokio::test]
async fn test_add_rejected_submission_aborts_operation() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.script_order(
        Market::Swap,
        FillScript::Reject {
            code: "51022".to_string(),
            message: "futures market down".to_string(),
        },
    )
    .await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(exec.exit_flag().is_set());
}

#[tokio::test]
async fn test_add_settles_surviving_spot_leg_after_swap_rejection() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    // Spot leg fills (default script) while the swap leg is rejected;
    // the unpaired spot fill must still reach the ledger.
    gw.script_order(
        Market::Swap,
        FillScript::Reject {
            code: "51022".to_string(),
            message: "futures market down".to_string(),
        },
    )
    .await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(exec.exit_flag().is_set());

    let rows = store.recent_ledger(1, "BTC", 10).unwrap();
    let spot_buy = rows
        .iter()
        .find(|r| r.title == LedgerTitle::SpotBuy)
        .expect("orphan spot fill not ledgered");
    assert!(spot_buy.amount < Decimal::ZERO);
    assert!(rows.iter().any(|r| r.title == LedgerTitle::Fee));
    assert!(gw.get_spot_holding("BTC").await.unwrap() > Decimal::ZERO);
}

#[tokio::test]
async fn test_add_shrinks_then_aborts_on_insufficient_balance() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.set_balance(dec!(1)).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(exec.exit_flag().is_set());
    assert!(gw.placed_orders().await.is_empty());
}

#[tokio::test]
async fn test_exit_flag_stops_before_trading() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;
    exec.exit_flag().trigger();

    let filled = exec.add(&add_params(dec!(1))).await.unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(gw.placed_orders().await.is_empty());
}

fn reduce_params(target: Decimal) -> ReduceParams {
    ReduceParams {
        target_size: target,
        price_diff: dec!(0.001),
        accelerate_after: 0,
    }
}

/// Queue a spot/swap ticker pair with a close premium under threshold.
async fn queue_close_tick(gw: &MockGateway) {
    gw.push_ticker(ticker(
        "BTC-USDT",
        dec!(50000),
        dec!(50000),
        dec!(5),
        dec!(50001),
        dec!(5),
    ))
    .await;
    gw.push_ticker(ticker(
        "BTC-USDT-SWAP",
        dec!(50005),
        dec!(50004),
        dec!(1000),
        dec!(50005),
        dec!(1000),
    ))
    .await;
}

#[tokio::test]
async fn test_reduce_to_target_size() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    gw.set_spot_holding(dec!(1)).await;
    gw.set_swap_contracts(dec!(-100)).await;
    queue_close_tick(&gw).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    // Reduce from 1.0 down to 0.4 underlying.
    let closed = exec.reduce(&reduce_params(dec!(0.4))).await.unwrap();
    assert_eq!(closed, dec!(0.6));

    let pos = gw
        .get_swap_position("BTC-USDT-SWAP")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pos.contracts, dec!(-40));

    let rows = store.recent_ledger(1, "BTC", 10).unwrap();
    let titles: Vec<_> = rows.iter().map(|r| r.title).collect();
    assert!(titles.contains(&LedgerTitle::SpotSell));
    assert!(titles.contains(&LedgerTitle::SwapCloseShort));
    assert!(store.find_checkpoint(1, "BTC").unwrap().is_none());
}

#[tokio::test]
async fn test_reduce_with_no_position_is_noop() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let closed = exec.reduce(&reduce_params(Decimal::ZERO)).await.unwrap();
    assert_eq!(closed, Decimal::ZERO);
    assert!(gw.placed_orders().await.is_empty());
}

#[tokio::test]
async fn test_close_all_records_closing_entry() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    gw.set_spot_holding(dec!(1)).await;
    gw.set_swap_contracts(dec!(-100)).await;
    queue_close_tick(&gw).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let closed = exec.close_all(&reduce_params(dec!(99))).await.unwrap();
    assert_eq!(closed, dec!(1));
    assert!(gw
        .get_swap_position("BTC-USDT-SWAP")
        .await
        .unwrap()
        .is_none());

    let rows = store.recent_ledger(1, "BTC", 10).unwrap();
    assert_eq!(rows[0].title, LedgerTitle::Close);
}

#[tokio::test]
async fn test_open_records_opening_entry_and_funds_target() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    // get_ticker peeks the queued spot ticker for the funding computation.
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec
        .open(&AddParams {
            usdt_size: dec!(60000),
            target_size: Decimal::ZERO,
            leverage: 3,
            price_diff: dec!(0.001),
            accelerate_after: 0,
        })
        .await
        .unwrap();
    assert!(filled > Decimal::ZERO);

    let rows = store.recent_ledger(1, "BTC", 10).unwrap();
    assert!(rows.iter().any(|r| r.title == LedgerTitle::Open));

    let book = store.find_portfolio(1, "BTC").unwrap().unwrap();
    assert_eq!(book.leverage, 3);
    assert_eq!(book.size, filled);
}

#[tokio::test]
async fn test_open_with_insufficient_balance_fills_nothing() {
    let gw = gateway();
    let store = Arc::new(MemoryStore::new());
    queue_premium_tick(&gw).await;
    gw.set_balance(dec!(100)).await;
    let exec = executor(Arc::clone(&gw), Arc::clone(&store)).await;

    let filled = exec
        .open(&AddParams {
            usdt_size: dec!(60000),
            target_size: Decimal::ZERO,
            leverage: 3,
            price_diff: dec!(0.001),
            accelerate_after: 0,
        })
        .await
        .unwrap();
    assert_eq!(filled, Decimal::ZERO);
    assert!(gw.placed_orders().await.is_empty());
}
