//! End-to-end engine scenarios against the mock venue: create, fill, pair,
//! crash-recover, and failover behavior observed through the public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use gridbroker::engine::{BotState, CreateBotRequest, GridEngine};
use gridbroker::error::VenueResult;
use gridbroker::venue::gateway::{ExchangeGateway, GatewayFactory, MockGateway};
use gridbroker::venue::proxy::{ProxyFault, ProxyPool, ProxyPoolConfig};
use gridbroker::venue::types::{AccountInfo, Balance, Side, SymbolInfo};
use gridbroker::venue::ClockHandle;
use gridbroker::{EngineSettings, MemoryStore, Store};

struct MockFactory {
    gw: Arc<MockGateway>,
}

#[async_trait]
impl GatewayFactory for MockFactory {
    async fn gateway_for(
        &self,
        _owner: &str,
        _test_mode: bool,
    ) -> VenueResult<Arc<dyn ExchangeGateway>> {
        Ok(self.gw.clone())
    }
}

fn symbol() -> SymbolInfo {
    SymbolInfo {
        symbol: "FOOUSDT".into(),
        base_asset: "FOO".into(),
        quote_asset: "USDT".into(),
        tick_size: dec!(0.001),
        step_size: dec!(0.01),
        min_qty: dec!(0.1),
        min_notional: dec!(5),
        price_precision: 3,
        quantity_precision: 2,
    }
}

fn account(quote: Decimal, base: Decimal) -> AccountInfo {
    AccountInfo {
        can_trade: true,
        balances: vec![
            Balance {
                asset: "USDT".into(),
                free: quote,
                locked: dec!(0),
            },
            Balance {
                asset: "FOO".into(),
                free: base,
                locked: dec!(0),
            },
        ],
    }
}

fn request() -> CreateBotRequest {
    CreateBotRequest {
        symbol: "FOOUSDT".into(),
        investment: dec!(110),
        upper_price: Some(dec!(11)),
        lower_price: Some(dec!(9)),
        grid_levels: Some(11),
        profit_per_grid: Some(dec!(1)),
        test_mode: false,
        replenish_after_close: true,
    }
}

fn engine_over(gw: Arc<MockGateway>, store: Arc<MemoryStore>) -> GridEngine {
    let mut settings = EngineSettings::default();
    settings.reconcile_interval = Duration::from_secs(3600);
    GridEngine::new(
        settings,
        store,
        Arc::new(MockFactory { gw }),
        Arc::new(ProxyPool::new(vec![], ProxyPoolConfig::default())),
        ClockHandle::new(),
    )
}

/// Poll the persisted record until the predicate holds or a deadline passes.
async fn wait_for_bot<F>(engine: &GridEngine, id: gridbroker::BotId, what: &str, check: F)
where
    F: Fn(&gridbroker::BotRecord) -> bool,
{
    for _ in 0..200 {
        if let Ok(bot) = engine.get_bot(id).await {
            if check(&bot) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

// Creation quotes every rung: BUYs below the market, armed BUYs for the
// rungs that cannot sell yet.
#[tokio::test]
async fn create_covers_every_rung() {
    let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(gw.clone(), store.clone());

    let summary = engine.create_bot("alice", request()).await.unwrap();
    assert_eq!(summary.state, BotState::Active);
    assert_eq!(summary.live_orders, 11);

    let bot = engine.get_bot(summary.id).await.unwrap();
    // Rungs below the market rest at their own prices, 9.00 through 9.80.
    for expected in [dec!(9), dec!(9.2), dec!(9.4), dec!(9.6), dec!(9.8)] {
        assert!(
            bot.orders
                .iter()
                .any(|o| o.side == Side::Buy && o.price == expected),
            "missing BUY at {expected}"
        );
    }
    // Every rung has a live order or a dormant record (coverage invariant).
    for level in 0..11 {
        let live = bot.live_orders().any(|o| o.grid_level == level);
        let dormant = bot.dormant.iter().any(|d| d.level == level);
        assert!(live || dormant, "rung {level} uncovered");
    }
}

// Push pipeline end to end: a BUY fill produces its paired SELL, and the
// SELL fill realizes profit and replenishes the rung.
#[tokio::test]
async fn fill_pipeline_pairs_and_replenishes() {
    let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(gw.clone(), store.clone());
    let summary = engine.create_bot("alice", request()).await.unwrap();

    let buy_venue_id = {
        let bot = engine.get_bot(summary.id).await.unwrap();
        bot.orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .venue_order_id
            .unwrap()
    };

    // The venue fills the rung-4 BUY and pushes the report.
    let update = gw.fill_order(buy_venue_id, dec!(9.8)).await.unwrap();
    gw.push_update(update).await;

    wait_for_bot(&engine, summary.id, "paired SELL after BUY fill", |b| {
        b.orders.iter().any(|o| o.side == Side::Sell)
    })
    .await;

    let bot = engine.get_bot(summary.id).await.unwrap();
    let sell = bot.orders.iter().find(|o| o.side == Side::Sell).unwrap();
    assert_eq!(sell.price, dec!(9.898));
    assert_eq!(sell.quantity, dec!(1.02));
    assert_eq!(sell.grid_level, 4);

    // The SELL fills at its resting price.
    let sell_venue_id = sell.venue_order_id.unwrap();
    let update = gw.fill_order(sell_venue_id, dec!(9.898)).await.unwrap();
    gw.push_update(update).await;

    wait_for_bot(&engine, summary.id, "pair close credited", |b| {
        b.stats.total_trades == 1
    })
    .await;

    let bot = engine.get_bot(summary.id).await.unwrap();
    // (9.898 - 9.80) * 1.02
    assert_eq!(bot.stats.total_profit, dec!(0.09996));
    // Replenish BUY re-armed the rung one profit-step below the sell.
    assert!(bot
        .orders
        .iter()
        .any(|o| o.side == Side::Buy && o.is_live() && o.grid_level == 4));

    let perf = engine.get_performance(summary.id).await.unwrap();
    assert_eq!(perf.total_trades, 1);
    assert_eq!(perf.realized_pnl, dec!(0.09996));
    assert_eq!(perf.win_rate, 1.0);
}

// Restart with nothing drifted places nothing new.
#[tokio::test]
async fn restart_without_drift() {
    let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(gw.clone(), store.clone());
    let summary = engine.create_bot("alice", request()).await.unwrap();

    let placed_before = gw.placed_orders().await.len();
    engine.shutdown().await;

    let engine2 = engine_over(gw.clone(), store.clone());
    assert_eq!(engine2.bootstrap().await.unwrap(), 1);

    let bot = engine2.get_bot(summary.id).await.unwrap();
    let recovery = bot.recovery_history.last().unwrap();
    assert_eq!(
        (recovery.restored, recovery.cancelled, recovery.skipped),
        (0, 0, 0)
    );
    assert_eq!(gw.placed_orders().await.len(), placed_before);
}

// A fill missed while the process was down is credited exactly once.
#[tokio::test]
async fn missed_fill_recovered_once() {
    let gw = Arc::new(MockGateway::new(symbol(), dec!(10), account(dec!(200), dec!(0))));
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(gw.clone(), store.clone());
    let summary = engine.create_bot("alice", request()).await.unwrap();

    // BUY fills online, SELL goes live.
    let buy_venue_id = {
        let bot = engine.get_bot(summary.id).await.unwrap();
        bot.orders
            .iter()
            .find(|o| o.price == dec!(9.8))
            .unwrap()
            .venue_order_id
            .unwrap()
    };
    let update = gw.fill_order(buy_venue_id, dec!(9.8)).await.unwrap();
    gw.push_update(update).await;
    wait_for_bot(&engine, summary.id, "paired SELL live", |b| {
        b.orders.iter().any(|o| o.side == Side::Sell)
    })
    .await;

    engine.shutdown().await;

    // The SELL fills while nobody is listening.
    let sell_venue_id = {
        let bot = store.load_bot(summary.id).await.unwrap();
        bot.orders
            .iter()
            .find(|o| o.side == Side::Sell)
            .unwrap()
            .venue_order_id
            .unwrap()
    };
    gw.fill_order(sell_venue_id, dec!(9.898)).await.unwrap();

    let engine2 = engine_over(gw.clone(), store.clone());
    engine2.bootstrap().await.unwrap();

    let bot = engine2.get_bot(summary.id).await.unwrap();
    assert_eq!(bot.stats.total_trades, 1);
    assert_eq!(bot.stats.total_profit, dec!(0.09996));

    // A manual sweep after the fact re-credits nothing.
    engine2.recover_bot(summary.id).await.unwrap();
    let bot = engine2.get_bot(summary.id).await.unwrap();
    assert_eq!(bot.stats.total_trades, 1);
    assert_eq!(bot.stats.total_profit, dec!(0.09996));
}

// A region-blocked proxy cools down, the user moves to the next one, and
// the blocked proxy only returns through a successful probe.
#[test]
fn region_block_failover() {
    let pool = ProxyPool::new(
        vec!["http://p1".into(), "http://p2".into()],
        ProxyPoolConfig {
            cooldown_base: Duration::from_millis(5),
            cooldown_max: Duration::from_millis(40),
        },
    );

    let first = pool.acquire("alice").unwrap();
    pool.report("alice", &first, ProxyFault::RegionBlock);

    // Sticky reassignment to the surviving proxy; the retry runs there.
    let second = pool.acquire("alice").unwrap();
    assert_ne!(first, second);
    assert_eq!(pool.acquire("alice").unwrap(), second);

    // The blocked proxy needs cooldown plus a probe to rejoin.
    std::thread::sleep(Duration::from_millis(10));
    let due = pool.due_probes();
    assert_eq!(due, vec![first.clone()]);
    pool.record_probe(&first, true);
    assert_eq!(pool.health(), (2, 2));
}
