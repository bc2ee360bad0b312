//! End-to-end trading flow against the paper venue and a real (temp file)
//! store: ladder replacement, the open-order budget, venue failures, fill
//! reconciliation, and quote expiry.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use ladderbot::account::{AccountReconciler, BalanceTracker, BalanceUpdateReason, FillReconciler};
use ladderbot::clock::ManualClock;
use ladderbot::config::Config;
use ladderbot::events::EventBus;
use ladderbot::oms::{Oms, OrderState};
use ladderbot::pipeline::{PipelineError, QuotePipeline, QuoteStatus, QuoteStrategy};
use ladderbot::quote::{BookTicker, QuoteEngine};
use ladderbot::rate_limiter::TokenBucketRateLimiter;
use ladderbot::ratio::{CapitalAllocation, RatioAdjustment};
use ladderbot::store::repos::Repositories;
use ladderbot::store::Store;
use ladderbot::venue::PaperVenue;

struct Harness {
    _dir: tempfile::TempDir,
    config: Arc<Config>,
    clock: ManualClock,
    store: Store,
    repos: Repositories,
    bus: EventBus,
    oms: Arc<Oms>,
    venue: Arc<PaperVenue>,
    pipeline: Arc<QuotePipeline>,
    engine: QuoteEngine,
}

fn harness(mut config: Config) -> Harness {
    config.trading.min_requote_ms = 0;
    let config = Arc::new(config);

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("flow.db")).unwrap();
    let repos = Repositories::new(store.clone());
    let clock = ManualClock::new(dec!(1700000000));
    let bus = EventBus::new();

    let oms = Arc::new(Oms::new(
        config.clone(),
        Arc::new(clock.clone()),
        bus.orders.clone(),
        bus.positions.clone(),
    ));
    let venue = Arc::new(PaperVenue::new(Arc::new(clock.clone())));
    let rate_limiter = Arc::new(TokenBucketRateLimiter::new(1000.0, 1000.0));

    let pipeline = Arc::new(QuotePipeline::new(
        config.clone(),
        Arc::new(clock.clone()),
        oms.clone(),
        venue.clone(),
        rate_limiter,
        repos.quotes.clone(),
        repos.orders.clone(),
    ));
    pipeline.start();

    let engine = QuoteEngine::new(config.clone(), Arc::new(clock.clone()));

    Harness {
        _dir: dir,
        config,
        clock,
        store,
        repos,
        bus,
        oms,
        venue,
        pipeline,
        engine,
    }
}

fn ticker(harness: &Harness, bid: Decimal, ask: Decimal) -> BookTicker {
    BookTicker {
        symbol: harness.config.trading.symbol_src.clone(),
        bid_price: bid,
        bid_qty: dec!(1000),
        ask_price: ask,
        ask_qty: dec!(1000),
        ts: harness.clock.now(),
    }
}

fn neutral() -> (RatioAdjustment, CapitalAllocation) {
    (RatioAdjustment::neutral(), CapitalAllocation::neutral())
}

#[tokio::test]
async fn bid_only_ladder_replacement() {
    let mut config = Config::default();
    config.trading.side_enable = vec!["bid".to_string()];
    config.trading.num_layers = 1;
    config.trading.base_spread_bps = 10;
    config.trading.tick_spread_bps = 0;
    let mut harness = harness(config);
    let (adj, alloc) = neutral();

    // First tick: one bid resting at 0.999000.
    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0000), dec!(1.0010)), &adj, &alloc)
        .unwrap();
    let first = harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap();

    assert_eq!(first.status, QuoteStatus::OrdersSubmitted);
    assert_eq!(first.bid_order_ids.len(), 1);
    assert!(first.ask_order_ids.is_empty());

    let open = harness.venue.get_open_orders("ADAUSDM", 0, 250).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].price, Some(dec!(0.999000)));
    let first_external = open[0].order_id.clone();
    assert_eq!(harness.pipeline.active_quotes_snapshot().await.len(), 1);

    // Second tick: the old order is cancelled, a new one rests at the new
    // price, and exactly one quote stays active.
    harness.clock.advance(dec!(1));
    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0100), dec!(1.0110)), &adj, &alloc)
        .unwrap();
    let second = harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap();

    assert!(harness
        .venue
        .cancelled_order_ids()
        .contains(&first_external));
    let open = harness.venue.get_open_orders("ADAUSDM", 0, 250).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].price, Some(dec!(1.008990)));

    let active = harness.pipeline.active_quotes_snapshot().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].quote_id, second.quote_id);

    // The first quote's order is terminal, the second's is working.
    let first_order = harness.oms.get_order(&first.bid_order_ids[0]).unwrap();
    assert_eq!(first_order.state, OrderState::Cancelled);
    let second_order = harness.oms.get_order(&second.bid_order_ids[0]).unwrap();
    assert_eq!(second_order.state, OrderState::Working);
    assert_eq!(harness.oms.open_order_count(), 1);
}

#[tokio::test]
async fn both_sides_ladder_stays_within_budget() {
    let mut config = Config::default();
    config.trading.num_layers = 3;
    config.trading.base_spread_bps = 8;
    config.trading.tick_spread_bps = 4;
    config.trading.total_liquidity = dec!(3000);
    config.trading.min_quote_size = dec!(10);
    let mut harness = harness(config);
    let (adj, alloc) = neutral();

    // Replace the ladder several times; the budget never overflows because
    // replacement frees the slots first.
    let mut price = dec!(1.0000);
    for _ in 0..5 {
        harness.clock.advance(dec!(1));
        let quote = harness
            .engine
            .generate_quote(&ticker(&harness, price, price + dec!(0.0010)), &adj, &alloc)
            .unwrap();
        assert_eq!(quote.bid_layers.len(), 3);
        assert_eq!(quote.ask_layers.len(), 3);

        harness
            .pipeline
            .process_quote(&quote, QuoteStrategy::MarketMaking)
            .await
            .unwrap();

        // One bid + one ask (layer 1 per side) resting.
        assert_eq!(harness.oms.open_order_count(), 2);
        assert_eq!(harness.pipeline.active_quotes_snapshot().await.len(), 1);
        price += dec!(0.0100);
    }

    let stats = harness.pipeline.stats().await;
    assert_eq!(stats.quotes_processed, 5);
    assert_eq!(stats.orders_submitted, 10);
}

#[tokio::test]
async fn budget_gate_rejects_when_full() {
    let mut config = Config::default();
    config.risk.max_open_orders = 1; // both sides need 2
    let mut harness = harness(config);
    let (adj, alloc) = neutral();

    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0000), dec!(1.0010)), &adj, &alloc)
        .unwrap();
    let err = harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("would exceed limit"));
    match err {
        PipelineError::BudgetExceeded { requested, current, max } => {
            assert_eq!(requested, 2);
            assert_eq!(current, 0);
            assert_eq!(max, 1);
        }
        other => panic!("expected budget error, got {other}"),
    }
    assert_eq!(harness.oms.open_order_count(), 0);
    assert!(harness.pipeline.active_quotes_snapshot().await.is_empty());
}

#[tokio::test]
async fn venue_failure_marks_orders_failed_and_frees_budget() {
    let mut harness = harness(Config::default());
    let (adj, alloc) = neutral();
    harness.venue.fail_submissions(true);

    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0000), dec!(1.0010)), &adj, &alloc)
        .unwrap();
    let processed = harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap();

    // Nothing reached the venue; both orders are failed and the budget is
    // free again.
    assert_eq!(processed.status, QuoteStatus::OrdersCreated);
    assert_eq!(harness.oms.open_order_count(), 0);
    for order_id in processed.order_ids() {
        let order = harness.oms.get_order(&order_id).unwrap();
        assert_eq!(order.state, OrderState::Failed);
        assert!(order.error.is_some());
    }

    // Next tick proceeds normally once the venue recovers: partial failure
    // never wedges the loop.
    harness.venue.fail_submissions(false);
    harness.clock.advance(dec!(1));
    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0100), dec!(1.0110)), &adj, &alloc)
        .unwrap();
    let processed = harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap();
    assert_eq!(processed.status, QuoteStatus::OrdersSubmitted);
    assert_eq!(harness.oms.open_order_count(), 2);
}

#[tokio::test]
async fn expiry_sweep_cancels_stale_quotes() {
    let mut config = Config::default();
    config.trading.stale_ms = 5000;
    let mut harness = harness(config);
    let (adj, alloc) = neutral();

    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0000), dec!(1.0010)), &adj, &alloc)
        .unwrap();
    harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap();
    assert_eq!(harness.oms.open_order_count(), 2);

    // Not yet expired.
    harness.clock.advance(dec!(1));
    assert_eq!(harness.pipeline.cleanup_expired_quotes().await, 0);
    assert_eq!(harness.pipeline.active_quotes_snapshot().await.len(), 1);

    // Push past the TTL; the sweep cancels orders and drops the quote.
    harness.clock.advance(dec!(10));
    assert!(harness.pipeline.cleanup_expired_quotes().await >= 1);
    assert!(harness.pipeline.active_quotes_snapshot().await.is_empty());
    assert_eq!(harness.oms.open_order_count(), 0);
    assert!(harness
        .venue
        .get_open_orders("ADAUSDM", 0, 250)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn persisted_quote_round_trips_through_store() {
    let mut harness = harness(Config::default());
    let (adj, alloc) = neutral();

    let quote = harness
        .engine
        .generate_quote(&ticker(&harness, dec!(1.0000), dec!(1.0010)), &adj, &alloc)
        .unwrap();
    let processed = harness
        .pipeline
        .process_quote(&quote, QuoteStrategy::MarketMaking)
        .await
        .unwrap();

    let loaded = harness
        .repos
        .quotes
        .get_quote(&processed.quote_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(loaded.quote_id, processed.quote_id);
    assert_eq!(loaded.symbol_src, processed.symbol_src);
    assert_eq!(loaded.symbol_dst, processed.symbol_dst);
    assert_eq!(loaded.bid_layers, processed.bid_layers);
    assert_eq!(loaded.ask_layers, processed.ask_layers);
    assert_eq!(loaded.source_bid_price, processed.source_bid_price);
    assert_eq!(loaded.source_ask_price, processed.source_ask_price);
    assert_eq!(loaded.total_spread_bps, processed.total_spread_bps);
    assert_eq!(loaded.sides_enabled, processed.sides_enabled);
    assert_eq!(loaded.strategy, processed.strategy);
    assert_eq!(loaded.bid_order_ids, processed.bid_order_ids);
    assert_eq!(loaded.ask_order_ids, processed.ask_order_ids);
    // The submitted status was written after the initial insert.
    assert_eq!(loaded.status, QuoteStatus::OrdersSubmitted);
}

#[tokio::test]
async fn duplicate_fill_reconciles_exactly_once() {
    let harness = harness(Config::default());
    let clock = Arc::new(harness.clock.clone());

    let balance_tracker = Arc::new(BalanceTracker::new(
        harness.repos.balances.clone(),
        clock.clone(),
        harness.bus.balances.clone(),
    ));
    balance_tracker
        .update_balance("ADA", dec!(1000), dec!(0), BalanceUpdateReason::Initial)
        .await;
    balance_tracker
        .update_balance("USDM", dec!(2000), dec!(0), BalanceUpdateReason::Initial)
        .await;

    let reconciler = Arc::new(FillReconciler::new(
        harness.repos.fills.clone(),
        harness.repos.positions.clone(),
        harness.repos.outbox.clone(),
        balance_tracker.clone(),
        harness.oms.clone(),
        clock.clone(),
        "ADAUSDM".to_string(),
        "ADA".to_string(),
        "USDM".to_string(),
        harness.bus.fills.clone(),
    ));
    let account = AccountReconciler::new(
        harness.venue.clone(),
        balance_tracker.clone(),
        reconciler.clone(),
        harness.oms.clone(),
        clock.clone(),
        5,
    );

    // The same 50 ADA buy at 0.4500 arrives twice with fill_id F1.
    let message = serde_json::json!({
        "sub_type": "fill",
        "fillId": "F1",
        "orderId": "EXT-1",
        "symbol": "ADAUSDM",
        "side": "buy",
        "price": "0.4500",
        "quantity": "50",
        "commission": "0",
        "commissionAsset": "USDM",
    });
    account.handle_message(&message).await.unwrap();
    account.handle_message(&message).await.unwrap();

    // Balances moved exactly once: ADA +50, USDM −22.50.
    let ada = balance_tracker.get_balance("ADA").await.unwrap();
    let usdm = balance_tracker.get_balance("USDM").await.unwrap();
    assert_eq!(ada.available, dec!(1050));
    assert_eq!(usdm.available, dec!(1977.50));

    // Position is +50 @ 0.4500, in memory and in the store.
    let position = harness.oms.get_position("ADAUSDM").unwrap();
    assert_eq!(position.quantity, dec!(50));
    assert_eq!(position.avg_entry_price, dec!(0.4500));
    let stored = harness
        .repos
        .positions
        .get_position("ADAUSDM")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.quantity, dec!(50));

    // Exactly one fill_processed event for F1.
    let events: i64 = harness
        .store
        .fetch_one(
            "SELECT COUNT(*) FROM outbox
             WHERE event_type = 'fill_processed' AND aggregate_id = 'F1'",
            [],
            |row| row.get(0),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events, 1);

    assert_eq!(reconciler.processed_count().await, 1);
}

#[tokio::test]
async fn trading_history_page_reconciles_nested_fills() {
    let harness = harness(Config::default());
    let clock = Arc::new(harness.clock.clone());

    let balance_tracker = Arc::new(BalanceTracker::new(
        harness.repos.balances.clone(),
        clock.clone(),
        harness.bus.balances.clone(),
    ));
    let reconciler = Arc::new(FillReconciler::new(
        harness.repos.fills.clone(),
        harness.repos.positions.clone(),
        harness.repos.outbox.clone(),
        balance_tracker.clone(),
        harness.oms.clone(),
        clock.clone(),
        "ADAUSDM".to_string(),
        "ADA".to_string(),
        "USDM".to_string(),
        harness.bus.fills.clone(),
    ));
    let account = AccountReconciler::new(
        harness.venue.clone(),
        balance_tracker,
        reconciler.clone(),
        harness.oms.clone(),
        clock,
        5,
    );

    let message = serde_json::json!({
        "sub_type": "trading_history",
        "data": {
            "order_filling_records": [
                {
                    "fillId": "H1",
                    "orderId": "EXT-9",
                    "symbol": "ADAUSDM",
                    "side": "sell",
                    "price": "0.46",
                    "quantity": "20",
                }
            ],
            "orders": [
                {
                    "orderId": "EXT-10",
                    "symbol": "ADAUSDM",
                    "side": "buy",
                    "fills": [
                        // Inherits symbol/side/orderId from the parent.
                        {"fillId": "H2", "price": "0.44", "quantity": "30"}
                    ]
                }
            ]
        }
    });
    account.handle_message(&message).await.unwrap();

    assert_eq!(reconciler.processed_count().await, 2);
    // Net position: -20 + 30 = +10.
    let position = harness.oms.get_position("ADAUSDM").unwrap();
    assert_eq!(position.quantity, dec!(10));

    // Replaying the page is a no-op.
    account.handle_message(&message).await.unwrap();
    assert_eq!(reconciler.processed_count().await, 2);
    assert_eq!(harness.oms.get_position("ADAUSDM").unwrap().quantity, dec!(10));
}
