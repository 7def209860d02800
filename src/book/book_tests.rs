//! Book engine tests: matching semantics, lazy cancellation, external depth
//! application, and queue-position fill inference.

use super::*;
use crate::clock::Nanos;
use crate::latency::LatencyTracker;
use crate::types::{
    FillSink, Level, MarketDepth, MatchResult, Order, OrderId, Side, TopOfBook, TradeExecution,
};
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;

fn engine() -> OrderBookEngine {
    OrderBookEngine::new("TEST", Arc::new(LatencyTracker::new()))
}

fn order(id: OrderId, side: Side, price: f64, qty: f64) -> Order {
    Order::new(id, side, price, qty, 0)
}

#[derive(Default)]
struct RecordingSink {
    fills: PlMutex<Vec<(OrderId, f64, f64, bool)>>,
}

impl FillSink for RecordingSink {
    fn on_fill(&self, order_id: OrderId, qty: f64, price: f64, _ts: Nanos, is_final: bool) {
        self.fills.lock().push((order_id, qty, price, is_final));
    }

    fn on_ack(&self, _order_id: OrderId, _ts: Nanos) {}

    fn on_cancel_confirmed(&self, _order_id: OrderId) {}
}

#[test]
fn single_buy_order_rests() {
    let book = engine();
    let (result, execs) = book.add_order(&order(1, Side::Buy, 100.0, 10.0));

    assert_eq!(result, MatchResult::NoMatch);
    assert!(execs.is_empty());

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 100.0);
    assert_eq!(top.bid_quantity, 10.0);
    assert_eq!(top.ask_price, 0.0);
    assert_eq!(top.ask_quantity, 0.0);
}

#[test]
fn exact_price_full_fill() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 10.0));

    let (result, execs) = book.add_order(&order(2, Side::Buy, 100.0, 10.0));
    assert_eq!(result, MatchResult::FullFill);
    assert_eq!(execs.len(), 1);

    let trade = &execs[0];
    assert_eq!(trade.aggressor_order_id, 2);
    assert_eq!(trade.passive_order_id, 1);
    assert_eq!(trade.price, 100.0);
    assert_eq!(trade.quantity, 10.0);
    assert_eq!(trade.aggressor_side, Side::Buy);

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 0.0);
    assert_eq!(top.ask_price, 0.0);
    assert_eq!(top.bid_quantity, 0.0);
    assert_eq!(top.ask_quantity, 0.0);
    assert_eq!(top.mid_price, 0.0);
}

#[test]
fn multi_level_sweep_rests_remainder() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 5.0));
    book.add_order(&order(2, Side::Sell, 101.0, 10.0));
    book.add_order(&order(3, Side::Sell, 102.0, 15.0));

    let (result, execs) = book.add_order(&order(4, Side::Buy, 102.0, 20.0));
    assert_eq!(result, MatchResult::PartialFill);
    assert_eq!(execs.len(), 2);

    assert_eq!(execs[0].price, 100.0);
    assert_eq!(execs[0].quantity, 5.0);
    assert_eq!(execs[1].price, 101.0);
    assert_eq!(execs[1].quantity, 10.0);

    // Trade price is the passive price, never above the aggressor limit.
    for exec in &execs {
        assert!(exec.price <= 102.0);
        assert_eq!(exec.aggressor_order_id, 4);
    }

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 102.0);
    assert_eq!(top.bid_quantity, 5.0);
    assert_eq!(top.ask_price, 102.0);
    assert_eq!(top.ask_quantity, 15.0);
}

#[test]
fn invalid_orders_rejected_without_mutation() {
    let book = engine();

    let mut bad = order(1, Side::Buy, f64::NAN, 10.0);
    assert_eq!(book.add_order(&bad).0, MatchResult::Rejected);

    bad = order(2, Side::Buy, 100.0, 0.0);
    assert_eq!(book.add_order(&bad).0, MatchResult::Rejected);

    bad = order(3, Side::Sell, f64::INFINITY, 1.0);
    assert_eq!(book.add_order(&bad).0, MatchResult::Rejected);

    bad = order(4, Side::Sell, -5.0, 1.0);
    assert_eq!(book.add_order(&bad).0, MatchResult::Rejected);

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 0.0);
    assert_eq!(top.ask_price, 0.0);
    assert_eq!(book.statistics().rejected_orders, 4);
}

#[test]
fn place_then_cancel_restores_book() {
    let book = engine();
    book.add_order(&order(1, Side::Buy, 99.0, 2.0));
    let before = book.market_depth(10);
    let top_before = book.top_of_book();

    book.add_order(&order(2, Side::Buy, 100.0, 5.0));
    assert!(book.cancel_order(2));

    let after = book.market_depth(10);
    assert_eq!(before.bids, after.bids);
    assert_eq!(before.asks, after.asks);

    let top_after = book.top_of_book();
    assert_eq!(top_before.bid_price, top_after.bid_price);
    assert_eq!(top_before.bid_quantity, top_after.bid_quantity);
}

#[test]
fn cancel_unknown_order_is_noop() {
    let book = engine();
    assert!(!book.cancel_order(42));
    assert!(!book.cancel_order(0));
}

#[test]
fn cancelled_order_is_skipped_during_matching() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 5.0));
    book.add_order(&order(2, Side::Sell, 100.0, 7.0));
    assert!(book.cancel_order(1));

    // Aggressor consumes only the live order; the cancelled one is skipped.
    let (result, execs) = book.add_order(&order(3, Side::Buy, 100.0, 7.0));
    assert_eq!(result, MatchResult::FullFill);
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].passive_order_id, 2);
    assert_eq!(execs[0].quantity, 7.0);

    let top = book.top_of_book();
    assert_eq!(top.ask_price, 0.0);
}

#[test]
fn double_cancel_returns_false() {
    let book = engine();
    book.add_order(&order(1, Side::Buy, 100.0, 1.0));
    assert!(book.cancel_order(1));
    assert!(!book.cancel_order(1));
}

#[test]
fn quantity_decrease_keeps_priority() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 10.0));
    book.add_order(&order(2, Side::Sell, 100.0, 10.0));

    assert!(book.modify_order(1, 100.0, 4.0));

    let (_, execs) = book.add_order(&order(3, Side::Buy, 100.0, 6.0));
    assert_eq!(execs.len(), 2);
    // Order 1 kept the front of the queue.
    assert_eq!(execs[0].passive_order_id, 1);
    assert_eq!(execs[0].quantity, 4.0);
    assert_eq!(execs[1].passive_order_id, 2);
    assert_eq!(execs[1].quantity, 2.0);
}

#[test]
fn quantity_increase_loses_priority() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 5.0));
    book.add_order(&order(2, Side::Sell, 100.0, 5.0));

    assert!(book.modify_order(1, 100.0, 8.0));

    let (_, execs) = book.add_order(&order(3, Side::Buy, 100.0, 5.0));
    assert_eq!(execs.len(), 1);
    // Order 2 is now at the front.
    assert_eq!(execs[0].passive_order_id, 2);
}

#[test]
fn repeated_modify_is_idempotent() {
    let book = engine();
    book.add_order(&order(1, Side::Buy, 100.0, 10.0));

    assert!(book.modify_order(1, 101.0, 10.0));
    let depth_once = book.market_depth(10);
    assert!(book.modify_order(1, 101.0, 10.0));
    let depth_twice = book.market_depth(10);

    assert_eq!(depth_once.bids, depth_twice.bids);
    assert_eq!(book.order(1).unwrap().price, 101.0);
}

#[test]
fn modify_unknown_order_returns_false() {
    let book = engine();
    assert!(!book.modify_order(9, 100.0, 1.0));
}

#[test]
fn market_order_sweeps_and_never_rests() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 5.0));
    book.add_order(&order(2, Side::Sell, 101.0, 5.0));

    let (result, execs) = book.process_market_order(Side::Buy, 20.0);
    assert_eq!(result, MatchResult::PartialFill);
    assert_eq!(execs.len(), 2);
    let matched: f64 = execs.iter().map(|e| e.quantity).sum();
    assert_eq!(matched, 10.0);

    // Nothing rested on the bid side.
    let top = book.top_of_book();
    assert_eq!(top.bid_price, 0.0);
    assert_eq!(top.ask_price, 0.0);
}

#[test]
fn market_order_against_empty_book() {
    let book = engine();
    let (result, execs) = book.process_market_order(Side::Sell, 5.0);
    assert_eq!(result, MatchResult::NoMatch);
    assert!(execs.is_empty());
}

#[test]
fn snapshot_replaces_and_is_idempotent() {
    let book = engine();
    let snap = MarketDepth::snapshot(
        vec![Level::new(99.0, 10.0), Level::new(98.0, 20.0)],
        vec![Level::new(101.0, 5.0), Level::new(102.0, 8.0)],
        1,
    );

    book.apply_market_data_update(&snap);
    let first = book.market_depth(10);
    book.apply_market_data_update(&snap);
    let second = book.market_depth(10);

    assert_eq!(first.bids, second.bids);
    assert_eq!(first.asks, second.asks);

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 99.0);
    assert_eq!(top.bid_quantity, 10.0);
    assert_eq!(top.ask_price, 101.0);
    assert_eq!(top.ask_quantity, 5.0);
    assert_eq!(book.statistics().total_updates, 2);
}

#[test]
fn delta_update_sets_and_removes_levels() {
    let book = engine();
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![Level::new(99.0, 10.0)],
        vec![Level::new(101.0, 5.0)],
        1,
    ));

    // Raise the ask, remove the bid, add a deeper bid.
    book.apply_market_data_update(&MarketDepth::update(
        vec![Level::new(99.0, 0.0), Level::new(98.5, 4.0)],
        vec![Level::new(101.0, 7.0)],
        2,
    ));

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 98.5);
    assert_eq!(top.bid_quantity, 4.0);
    assert_eq!(top.ask_price, 101.0);
    assert_eq!(top.ask_quantity, 7.0);
}

#[test]
fn malformed_depth_levels_dropped_not_fatal() {
    let book = engine();
    book.apply_market_data_update(&MarketDepth::update(
        vec![Level::new(f64::NAN, 5.0), Level::new(99.0, -3.0), Level::new(98.0, 6.0)],
        vec![],
        1,
    ));

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 98.0);
    assert_eq!(book.statistics().dropped_updates, 2);
}

#[test]
fn crossed_snapshot_tolerated_and_heals() {
    let book = engine();
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![Level::new(101.0, 1.0)],
        vec![Level::new(100.0, 1.0)],
        1,
    ));
    assert!(book.is_market_crossed());

    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![Level::new(99.0, 1.0)],
        vec![Level::new(100.0, 1.0)],
        2,
    ));
    assert!(!book.is_market_crossed());
}

#[test]
fn queue_position_inference_end_to_end() {
    let book = engine();
    let sink = Arc::new(RecordingSink::default());
    book.set_fill_sink(sink.clone());

    // External ask level at 100 with 50 resting ahead of us.
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![],
        vec![Level::new(100.0, 50.0)],
        1,
    ));

    let ours = order(7, Side::Sell, 100.0, 5.0);
    let (result, execs) = book.submit_order_from_manager(&ours);
    assert_eq!(result, MatchResult::NoMatch);
    assert!(execs.is_empty());

    let pos = book.queue_position(7).expect("tracked");
    assert_eq!(pos.queue_ahead, 50.0);

    // First print burns 30 of the queue ahead; no fill.
    book.process_market_data_trade(&TradeExecution {
        trade_id: 0,
        aggressor_order_id: 0,
        passive_order_id: 0,
        price: 100.0,
        quantity: 30.0,
        aggressor_side: Side::Buy,
        timestamp: 2,
    });
    let pos = book.queue_position(7).expect("still tracked");
    assert_eq!(pos.queue_ahead, 20.0);
    assert!(sink.fills.lock().is_empty());

    // Second print passes the front of the queue: leftover 5 fills us.
    book.process_market_data_trade(&TradeExecution {
        trade_id: 0,
        aggressor_order_id: 0,
        passive_order_id: 0,
        price: 100.0,
        quantity: 25.0,
        aggressor_side: Side::Buy,
        timestamp: 3,
    });

    assert!(book.queue_position(7).is_none());
    let fills = sink.fills.lock();
    assert_eq!(fills.len(), 1);
    let (id, qty, price, is_final) = fills[0];
    assert_eq!(id, 7);
    assert_eq!(qty, 5.0);
    assert_eq!(price, 100.0);
    assert!(is_final);
}

#[test]
fn submitted_aggressive_order_notifies_sink() {
    let book = engine();
    let sink = Arc::new(RecordingSink::default());
    book.set_fill_sink(sink.clone());

    book.add_order(&order(1, Side::Sell, 100.0, 10.0));
    let (result, _) = book.submit_order_from_manager(&order(2, Side::Buy, 100.0, 10.0));
    assert_eq!(result, MatchResult::FullFill);

    let fills = sink.fills.lock();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].0, 2);
    assert!(fills[0].3);
}

#[test]
fn external_liquidity_matches_with_anonymous_passive() {
    let book = engine();
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![],
        vec![Level::new(100.0, 8.0)],
        1,
    ));

    let (result, execs) = book.add_order(&order(1, Side::Buy, 100.0, 5.0));
    assert_eq!(result, MatchResult::FullFill);
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].passive_order_id, 0);
    assert_eq!(execs[0].price, 100.0);

    let top = book.top_of_book();
    assert_eq!(top.ask_quantity, 3.0);
}

#[test]
fn trade_stats_accumulate() {
    let book = engine();
    book.add_order(&order(1, Side::Sell, 100.0, 10.0));
    book.add_order(&order(2, Side::Buy, 100.0, 4.0));
    book.add_order(&order(3, Side::Buy, 100.0, 6.0));

    let stats = book.statistics();
    assert_eq!(stats.total_orders_processed, 3);
    assert_eq!(stats.total_trades, 2);
    assert_eq!(stats.total_volume, 10.0);
    assert_eq!(book.last_trade_price(), Some(100.0));
}

#[test]
fn clear_book_resets_everything() {
    let book = engine();
    book.add_order(&order(1, Side::Buy, 100.0, 10.0));
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![],
        vec![Level::new(101.0, 5.0)],
        1,
    ));

    book.clear_book();
    let top = book.top_of_book();
    assert_eq!(top.bid_price, 0.0);
    assert_eq!(top.ask_price, 0.0);
    assert!(book.order(1).is_none());
    assert!(book.market_depth(10).bids.is_empty());
}

#[test]
fn book_callbacks_fire_after_mutation() {
    let book = engine();
    let trades: Arc<PlMutex<Vec<TradeExecution>>> = Arc::new(PlMutex::new(Vec::new()));
    let tops: Arc<PlMutex<Vec<TopOfBook>>> = Arc::new(PlMutex::new(Vec::new()));

    let trades_cb = trades.clone();
    book.set_trade_callback(Arc::new(move |t| trades_cb.lock().push(*t)));
    let tops_cb = tops.clone();
    book.set_book_update_callback(Arc::new(move |t| tops_cb.lock().push(*t)));

    book.add_order(&order(1, Side::Sell, 100.0, 5.0));
    book.add_order(&order(2, Side::Buy, 100.0, 5.0));

    assert_eq!(trades.lock().len(), 1);
    assert!(!tops.lock().is_empty());
}
