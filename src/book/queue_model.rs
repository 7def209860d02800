//! Queue Position Model
//!
//! Deterministic FIFO model of where our resting orders sit in the external
//! book. Each order carries `queue_ahead`, our estimate of the quantity
//! resting in front of it at its price. Every aggressive print on the
//! opposite side decays `queue_ahead`; quantity past the front of the queue
//! fills us. Given truthful prints this mirrors exchange semantics exactly.

use crate::clock::Nanos;
use crate::types::{OrderId, Price, Qty, Side};
use std::collections::HashMap;

use super::levels::{prices_equal, QTY_EPSILON};

/// Our modelled place in an external FIFO.
#[derive(Debug, Clone)]
pub struct QueuePosition {
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub original_quantity: Qty,
    pub remaining_quantity: Qty,
    /// Estimated aggregate quantity in front of us at this price.
    pub queue_ahead: Qty,
    pub entry_time: Nanos,
}

/// A fill inferred from an external print.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InferredFill {
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub quantity: Qty,
    pub is_final: bool,
}

/// Tracks queue positions for every live resting order of ours.
#[derive(Debug, Default)]
pub(crate) struct QueueTracker {
    positions: HashMap<OrderId, QueuePosition>,
}

impl QueueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a newly resting order. `queue_ahead` is the level total
    /// at entry, before our own insertion, or a feed-provided exact value.
    pub fn track(
        &mut self,
        order_id: OrderId,
        side: Side,
        price: Price,
        quantity: Qty,
        queue_ahead: Qty,
        now: Nanos,
    ) {
        self.positions.insert(
            order_id,
            QueuePosition {
                order_id,
                side,
                price,
                original_quantity: quantity,
                remaining_quantity: quantity,
                queue_ahead: queue_ahead.max(0.0),
                entry_time: now,
            },
        );
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<QueuePosition> {
        self.positions.remove(&order_id)
    }

    pub fn get(&self, order_id: OrderId) -> Option<&QueuePosition> {
        self.positions.get(&order_id)
    }

    /// Reduce a tracked order's remaining quantity in place (pure quantity
    /// decrease keeps time priority, so `queue_ahead` is untouched).
    pub fn reduce_quantity(&mut self, order_id: OrderId, new_remaining: Qty) {
        if let Some(pos) = self.positions.get_mut(&order_id) {
            pos.remaining_quantity = new_remaining.min(pos.remaining_quantity).max(0.0);
        }
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }

    /// Decay queue positions with an external print of `qty` at `price`,
    /// aggressor side `aggressor`. Returns fills for our orders whose queues
    /// were fully consumed. Tracking for fully-filled orders is dropped.
    pub fn on_external_print(
        &mut self,
        aggressor: Side,
        price: Price,
        qty: Qty,
    ) -> Vec<InferredFill> {
        if qty <= QTY_EPSILON {
            return Vec::new();
        }

        let passive_side = aggressor.opposite();
        let mut fills = Vec::new();
        let mut done = Vec::new();

        for pos in self.positions.values_mut() {
            if pos.side != passive_side || !prices_equal(pos.price, price) {
                continue;
            }

            let prev_ahead = pos.queue_ahead;
            pos.queue_ahead = (prev_ahead - qty).max(0.0);

            let leftover = qty - prev_ahead;
            if pos.queue_ahead <= QTY_EPSILON && leftover > QTY_EPSILON {
                let fill_qty = leftover.min(pos.remaining_quantity);
                pos.remaining_quantity -= fill_qty;
                let is_final = pos.remaining_quantity <= QTY_EPSILON;

                fills.push(InferredFill {
                    order_id: pos.order_id,
                    side: pos.side,
                    price: pos.price,
                    quantity: fill_qty,
                    is_final,
                });

                if is_final {
                    done.push(pos.order_id);
                }
            }
        }

        for id in done {
            self.positions.remove(&id);
        }
        fills
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_without_fill() {
        let mut tracker = QueueTracker::new();
        tracker.track(7, Side::Sell, 100.0, 5.0, 50.0, 0);

        let fills = tracker.on_external_print(Side::Buy, 100.0, 30.0);
        assert!(fills.is_empty());
        let pos = tracker.get(7).unwrap();
        assert!((pos.queue_ahead - 20.0).abs() < QTY_EPSILON);
        assert!((pos.remaining_quantity - 5.0).abs() < QTY_EPSILON);
    }

    #[test]
    fn leftover_past_queue_fills_us() {
        let mut tracker = QueueTracker::new();
        tracker.track(7, Side::Sell, 100.0, 5.0, 20.0, 0);

        let fills = tracker.on_external_print(Side::Buy, 100.0, 25.0);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, 7);
        assert!((fills[0].quantity - 5.0).abs() < QTY_EPSILON);
        assert!(fills[0].is_final);
        assert!(tracker.get(7).is_none());
    }

    #[test]
    fn partial_fill_keeps_tracking() {
        let mut tracker = QueueTracker::new();
        tracker.track(3, Side::Buy, 99.0, 10.0, 0.0, 0);

        let fills = tracker.on_external_print(Side::Sell, 99.0, 4.0);
        assert_eq!(fills.len(), 1);
        assert!(!fills[0].is_final);
        assert!((fills[0].quantity - 4.0).abs() < QTY_EPSILON);
        let pos = tracker.get(3).unwrap();
        assert!((pos.remaining_quantity - 6.0).abs() < QTY_EPSILON);
    }

    #[test]
    fn ignores_same_side_and_other_prices() {
        let mut tracker = QueueTracker::new();
        tracker.track(1, Side::Sell, 100.0, 5.0, 10.0, 0);

        // Sell-side aggressor hits bids, not our resting ask.
        assert!(tracker.on_external_print(Side::Sell, 100.0, 50.0).is_empty());
        // Different price level.
        assert!(tracker.on_external_print(Side::Buy, 101.0, 50.0).is_empty());

        let pos = tracker.get(1).unwrap();
        assert!((pos.queue_ahead - 10.0).abs() < QTY_EPSILON);
    }

    #[test]
    fn queue_ahead_floors_at_zero() {
        let mut tracker = QueueTracker::new();
        tracker.track(1, Side::Sell, 100.0, 5.0, 10.0, 0);

        // Exactly consumes the queue ahead: no leftover, no fill.
        let fills = tracker.on_external_print(Side::Buy, 100.0, 10.0);
        assert!(fills.is_empty());
        assert_eq!(tracker.get(1).unwrap().queue_ahead, 0.0);

        // Next print is pure leftover.
        let fills = tracker.on_external_print(Side::Buy, 100.0, 2.0);
        assert_eq!(fills.len(), 1);
        assert!((fills[0].quantity - 2.0).abs() < QTY_EPSILON);
        assert!(!fills[0].is_final);
    }
}
