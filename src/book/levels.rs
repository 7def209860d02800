//! Price Ladders
//!
//! Sorted price levels for one side of the book. Levels hold both the
//! anonymous aggregate quantity published by the feed and a FIFO of tracked
//! order ids, so the replica and our own resting orders live in one ladder.

use crate::clock::Nanos;
use crate::types::{BookSide, OrderId, Price, Qty};
use std::collections::{BTreeMap, VecDeque};

/// Quantities below this are treated as zero.
pub(crate) const QTY_EPSILON: f64 = 1e-9;

/// Prices within this distance compare equal.
pub(crate) const PRICE_EPSILON: f64 = 1e-9;

/// Price key ordered best-first for its side: bids descending, asks
/// ascending, so `iter().next()` is always the best level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct OrderedPrice {
    pub price: Price,
    pub is_bid: bool,
}

impl Eq for OrderedPrice {}

impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.is_bid {
            other
                .price
                .partial_cmp(&self.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        } else {
            self.price
                .partial_cmp(&other.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

/// Aggregate state at one price on one side.
#[derive(Debug, Clone)]
pub(crate) struct PriceLevel {
    pub price: Price,
    /// Feed-published liquidity with no per-order identity.
    pub external_qty: Qty,
    /// Tracked order ids in time priority.
    pub queue: VecDeque<OrderId>,
    /// Total resting quantity: external plus tracked remainders.
    pub total_qty: Qty,
    /// Lazily-cancelled entries still sitting in `queue`.
    pub cancelled_count: usize,
    pub last_update: Nanos,
}

impl PriceLevel {
    pub fn new(price: Price, now: Nanos) -> Self {
        Self {
            price,
            external_qty: 0.0,
            queue: VecDeque::new(),
            total_qty: 0.0,
            cancelled_count: 0,
            last_update: now,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_qty <= QTY_EPSILON
    }

    pub fn add_tracked(&mut self, order_id: OrderId, qty: Qty, now: Nanos) {
        self.queue.push_back(order_id);
        self.total_qty += qty;
        self.last_update = now;
    }

    pub fn reduce(&mut self, qty: Qty, now: Nanos) {
        self.total_qty = (self.total_qty - qty).max(0.0);
        self.last_update = now;
    }
}

/// One side of the book: best-first sorted levels.
#[derive(Debug, Clone)]
pub(crate) struct Ladder {
    side: BookSide,
    levels: BTreeMap<OrderedPrice, PriceLevel>,
}

impl Ladder {
    pub fn new(side: BookSide) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
        }
    }

    #[inline]
    fn key(&self, price: Price) -> OrderedPrice {
        OrderedPrice {
            price,
            is_bid: self.side == BookSide::Bid,
        }
    }

    fn best(&self) -> Option<&PriceLevel> {
        self.levels.values().next()
    }

    pub fn best_price(&self) -> Option<Price> {
        self.best().map(|l| l.price)
    }

    pub fn level(&self, price: Price) -> Option<&PriceLevel> {
        self.levels.get(&self.key(price))
    }

    pub fn level_mut(&mut self, price: Price) -> Option<&mut PriceLevel> {
        let key = self.key(price);
        self.levels.get_mut(&key)
    }

    pub fn get_or_insert(&mut self, price: Price, now: Nanos) -> &mut PriceLevel {
        let key = self.key(price);
        self.levels
            .entry(key)
            .or_insert_with(|| PriceLevel::new(price, now))
    }

    pub fn remove(&mut self, price: Price) -> Option<PriceLevel> {
        let key = self.key(price);
        self.levels.remove(&key)
    }

    /// Best-first iteration.
    pub fn iter(&self) -> impl Iterator<Item = &PriceLevel> {
        self.levels.values()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}

#[inline]
pub(crate) fn prices_equal(a: Price, b: Price) -> bool {
    (a - b).abs() <= PRICE_EPSILON
}
