//! Position and P&L Bookkeeping
//!
//! Net position with volume-weighted entry price. Extending a position moves
//! the VWAP; reducing realizes P&L against it; crossing through flat resets
//! the VWAP to the crossing fill's price.

use crate::clock::Nanos;
use crate::types::{PositionInfo, Price, Qty, Side};

const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
pub(crate) struct PositionBook {
    info: PositionInfo,
    /// Highest realized P&L seen, for drawdown tracking.
    peak_realized: f64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn info(&self) -> PositionInfo {
        self.info
    }

    #[inline]
    pub fn net_position(&self) -> f64 {
        self.info.net_position
    }

    #[inline]
    pub fn realized_pnl(&self) -> f64 {
        self.info.realized_pnl
    }

    /// Drawdown from peak realized P&L, as a fraction of the peak.
    pub fn drawdown(&self) -> f64 {
        if self.peak_realized <= 0.0 {
            return 0.0;
        }
        ((self.peak_realized - self.info.realized_pnl) / self.peak_realized).max(0.0)
    }

    pub fn unrealized_pnl(&self, mid: Price) -> f64 {
        (mid - self.info.avg_price) * self.info.net_position
    }

    /// Apply one fill. `fee` is deducted from realized P&L.
    pub fn apply_fill(&mut self, side: Side, qty: Qty, price: Price, fee: f64, now: Nanos) {
        let delta = side.sign() * qty;
        let pos = self.info.net_position;

        if pos.abs() <= QTY_EPSILON || pos.signum() == delta.signum() {
            // Extending: new VWAP weights the old position and the fill.
            let old_abs = pos.abs();
            let new_abs = old_abs + qty;
            if new_abs > QTY_EPSILON {
                self.info.avg_price =
                    (old_abs * self.info.avg_price + qty * price) / new_abs;
            }
            self.info.net_position = pos + delta;
        } else {
            // Reducing or crossing.
            let closing = qty.min(pos.abs());
            self.info.realized_pnl += (price - self.info.avg_price) * closing * pos.signum();
            self.info.net_position = pos + delta;

            if self.info.net_position.abs() <= QTY_EPSILON {
                self.info.net_position = 0.0;
                self.info.avg_price = 0.0;
            } else if qty - closing > QTY_EPSILON {
                // Crossed through flat: the remainder opened at the fill price.
                self.info.avg_price = price;
            }
        }

        self.info.realized_pnl -= fee;
        if self.info.realized_pnl > self.peak_realized {
            self.peak_realized = self.info.realized_pnl;
        }

        self.info.gross_exposure = self.info.net_position.abs() * price;
        self.info.unrealized_pnl = self.unrealized_pnl(price);
        self.info.daily_volume += qty;
        self.info.trade_count += 1;
        self.info.last_update = now;
    }

    /// Refresh the mark-to-market figure against a new mid.
    pub fn mark(&mut self, mid: Price, now: Nanos) {
        self.info.unrealized_pnl = self.unrealized_pnl(mid);
        if self.info.net_position.abs() > QTY_EPSILON {
            self.info.gross_exposure = self.info.net_position.abs() * mid;
        }
        self.info.last_update = now;
    }

    /// Zero the daily counters at the start of a trading day.
    pub fn reset_daily(&mut self) {
        self.info.daily_volume = 0.0;
        self.info.trade_count = 0;
        self.info.realized_pnl = 0.0;
        self.peak_realized = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extending_updates_vwap() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 1.0, 100.0, 0.0, 0);
        book.apply_fill(Side::Buy, 1.0, 110.0, 0.0, 1);

        let info = book.info();
        assert_eq!(info.net_position, 2.0);
        assert!((info.avg_price - 105.0).abs() < 1e-9);
        assert_eq!(info.realized_pnl, 0.0);
    }

    #[test]
    fn reducing_realizes_against_vwap() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 2.0, 100.0, 0.0, 0);
        book.apply_fill(Side::Sell, 1.0, 106.0, 0.0, 1);

        let info = book.info();
        assert_eq!(info.net_position, 1.0);
        assert!((info.realized_pnl - 6.0).abs() < 1e-9);
        // VWAP unchanged on a reduce.
        assert!((info.avg_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn crossing_through_flat_resets_vwap() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 1.0, 100.0, 0.0, 0);
        book.apply_fill(Side::Sell, 3.0, 104.0, 0.0, 1);

        let info = book.info();
        assert_eq!(info.net_position, -2.0);
        assert!((info.realized_pnl - 4.0).abs() < 1e-9);
        assert!((info.avg_price - 104.0).abs() < 1e-9);
    }

    #[test]
    fn flat_close_zeroes_vwap() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Sell, 2.0, 50.0, 0.0, 0);
        book.apply_fill(Side::Buy, 2.0, 45.0, 0.0, 1);

        let info = book.info();
        assert_eq!(info.net_position, 0.0);
        assert_eq!(info.avg_price, 0.0);
        // Short from 50, bought back at 45.
        assert!((info.realized_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fees_reduce_realized_pnl() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 1.0, 100.0, 0.25, 0);
        assert!((book.realized_pnl() + 0.25).abs() < 1e-9);
    }

    #[test]
    fn unrealized_marks_against_mid() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 2.0, 100.0, 0.0, 0);
        assert!((book.unrealized_pnl(103.0) - 6.0).abs() < 1e-9);

        book.mark(103.0, 1);
        assert!((book.info().unrealized_pnl - 6.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_peak() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 1.0, 100.0, 0.0, 0);
        book.apply_fill(Side::Sell, 1.0, 110.0, 0.0, 1); // +10 realized
        book.apply_fill(Side::Buy, 1.0, 110.0, 0.0, 2);
        book.apply_fill(Side::Sell, 1.0, 105.0, 0.0, 3); // -5 realized

        assert!((book.realized_pnl() - 5.0).abs() < 1e-9);
        assert!((book.drawdown() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn daily_counters_accumulate_and_reset() {
        let mut book = PositionBook::new();
        book.apply_fill(Side::Buy, 1.5, 100.0, 0.0, 0);
        book.apply_fill(Side::Sell, 0.5, 101.0, 0.0, 1);

        let info = book.info();
        assert_eq!(info.daily_volume, 2.0);
        assert_eq!(info.trade_count, 2);

        book.reset_daily();
        let info = book.info();
        assert_eq!(info.daily_volume, 0.0);
        assert_eq!(info.trade_count, 0);
        assert_eq!(info.realized_pnl, 0.0);
        // The open position itself survives a daily reset.
        assert_eq!(info.net_position, 1.0);
    }
}
