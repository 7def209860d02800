//! Depth Analysis
//!
//! Liquidity and imbalance metrics over the visible book, used to refine
//! quotes beyond the top of book. Pressure is the normalized imbalance in
//! (-1, 1); positive values mean bid-heavy (bullish) depth. When the
//! imbalance has moved enough to matter, the analyzer reworks the base
//! quote plan into depth-aware optimal prices and sizes: both quotes lean
//! one tick with the pressure and the side the flow is running into is
//! faded.

use super::QuotePlan;
use crate::types::{Level, MarketDepth, Price, Qty, TICK_SIZE};
use serde::Serialize;

/// Imbalance must move by this much before a depth change is significant.
const IMBALANCE_CHANGE_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DepthMetrics {
    /// Liquidity on each side, basis points of mid.
    pub bid_liquidity_bps: f64,
    pub ask_liquidity_bps: f64,
    /// Ratio of bid to ask liquidity.
    pub bid_ask_imbalance: f64,
    /// Normalized imbalance in (-1, 1).
    pub market_pressure: f64,
    /// Expected spread movement from the depth skew, basis points.
    pub spread_impact_bps: f64,
    pub significant_change: bool,
    /// Depth-adjusted quote targets; override the base plan when
    /// `significant_change` is set.
    pub optimal_bid_price: Price,
    pub optimal_ask_price: Price,
    pub optimal_bid_size: Qty,
    pub optimal_ask_size: Qty,
}

impl Default for DepthMetrics {
    fn default() -> Self {
        Self {
            bid_liquidity_bps: 0.0,
            ask_liquidity_bps: 0.0,
            bid_ask_imbalance: 1.0,
            market_pressure: 0.0,
            spread_impact_bps: 0.0,
            significant_change: false,
            optimal_bid_price: 0.0,
            optimal_ask_price: 0.0,
            optimal_bid_size: 0.0,
            optimal_ask_size: 0.0,
        }
    }
}

/// Aggregate liquidity across levels, expressed in basis points of the mid.
pub fn liquidity_bps(levels: &[Level], mid: Price) -> f64 {
    if mid <= 0.0 {
        return 0.0;
    }
    let total: Qty = levels.iter().map(|l| l.quantity).sum();
    total / mid * 10_000.0
}

#[derive(Debug, Default)]
pub(crate) struct DepthAnalyzer {
    last_imbalance: Option<f64>,
}

impl DepthAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze a depth snapshot against the base quote plan.
    /// `spread_tolerance_bps` bounds how much expected spread movement is
    /// tolerated before quotes are re-planned.
    pub fn analyze(
        &mut self,
        depth: &MarketDepth,
        plan: &QuotePlan,
        current_spread_bps: f64,
        spread_tolerance_bps: f64,
    ) -> DepthMetrics {
        let bid_liq = liquidity_bps(&depth.bids, plan.mid);
        let ask_liq = liquidity_bps(&depth.asks, plan.mid);

        if bid_liq <= 0.0 || ask_liq <= 0.0 {
            self.last_imbalance = None;
            return DepthMetrics::default();
        }

        let imbalance = bid_liq / ask_liq;
        let pressure = (imbalance - 1.0) / (imbalance + 1.0);
        let spread_impact = current_spread_bps * pressure.abs();

        let moved = self
            .last_imbalance
            .map(|last| (imbalance - last).abs() > IMBALANCE_CHANGE_THRESHOLD)
            .unwrap_or(false);
        let significant = moved || spread_impact > spread_tolerance_bps;
        self.last_imbalance = Some(imbalance);

        // Lean one tick with the pressure and fade the side the flow is
        // running into.
        let shift = pressure * TICK_SIZE;
        let mut optimal_bid_size = plan.bid_size;
        let mut optimal_ask_size = plan.ask_size;
        if pressure > 0.0 {
            optimal_ask_size *= 1.0 - pressure / 2.0;
        } else {
            optimal_bid_size *= 1.0 + pressure / 2.0;
        }

        DepthMetrics {
            bid_liquidity_bps: bid_liq,
            ask_liquidity_bps: ask_liq,
            bid_ask_imbalance: imbalance,
            market_pressure: pressure,
            spread_impact_bps: spread_impact,
            significant_change: significant,
            optimal_bid_price: plan.bid_price + shift,
            optimal_ask_price: plan.ask_price + shift,
            optimal_bid_size,
            optimal_ask_size,
        }
    }
}
