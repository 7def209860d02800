//! Market-Making Configuration

use crate::types::{Position, Qty};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketMakingConfig {
    /// Base quote size, base units.
    pub default_quote_size: Qty,
    /// Tightest spread we will quote, basis points.
    pub min_spread_bps: f64,
    /// Widest spread we will quote, basis points.
    pub max_spread_bps: f64,
    /// Spread we aim to capture, basis points.
    pub target_spread_bps: f64,

    /// Inventory bound used for skew and size scaling, base units.
    pub max_position: Position,
    /// Fraction of the target spread applied per unit of inventory ratio.
    pub inventory_skew_factor: f64,
    /// Cap on the skew, basis points of mid.
    pub max_inventory_skew_bps: f64,

    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub max_orders_per_second: u32,

    /// Quotes older than this are refreshed, milliseconds.
    pub quote_refresh_ms: u64,
    /// Minimum gap between actions on one side, milliseconds.
    pub cooldown_ms: u64,
    /// Quote inside the spread when there is room; otherwise join the best.
    pub enable_aggressive_quotes: bool,

    pub initial_capital: f64,
}

impl Default for MarketMakingConfig {
    fn default() -> Self {
        Self {
            default_quote_size: 10.0,
            min_spread_bps: 5.0,
            max_spread_bps: 50.0,
            target_spread_bps: 15.0,
            max_position: 100.0,
            inventory_skew_factor: 0.1,
            max_inventory_skew_bps: 20.0,
            max_daily_loss: 1000.0,
            max_drawdown: 0.05,
            max_orders_per_second: 100,
            quote_refresh_ms: 1000,
            cooldown_ms: 500,
            enable_aggressive_quotes: false,
            initial_capital: 10_000.0,
        }
    }
}

impl MarketMakingConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("parsing market-making config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.default_quote_size > 0.0, "quote size must be positive");
        ensure!(self.max_position > 0.0, "max position must be positive");
        ensure!(
            self.min_spread_bps > 0.0 && self.min_spread_bps <= self.max_spread_bps,
            "spread bounds must satisfy 0 < min <= max"
        );
        ensure!(
            self.target_spread_bps > 0.0,
            "target spread must be positive"
        );
        ensure!(self.quote_refresh_ms > 0, "refresh interval must be positive");
        Ok(())
    }
}
