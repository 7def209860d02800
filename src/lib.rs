//! makerbot-core
//!
//! Single-venue, single-symbol market-making core for a crypto exchange.
//! Ingests a level-2 depth feed plus trade prints, keeps an in-process book
//! replica with per-order queue positions, infers fills for our resting
//! quotes from exchange prints, and continuously re-quotes both sides under
//! inventory and risk constraints. Every stage is instrumented for
//! sub-microsecond latency.
//!
//! # Architecture
//!
//! ```text
//! Feed ──► Book Engine ──► Signal Engine ──► Order Manager ──► Book Engine (submit)
//!              │  ▲                                │
//!              │  └────────── fill inference ◄─────┘
//!              ▼
//!        Latency Tracker observes every stage
//! ```
//!
//! The book engine and the order manager reference each other; the cycle is
//! closed by the `FillSink` and `QuoteVenue` seams during assembly
//! ([`engine::TradingEngine::new`]). Transport, message parsing, and process
//! wiring live outside this crate; the boundary is the
//! [`engine::FeedEvent`] channel.

pub mod book;
pub mod clock;
pub mod engine;
pub mod latency;
pub mod oms;
pub mod pool;
pub mod signal;
pub mod types;

pub use book::queue_model::QueuePosition;
pub use book::OrderBookEngine;
pub use engine::{EngineConfig, EngineStatus, FeedEvent, FeedSender, TradingEngine};
pub use latency::{LatencyKind, LatencyStatistics, LatencyTracker, ScopedTimer};
pub use oms::{ExecutionStats, ModificationType, OrderInfo, OrderManager};
pub use pool::{MemoryManager, MemoryPool, OrderPool, PoolStats};
pub use signal::config::MarketMakingConfig;
pub use signal::{
    MarketMakingQuote, MarketMakingStats, QuoteSide, QuoteState, SignalEngine, SignalType,
    TradingSignal,
};
pub use types::{
    FillSink, Level, MarketDepth, MatchResult, Order, OrderBookStats, OrderId, OrderStatus,
    PositionInfo, Price, Qty, QuoteVenue, RiskCheckResult, RiskLimits, Side, TopOfBook,
    TradeExecution,
};
