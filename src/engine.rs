//! Engine Assembly
//!
//! Wires the four subsystems into one trading engine: memory manager and
//! latency tracker first, then book, order manager, and signal engine, then
//! the cross-registrations that close the book/manager cycle. The external
//! feed pushes parsed depth and trade records into a bounded FIFO; a single
//! processor thread drains it and runs the whole critical path (book update,
//! signal generation, order placement) without yielding.

use crate::book::OrderBookEngine;
use crate::clock::{Nanos, NANOS_PER_MILLI};
use crate::latency::{LatencyKind, LatencyReport, LatencyTracker};
use crate::oms::{ModificationType, OrderManager};
use crate::pool::{MemoryManager, PoolStats};
use crate::signal::config::MarketMakingConfig;
use crate::signal::{QuoteSide, SignalEngine, SignalType, TradingSignal};
use crate::types::{
    MarketDepth, OrderBookStats, PositionInfo, RiskCheckResult, RiskLimits, Side, TopOfBook,
    TradeExecution,
};
use anyhow::{ensure, Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One record from the external feed, already parsed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Depth(MarketDepth),
    Trade(TradeExecution),
}

pub type FeedSender = Sender<FeedEvent>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol: String,
    /// Bounded feed FIFO capacity.
    pub feed_queue_capacity: usize,
    pub order_pool_size: usize,
    /// Stale-quote and TTL sweeps run this often on the processor thread.
    pub housekeeping_interval_ms: u64,
    pub market_making: MarketMakingConfig,
    pub risk_limits: RiskLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC-USD".to_string(),
            feed_queue_capacity: 10_000,
            order_pool_size: 1_000,
            housekeeping_interval_ms: 5_000,
            market_making: MarketMakingConfig::default(),
            risk_limits: RiskLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("parsing engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbol.is_empty(), "symbol must not be empty");
        ensure!(self.feed_queue_capacity > 0, "feed queue must have capacity");
        ensure!(self.order_pool_size > 0, "order pool must have capacity");
        self.market_making.validate()
    }
}

/// Point-in-time view across all subsystems, for the reporting thread.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub symbol: String,
    pub top_of_book: TopOfBook,
    pub position: PositionInfo,
    pub book_stats: OrderBookStats,
    pub active_orders: usize,
    pub active_quotes: usize,
    pub pool: PoolStats,
    pub latency: LatencyReport,
}

impl EngineStatus {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub struct TradingEngine {
    config: EngineConfig,
    memory: Arc<MemoryManager>,
    latency: Arc<LatencyTracker>,
    book: Arc<OrderBookEngine>,
    oms: Arc<OrderManager>,
    signal: Arc<SignalEngine>,

    feed_tx: Mutex<Option<FeedSender>>,
    feed_rx: Mutex<Option<Receiver<FeedEvent>>>,
    should_stop: Arc<AtomicBool>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl TradingEngine {
    /// Construct all components and cross-register them (two-phase wiring).
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let memory = Arc::new(MemoryManager::new(config.order_pool_size));
        let latency = Arc::new(LatencyTracker::new());

        let book = Arc::new(OrderBookEngine::new(&config.symbol, latency.clone()));
        let oms = Arc::new(OrderManager::new(
            memory.clone(),
            latency.clone(),
            config.risk_limits.clone(),
        ));
        let signal = Arc::new(SignalEngine::new(
            latency.clone(),
            config.market_making.clone(),
        ));

        // Phase two: close the cycles through the narrow seams.
        book.set_fill_sink(oms.clone());
        oms.set_quote_venue(book.clone());
        signal.set_orderbook_engine(book.clone());
        signal.set_order_manager(oms.clone());

        // Fills keep the quote board current. The signal engine is held
        // weakly from manager callbacks so teardown is not cyclic.
        {
            let weak_signal = Arc::downgrade(&signal);
            oms.set_fill_callback(Arc::new(move |info, qty, price, _is_final| {
                if let Some(signal) = weak_signal.upgrade() {
                    signal.track_order_fill(info.order.order_id, qty, price);
                }
            }));
        }

        // Severe risk events flatten the quote board immediately.
        {
            let weak_signal = Arc::downgrade(&signal);
            let weak_oms = Arc::downgrade(&oms);
            oms.set_risk_callback(Arc::new(move |result, message| {
                let severe = matches!(
                    result,
                    RiskCheckResult::CriticalBreach
                        | RiskCheckResult::DailyLossLimitExceeded
                        | RiskCheckResult::DrawdownLimitExceeded
                );
                if !severe {
                    return;
                }
                let Some(signal) = weak_signal.upgrade() else { return };
                let cancels = signal.emergency_cancel_all(message, 0.0);
                let Some(oms) = weak_oms.upgrade() else { return };
                for cancel in cancels {
                    if cancel.order_id != 0 && oms.cancel_order(cancel.order_id) {
                        signal.track_order_cancellation(cancel.order_id);
                    }
                }
            }));
        }

        let (feed_tx, feed_rx) = bounded(config.feed_queue_capacity);

        Ok(Self {
            config,
            memory,
            latency,
            book,
            oms,
            signal,
            feed_tx: Mutex::new(Some(feed_tx)),
            feed_rx: Mutex::new(Some(feed_rx)),
            should_stop: Arc::new(AtomicBool::new(false)),
            processor: Mutex::new(None),
        })
    }

    /// Producer handle for the external feed thread.
    pub fn feed_sender(&self) -> Result<FeedSender> {
        self.feed_tx
            .lock()
            .clone()
            .context("engine is stopped; feed channel closed")
    }

    /// Start the signal engine and the processor thread.
    pub fn start(&self) -> Result<()> {
        ensure!(
            !self.should_stop.load(Ordering::Acquire),
            "engine already stopped"
        );
        ensure!(self.signal.start(), "signal engine failed to start");

        let receiver = self
            .feed_rx
            .lock()
            .take()
            .context("processor already started")?;

        let processor = Processor {
            book: self.book.clone(),
            oms: self.oms.clone(),
            signal: self.signal.clone(),
            latency: self.latency.clone(),
            should_stop: self.should_stop.clone(),
            housekeeping_ns: self.config.housekeeping_interval_ms as i64 * NANOS_PER_MILLI,
        };
        let handle = std::thread::Builder::new()
            .name("mm-processor".to_string())
            .spawn(move || processor.run(receiver))
            .context("spawning processor thread")?;
        *self.processor.lock() = Some(handle);

        info!(symbol = %self.config.symbol, "trading engine started");
        Ok(())
    }

    /// Stop the engine: signal the processor, drain, join, and silence every
    /// callback. No callback fires after this returns.
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
        // Dropping the sender wakes the processor out of its blocking recv.
        self.feed_tx.lock().take();

        if let Some(handle) = self.processor.lock().take() {
            if handle.join().is_err() {
                warn!("processor thread panicked during shutdown");
            }
        }

        self.signal.stop();
        self.book.clear_callbacks();
        self.oms.clear_callbacks();
        info!("trading engine stopped");
    }

    /// Cancel every live order and refuse new ones.
    pub fn emergency_shutdown(&self, reason: &str) {
        self.oms.emergency_shutdown(reason);
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn book(&self) -> &Arc<OrderBookEngine> {
        &self.book
    }

    pub fn order_manager(&self) -> &Arc<OrderManager> {
        &self.oms
    }

    pub fn signal_engine(&self) -> &Arc<SignalEngine> {
        &self.signal
    }

    pub fn latency_tracker(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            symbol: self.config.symbol.clone(),
            top_of_book: self.book.top_of_book(),
            position: self.oms.get_position(),
            book_stats: self.book.statistics(),
            active_orders: self.oms.active_order_count(),
            active_quotes: self.signal.get_active_quotes().len(),
            pool: self.memory.stats(),
            latency: self.latency.report(),
        }
    }

}

/// State cloned into the processor thread; drains the feed FIFO and runs the
/// critical path on its own thread.
struct Processor {
    book: Arc<OrderBookEngine>,
    oms: Arc<OrderManager>,
    signal: Arc<SignalEngine>,
    latency: Arc<LatencyTracker>,
    should_stop: Arc<AtomicBool>,
    housekeeping_ns: i64,
}

impl Processor {
    fn run(&self, receiver: Receiver<FeedEvent>) {
        debug!("processor thread running");
        let mut last_housekeeping = self.latency.clock().now();

        loop {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => self.process_feed_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.should_stop.load(Ordering::Acquire) {
                // Drain whatever the feed already queued, then exit.
                while let Ok(event) = receiver.try_recv() {
                    self.process_feed_event(event);
                }
                break;
            }

            let now = self.latency.clock().now();
            if now - last_housekeeping >= self.housekeeping_ns {
                last_housekeeping = now;
                self.signal.clear_stale_quotes();
                self.oms.expire_stale_orders();
            }
        }
        debug!("processor thread exiting");
    }

    /// The critical path: apply the record to the book, generate signals
    /// from the fresh top of book, and execute them on this thread before
    /// the next feed record is accepted.
    fn process_feed_event(&self, event: FeedEvent) {
        let clock = self.latency.clock();
        let tick_start: Nanos = clock.now();

        match event {
            FeedEvent::Depth(depth) => self.book.apply_market_data_update(&depth),
            FeedEvent::Trade(trade) => self.book.process_market_data_trade(&trade),
        }
        self.latency.record(
            LatencyKind::MarketDataProcessing,
            clock.elapsed_micros(tick_start),
        );

        let top = self.book.top_of_book();
        let signals = self.signal.process_market_data_update(&top);
        for signal in &signals {
            self.execute_signal(signal);
        }

        self.latency
            .record(LatencyKind::TickToTrade, clock.elapsed_micros(tick_start));
    }

    fn execute_signal(&self, signal: &TradingSignal) {
        match signal.signal_type {
            SignalType::PlaceBid | SignalType::PlaceAsk => {
                let mid = self.book.mid_price();
                let order_id =
                    self.oms
                        .create_order(signal.side, signal.price, signal.quantity, mid);
                if order_id == 0 {
                    return;
                }

                let quote_side = if signal.side == Side::Buy {
                    QuoteSide::Bid
                } else {
                    QuoteSide::Ask
                };
                self.signal
                    .track_order_placement(order_id, quote_side, signal.price, signal.quantity);

                if !self.oms.submit_order(order_id) {
                    self.oms.cancel_order(order_id);
                    self.signal.track_order_cancellation(order_id);
                }
            }
            SignalType::CancelBid | SignalType::CancelAsk | SignalType::EmergencyCancel => {
                if signal.order_id != 0 && self.oms.cancel_order(signal.order_id) {
                    self.signal.track_order_cancellation(signal.order_id);
                }
            }
            SignalType::ModifyBid | SignalType::ModifyAsk => {
                if signal.order_id != 0 {
                    self.oms.modify_order(
                        signal.order_id,
                        signal.price,
                        signal.quantity,
                        ModificationType::PriceAndQuantity,
                    );
                }
            }
            SignalType::Hold => {}
        }
    }
}
