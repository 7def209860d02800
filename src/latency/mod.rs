//! Latency Tracker
//!
//! Per-operation-class latency instrumentation for the trading path.
//! The hot path pushes into lock-free rings and only checks the critical
//! spike threshold; percentile estimation (P²), trend tracking, and exact
//! reporting happen off the critical path by snapshotting the rings.

pub mod percentile;
pub mod ring;


use crate::clock::{MonoClock, Nanos, NANOS_PER_SEC};
use crate::types::LATENCY_WINDOW_SIZE;
use parking_lot::Mutex;
use percentile::P2Quantile;
use ring::SpscRing;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of instrumented operation classes.
pub const KIND_COUNT: usize = 5;

/// Most recent spikes retained.
pub const MAX_SPIKE_HISTORY: usize = 100;

/// Recent p95 readings kept for trend classification.
pub const TREND_WINDOW_SIZE: usize = 20;

/// A p95 reading is appended to the trend window every this many records.
const TREND_SAMPLE_INTERVAL: u64 = 32;

/// Instrumented operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyKind {
    MarketDataProcessing,
    OrderPlacement,
    OrderCancellation,
    TickToTrade,
    OrderBookUpdate,
}

impl LatencyKind {
    pub const ALL: [LatencyKind; KIND_COUNT] = [
        LatencyKind::MarketDataProcessing,
        LatencyKind::OrderPlacement,
        LatencyKind::OrderCancellation,
        LatencyKind::TickToTrade,
        LatencyKind::OrderBookUpdate,
    ];

    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyKind::MarketDataProcessing => "market_data_processing",
            LatencyKind::OrderPlacement => "order_placement",
            LatencyKind::OrderCancellation => "order_cancellation",
            LatencyKind::TickToTrade => "tick_to_trade",
            LatencyKind::OrderBookUpdate => "order_book_update",
        }
    }

    /// Warning threshold, microseconds.
    pub fn warning_threshold_us(&self) -> f64 {
        match self {
            LatencyKind::MarketDataProcessing => 1_000.0,
            LatencyKind::OrderPlacement => 2_000.0,
            LatencyKind::OrderCancellation => 1_500.0,
            LatencyKind::TickToTrade => 5_000.0,
            LatencyKind::OrderBookUpdate => 1_000.0,
        }
    }

    /// Critical threshold, microseconds.
    pub fn critical_threshold_us(&self) -> f64 {
        match self {
            LatencyKind::MarketDataProcessing => 5_000.0,
            LatencyKind::OrderPlacement => 10_000.0,
            LatencyKind::OrderCancellation => 3_000.0,
            LatencyKind::TickToTrade => 15_000.0,
            LatencyKind::OrderBookUpdate => 5_000.0,
        }
    }
}

/// Spike severity relative to the per-class thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpikeSeverity {
    Warning,
    Critical,
}

/// One threshold breach.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySpike {
    pub timestamp: Nanos,
    pub kind: LatencyKind,
    pub latency_us: f64,
    pub severity: SpikeSeverity,
}

/// Direction of recent p95 movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PerformanceTrend {
    Improving,
    Stable,
    Degrading,
    Volatile,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrendData {
    pub trend: PerformanceTrend,
    /// Percent change across the trend window; negative is improving.
    pub trend_percentage: f64,
    /// Standard deviation of successive relative changes.
    pub volatility: f64,
    pub sample_count: u32,
}

impl Default for TrendData {
    fn default() -> Self {
        Self {
            trend: PerformanceTrend::Stable,
            trend_percentage: 0.0,
            volatility: 0.0,
            sample_count: 0,
        }
    }
}

/// Exact statistics over the retained window, plus the online estimates.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStatistics {
    pub count: u64,
    pub mean_us: f64,
    pub median_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub std_dev_us: f64,
    /// O(1) P² estimates maintained on the recording path.
    pub p95_estimate_us: f64,
    pub p99_estimate_us: f64,
    pub trend: TrendData,
}

/// Serializable report across all classes.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyReport {
    pub timestamp: Nanos,
    pub uptime_seconds: f64,
    pub entries: Vec<LatencyReportEntry>,
    pub spike_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyReportEntry {
    pub kind: &'static str,
    pub stats: LatencyStatistics,
    pub window_overrun: bool,
}

struct Estimators {
    p95: P2Quantile,
    p99: P2Quantile,
    trend: VecDeque<f64>,
    updates: u64,
}

struct KindState {
    ring: SpscRing,
    estimators: Mutex<Estimators>,
    count: AtomicU64,
}

impl KindState {
    fn new(window_size: usize) -> Self {
        Self {
            ring: SpscRing::new(window_size),
            estimators: Mutex::new(Estimators {
                p95: P2Quantile::new(95.0),
                p99: P2Quantile::new(99.0),
                trend: VecDeque::with_capacity(TREND_WINDOW_SIZE),
                updates: 0,
            }),
            count: AtomicU64::new(0),
        }
    }
}

pub struct LatencyTracker {
    clock: MonoClock,
    session_start: Nanos,
    kinds: [KindState; KIND_COUNT],
    spikes: Mutex<VecDeque<LatencySpike>>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::with_window(LATENCY_WINDOW_SIZE)
    }

    /// `window_size` must be a power of two.
    pub fn with_window(window_size: usize) -> Self {
        let clock = MonoClock::new();
        let session_start = clock.now();
        Self {
            clock,
            session_start,
            kinds: std::array::from_fn(|_| KindState::new(window_size)),
            spikes: Mutex::new(VecDeque::with_capacity(MAX_SPIKE_HISTORY)),
        }
    }

    #[inline]
    pub fn clock(&self) -> &MonoClock {
        &self.clock
    }

    /// Hot path: ring push and critical-spike check only. No statistics, no
    /// allocation.
    #[inline]
    pub fn record_fast(&self, kind: LatencyKind, latency_us: f64) {
        let state = &self.kinds[kind.index()];
        state.ring.push(latency_us);
        state.count.fetch_add(1, Ordering::Relaxed);

        if latency_us > kind.critical_threshold_us() {
            self.push_spike(kind, latency_us, SpikeSeverity::Critical);
        }
    }

    /// Full recording: ring push, warning/critical spike check, P² update,
    /// trend bookkeeping.
    pub fn record(&self, kind: LatencyKind, latency_us: f64) {
        let state = &self.kinds[kind.index()];
        state.ring.push(latency_us);
        state.count.fetch_add(1, Ordering::Relaxed);

        if latency_us > kind.critical_threshold_us() {
            self.push_spike(kind, latency_us, SpikeSeverity::Critical);
        } else if latency_us > kind.warning_threshold_us() {
            self.push_spike(kind, latency_us, SpikeSeverity::Warning);
        }

        let mut est = state.estimators.lock();
        est.p95.update(latency_us);
        est.p99.update(latency_us);
        est.updates += 1;
        if est.updates % TREND_SAMPLE_INTERVAL == 0 {
            let p95 = est.p95.estimate();
            if est.trend.len() == TREND_WINDOW_SIZE {
                est.trend.pop_front();
            }
            est.trend.push_back(p95);
        }
    }

    /// Exact statistics from a ring snapshot, compared against the online
    /// estimators.
    pub fn statistics(&self, kind: LatencyKind) -> LatencyStatistics {
        let state = &self.kinds[kind.index()];
        let mut data = state.ring.snapshot();
        let count = state.count.load(Ordering::Relaxed);

        let est = state.estimators.lock();
        let p95_estimate_us = est.p95.estimate();
        let p99_estimate_us = est.p99.estimate();
        let trend = classify_trend(&est.trend);
        drop(est);

        if data.is_empty() {
            return LatencyStatistics {
                count,
                p95_estimate_us,
                p99_estimate_us,
                trend,
                ..Default::default()
            };
        }

        data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        // Welford accumulation for mean and variance.
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for (i, &x) in data.iter().enumerate() {
            let delta = x - mean;
            mean += delta / (i + 1) as f64;
            m2 += delta * (x - mean);
        }
        let variance = if data.len() > 1 {
            m2 / (data.len() - 1) as f64
        } else {
            0.0
        };

        LatencyStatistics {
            count,
            mean_us: mean,
            median_us: sorted_percentile(&data, 50.0),
            p95_us: sorted_percentile(&data, 95.0),
            p99_us: sorted_percentile(&data, 99.0),
            min_us: data[0],
            max_us: *data.last().expect("non-empty"),
            std_dev_us: variance.sqrt(),
            p95_estimate_us,
            p99_estimate_us,
            trend,
        }
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport {
            timestamp: self.clock.now(),
            uptime_seconds: self.uptime_seconds(),
            entries: LatencyKind::ALL
                .iter()
                .map(|&kind| LatencyReportEntry {
                    kind: kind.as_str(),
                    stats: self.statistics(kind),
                    window_overrun: self.kinds[kind.index()].ring.has_been_full(),
                })
                .collect(),
            spike_count: self.spikes.lock().len(),
        }
    }

    /// Spikes recorded within the last `minutes`. Returned newest-last; the
    /// log keeps the most recent entries, indices are not stable.
    pub fn recent_spikes(&self, minutes: i64) -> Vec<LatencySpike> {
        let cutoff = self.clock.now() - minutes * 60 * NANOS_PER_SEC;
        self.spikes
            .lock()
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .copied()
            .collect()
    }

    /// True when a critical spike landed within the last minute.
    pub fn should_alert(&self) -> bool {
        let cutoff = self.clock.now() - 60 * NANOS_PER_SEC;
        self.spikes
            .lock()
            .iter()
            .any(|s| s.severity == SpikeSeverity::Critical && s.timestamp >= cutoff)
    }

    /// O(1) p95 estimate from the online estimator, for risk gating.
    pub fn p95_estimate(&self, kind: LatencyKind) -> f64 {
        self.kinds[kind.index()].estimators.lock().p95.estimate()
    }

    pub fn measurement_count(&self, kind: LatencyKind) -> u64 {
        self.kinds[kind.index()].count.load(Ordering::Relaxed)
    }

    pub fn total_measurements(&self) -> u64 {
        self.kinds
            .iter()
            .map(|k| k.count.load(Ordering::Relaxed))
            .sum()
    }

    pub fn uptime_seconds(&self) -> f64 {
        (self.clock.now() - self.session_start) as f64 / NANOS_PER_SEC as f64
    }

    pub fn reset_statistics(&self) {
        for state in &self.kinds {
            state.ring.clear();
            state.count.store(0, Ordering::Relaxed);
            let mut est = state.estimators.lock();
            est.p95 = P2Quantile::new(95.0);
            est.p99 = P2Quantile::new(99.0);
            est.trend.clear();
            est.updates = 0;
        }
        self.clear_spike_history();
    }

    pub fn clear_spike_history(&self) {
        self.spikes.lock().clear();
    }

    fn push_spike(&self, kind: LatencyKind, latency_us: f64, severity: SpikeSeverity) {
        let spike = LatencySpike {
            timestamp: self.clock.now(),
            kind,
            latency_us,
            severity,
        };
        let mut spikes = self.spikes.lock();
        if spikes.len() == MAX_SPIKE_HISTORY {
            spikes.pop_front();
        }
        spikes.push_back(spike);
    }
}

/// Linear-interpolated percentile over sorted data.
fn sorted_percentile(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (percentile / 100.0) * (sorted.len() - 1) as f64;
    let lower = index as usize;
    if lower >= sorted.len() - 1 {
        return *sorted.last().expect("non-empty");
    }
    let weight = index - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[lower + 1] * weight
}

fn classify_trend(window: &VecDeque<f64>) -> TrendData {
    let n = window.len();
    if n < 3 {
        return TrendData {
            sample_count: n as u32,
            ..Default::default()
        };
    }

    let first = *window.front().expect("non-empty");
    let last = *window.back().expect("non-empty");
    let trend_percentage = if first.abs() > f64::EPSILON {
        (last - first) / first * 100.0
    } else {
        0.0
    };

    let changes: Vec<f64> = window
        .iter()
        .zip(window.iter().skip(1))
        .map(|(a, b)| if a.abs() > f64::EPSILON { (b - a) / a } else { 0.0 })
        .collect();
    let mean_change = changes.iter().sum::<f64>() / changes.len() as f64;
    let volatility = (changes
        .iter()
        .map(|c| (c - mean_change).powi(2))
        .sum::<f64>()
        / changes.len() as f64)
        .sqrt();

    let trend = if volatility > 0.25 {
        PerformanceTrend::Volatile
    } else if trend_percentage <= -5.0 {
        PerformanceTrend::Improving
    } else if trend_percentage >= 5.0 {
        PerformanceTrend::Degrading
    } else {
        PerformanceTrend::Stable
    };

    TrendData {
        trend,
        trend_percentage,
        volatility,
        sample_count: n as u32,
    }
}

/// RAII scope timer. Records elapsed microseconds on drop; the `fast`
/// constructor routes through the allocation-free hot path.
pub struct ScopedTimer<'a> {
    tracker: &'a LatencyTracker,
    kind: LatencyKind,
    start: Nanos,
    fast: bool,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(tracker: &'a LatencyTracker, kind: LatencyKind) -> Self {
        Self {
            tracker,
            kind,
            start: tracker.clock.now(),
            fast: false,
        }
    }

    pub fn fast(tracker: &'a LatencyTracker, kind: LatencyKind) -> Self {
        Self {
            tracker,
            kind,
            start: tracker.clock.now(),
            fast: true,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.tracker.clock.elapsed_micros(self.start);
        if self.fast {
            self.tracker.record_fast(self.kind, elapsed);
        } else {
            self.tracker.record(self.kind, elapsed);
        }
    }
}
