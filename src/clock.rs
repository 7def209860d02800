//! Monotonic Clock
//!
//! Nanosecond timestamps shared by every component. Readings come from a
//! `quanta` clock (TSC-backed where available) anchored to the wall clock
//! once at construction, so timestamps are cheap, monotonic, and comparable
//! across threads.

/// Nanoseconds since Unix epoch. i64 gives ~292 years of range.
pub type Nanos = i64;

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Monotonic clock anchored to wall time at construction.
#[derive(Debug, Clone)]
pub struct MonoClock {
    inner: quanta::Clock,
    /// Raw counter reading at anchor time.
    anchor_raw: u64,
    /// Wall-clock nanos at anchor time.
    anchor_wall: Nanos,
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonoClock {
    pub fn new() -> Self {
        let inner = quanta::Clock::new();
        let anchor_raw = inner.raw();
        let anchor_wall = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        Self {
            inner,
            anchor_raw,
            anchor_wall,
        }
    }

    /// Current time in nanoseconds since Unix epoch.
    #[inline]
    pub fn now(&self) -> Nanos {
        let delta = self.inner.delta(self.anchor_raw, self.inner.raw());
        self.anchor_wall.saturating_add(delta.as_nanos() as i64)
    }

    /// Microseconds elapsed since `start`, as a float for latency records.
    #[inline]
    pub fn elapsed_micros(&self, start: Nanos) -> f64 {
        (self.now() - start) as f64 / NANOS_PER_MICRO as f64
    }
}

/// Render a nanosecond timestamp as `HH:MM:SS.mmm` UTC for reports.
pub fn format_time(ts: Nanos) -> String {
    match chrono::DateTime::from_timestamp(ts / NANOS_PER_SEC, (ts % NANOS_PER_SEC) as u32) {
        Some(dt) => dt.format("%H:%M:%S%.3f").to_string(),
        None => "--:--:--".to_string(),
    }
}

/// Render a microsecond duration with an adaptive unit.
pub fn format_micros(us: f64) -> String {
    if us < 1_000.0 {
        format!("{us:.1}us")
    } else if us < 1_000_000.0 {
        format!("{:.2}ms", us / 1_000.0)
    } else {
        format!("{:.3}s", us / 1_000_000.0)
    }
}
