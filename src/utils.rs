use chrono::Utc;
use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Source of wall-clock time for window accounting, in epoch milliseconds.
///
/// Stores and the limiter share one clock so that the window start written
/// by a store and the `now` used for the retry hint agree.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time value, so a clone handed to a store can be
/// advanced from the test that owns the original.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Start at the current system time
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_millis())
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Window length in whole milliseconds, as stored alongside records
pub fn window_millis(window: Duration) -> i64 {
    window.as_millis().min(i64::MAX as u128) as i64
}

/// Seconds until the window that started at `window_start_ms` ends,
/// rounded up and clamped to `[0, ceil(window / 1000)]`.
pub fn calculate_retry_after(window_start_ms: i64, window: Duration, now_ms: i64) -> u64 {
    let window_ms = window_millis(window);
    let ceiling = ceil_div_1000(window_ms);
    let remaining_ms = window_start_ms
        .saturating_add(window_ms)
        .saturating_sub(now_ms);
    if remaining_ms <= 0 {
        return 0;
    }
    ceil_div_1000(remaining_ms).min(ceiling)
}

fn ceil_div_1000(ms: i64) -> u64 {
    ((ms.max(0) as u64) + 999) / 1000
}
