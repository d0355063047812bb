#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic microsecond time source.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    t0: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { t0: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        self.t0.elapsed().as_micros() as i64
    }
}

const FAR: Duration = Duration::from_secs(86_400);

/// `Instant::now() + after`, capped at a day out instead of overflowing.
pub fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after.min(FAR)).unwrap_or(now)
}

/// Hand-driven clock for deterministic tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn at(micros: i64) -> Self {
        Self {
            now: AtomicI64::new(micros),
        }
    }

    pub fn set(&self, micros: i64) {
        self.now.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
