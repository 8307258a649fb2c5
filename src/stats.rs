use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

/// Rolling sample count behind the mean active/idle/wait times.
const WINDOW_SIZE: usize = 100;

/// Retained summaries of exceptions the pool swallowed.
const SWALLOWED_CAP: usize = 16;

pub(crate) struct TimeWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl TimeWindow {
    fn new() -> Self {
        TimeWindow {
            samples: Mutex::new(VecDeque::with_capacity(WINDOW_SIZE)),
        }
    }

    pub(crate) fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == WINDOW_SIZE {
            samples.pop_front();
        }
        samples.push_back(sample.as_millis() as u64);
    }

    pub(crate) fn mean(&self) -> Duration {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let total: u64 = samples.iter().sum();
        Duration::from_millis(total / samples.len() as u64)
    }
}

/// Shared bookkeeping reused by both pool shapes.
pub(crate) struct PoolStats {
    pub(crate) created: AtomicU64,
    pub(crate) destroyed: AtomicU64,
    pub(crate) destroyed_by_evictor: AtomicU64,
    pub(crate) destroyed_by_validation: AtomicU64,
    pub(crate) borrowed: AtomicU64,
    pub(crate) returned: AtomicU64,
    max_borrow_wait_millis: AtomicU64,
    active_times: TimeWindow,
    idle_times: TimeWindow,
    wait_times: TimeWindow,
    swallowed: Mutex<VecDeque<String>>,
}

impl PoolStats {
    pub(crate) fn new() -> Self {
        PoolStats {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            destroyed_by_evictor: AtomicU64::new(0),
            destroyed_by_validation: AtomicU64::new(0),
            borrowed: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            max_borrow_wait_millis: AtomicU64::new(0),
            active_times: TimeWindow::new(),
            idle_times: TimeWindow::new(),
            wait_times: TimeWindow::new(),
            swallowed: Mutex::new(VecDeque::with_capacity(SWALLOWED_CAP)),
        }
    }

    /// Records a successful borrow: how long the caller waited and how long
    /// the entry had been idle.
    pub(crate) fn record_borrow(&self, waited: Duration, idled: Duration) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        self.wait_times.record(waited);
        self.idle_times.record(idled);
        self.max_borrow_wait_millis
            .fetch_max(waited.as_millis() as u64, Ordering::Relaxed);
    }

    /// Records a completed return and how long the instance was out.
    pub(crate) fn record_return(&self, active: Duration) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.active_times.record(active);
    }

    /// Notes an error the pool chose not to surface.
    pub(crate) fn swallow(&self, context: &str, error: &dyn fmt::Display) {
        warn!(context, %error, "swallowed pool error");
        let mut swallowed = self.swallowed.lock().unwrap();
        if swallowed.len() == SWALLOWED_CAP {
            swallowed.pop_front();
        }
        swallowed.push_back(format!("{context}: {error}"));
    }

    pub(crate) fn swallowed_summaries(&self) -> Vec<String> {
        self.swallowed.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            destroyed_by_evictor: self.destroyed_by_evictor.load(Ordering::Relaxed),
            destroyed_by_validation: self.destroyed_by_validation.load(Ordering::Relaxed),
            borrowed: self.borrowed.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            max_borrow_wait: Duration::from_millis(
                self.max_borrow_wait_millis.load(Ordering::Relaxed),
            ),
            mean_active_time: self.active_times.mean(),
            mean_idle_time: self.idle_times.mean(),
            mean_borrow_wait: self.wait_times.mean(),
        }
    }
}

pub(crate) struct StatsSnapshot {
    pub(crate) created: u64,
    pub(crate) destroyed: u64,
    pub(crate) destroyed_by_evictor: u64,
    pub(crate) destroyed_by_validation: u64,
    pub(crate) borrowed: u64,
    pub(crate) returned: u64,
    pub(crate) max_borrow_wait: Duration,
    pub(crate) mean_active_time: Duration,
    pub(crate) mean_idle_time: Duration,
    pub(crate) mean_borrow_wait: Duration,
}

/// A point-in-time view of a pool's population and counters.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolStatus {
    /// The configured pool name, if any.
    pub name: Option<String>,
    /// Source location where the pool was built.
    pub created_at: String,
    /// Instances currently borrowed.
    pub num_active: usize,
    /// Instances currently idle.
    pub num_idle: usize,
    /// Borrowers currently suspended waiting for an instance.
    pub num_waiters: usize,
    /// Instances created over the pool's lifetime.
    pub created: u64,
    /// Instances destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Destroyed by the eviction task.
    pub destroyed_by_evictor: u64,
    /// Destroyed after failing borrow-time validation.
    pub destroyed_by_validation: u64,
    /// Successful borrows.
    pub borrowed: u64,
    /// Successful returns.
    pub returned: u64,
    /// Longest any borrower has waited.
    pub max_borrow_wait: Duration,
    /// Rolling mean of checked-out time.
    pub mean_active_time: Duration,
    /// Rolling mean of time spent idle before borrow.
    pub mean_idle_time: Duration,
    /// Rolling mean of borrow wait time.
    pub mean_borrow_wait: Duration,
    /// Summaries of recently swallowed errors, oldest first.
    pub swallowed_errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded_and_averages() {
        let window = TimeWindow::new();
        for _ in 0..150 {
            window.record(Duration::from_millis(10));
        }
        assert_eq!(window.samples.lock().unwrap().len(), WINDOW_SIZE);
        assert_eq!(window.mean(), Duration::from_millis(10));
    }

    #[test]
    fn max_wait_is_monotonic() {
        let stats = PoolStats::new();
        stats.record_borrow(Duration::from_millis(5), Duration::ZERO);
        stats.record_borrow(Duration::from_millis(50), Duration::ZERO);
        stats.record_borrow(Duration::from_millis(20), Duration::ZERO);
        assert_eq!(stats.snapshot().max_borrow_wait, Duration::from_millis(50));
    }

    #[test]
    fn swallowed_ring_keeps_most_recent() {
        let stats = PoolStats::new();
        for i in 0..(SWALLOWED_CAP + 4) {
            stats.swallow("destroy", &format!("error {i}"));
        }
        let summaries = stats.swallowed_summaries();
        assert_eq!(summaries.len(), SWALLOWED_CAP);
        assert!(summaries.last().unwrap().contains("error 19"));
        assert!(summaries.first().unwrap().contains("error 4"));
    }
}
