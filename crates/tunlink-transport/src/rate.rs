// ============================================
// File: crates/tunlink-transport/src/rate.rs
// ============================================
//! # Throughput Estimation and Poll Policy
//!
//! ## Creation Reason
//! When a device read finds nothing pending it must choose between
//! spinning and parking on an OS wait. Parking costs a syscall and a
//! wake-up; at high packet rates that dominates, at low rates spinning
//! just burns CPU. The choice is driven by a measured byte rate.
//!
//! ## Main Functionality
//! - `RateEstimator`: lock-free rolling byte-rate measurement
//! - `PollPolicy`: spin threshold, spin budget, measurement granularity
//!
//! ## Main Logical Flow
//! 1. Every read and write records its size
//! 2. The first recorder to cross a window boundary wins a CAS guard and
//!    publishes `bytes / window` as the current rate
//! 3. Concurrent recorders in the same window just accumulate bytes
//! 4. Readers spin only while the rate is high AND the reading is fresh
//!
//! ## ⚠️ Important Note for Next Developer
//! - The rate is an approximate signal; orderings are Acquire/Release,
//!   not SeqCst, on purpose
//! - Time is `monotonic_nanos()`; tests drive `record_at` directly
//!
//! ## Last Modified
//! v0.1.0 - Initial estimator

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tunlink_common::time::monotonic_nanos;

// ============================================
// Constants
// ============================================

/// Length of one measurement window.
pub const MEASUREMENT_GRANULARITY: Duration = Duration::from_millis(500);

/// Rate (bytes per second) at or above which readers spin: 800 Mbit/s.
pub const SPIN_RATE_THRESHOLD: u64 = 800_000_000 / 8;

/// Longest a reader spins before parking: 1 ms / 80.
pub const MAX_SPIN_DURATION: Duration = Duration::from_nanos(12_500);

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[allow(clippy::cast_possible_truncation)]
const fn as_nanos(d: Duration) -> u64 {
    d.as_nanos() as u64
}

// ============================================
// PollPolicy
// ============================================

/// Tuning of the adaptive spin/park decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Minimum published rate, in bytes per second, to allow spinning.
    pub rate_threshold: u64,
    /// Spin budget per park decision.
    pub max_spin: Duration,
    /// Measurement window length.
    pub granularity: Duration,
}

impl PollPolicy {
    /// Policy that never spins.
    #[must_use]
    pub const fn never_spin() -> Self {
        Self {
            rate_threshold: u64::MAX,
            max_spin: Duration::ZERO,
            granularity: MEASUREMENT_GRANULARITY,
        }
    }

    /// Returns `true` if a reader should spin rather than park at `now`.
    ///
    /// Requires the published rate to reach the threshold and the
    /// window it came from to be no older than two granularities.
    #[must_use]
    pub fn should_spin(&self, rate: &RateEstimator, now: u64) -> bool {
        rate.current() >= self.rate_threshold && rate.is_fresh(now)
    }

    /// Returns `true` while `spun_nanos` is inside the spin budget.
    #[must_use]
    pub const fn within_budget(&self, spun_nanos: u64) -> bool {
        spun_nanos < as_nanos(self.max_spin)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            rate_threshold: SPIN_RATE_THRESHOLD,
            max_spin: MAX_SPIN_DURATION,
            granularity: MEASUREMENT_GRANULARITY,
        }
    }
}

// ============================================
// RateEstimator
// ============================================

/// Rolling byte-rate measurement with a single-writer publish guard.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use tunlink_transport::rate::RateEstimator;
///
/// let rate = RateEstimator::starting_at(0, Duration::from_millis(500));
/// rate.record_at(250_000_000, 50_000);
/// assert_eq!(rate.current(), 0); // window not finished yet
/// rate.record_at(500_000_000, 50_000);
/// assert_eq!(rate.current(), 200_000);
/// ```
#[derive(Debug)]
pub struct RateEstimator {
    /// Published rate in bytes per second
    current: AtomicU64,
    /// Bytes accumulated in the open window
    next_byte_count: AtomicU64,
    /// Monotonic nanos at which the open window started
    next_start_time: AtomicU64,
    /// Publish guard
    changing: AtomicBool,
    /// Number of windows published so far
    windows: AtomicU64,
    granularity: u64,
}

impl RateEstimator {
    /// Creates an estimator whose first window starts now.
    #[must_use]
    pub fn new(granularity: Duration) -> Self {
        Self::starting_at(monotonic_nanos(), granularity)
    }

    /// Creates an estimator whose first window starts at `start` nanos.
    #[must_use]
    pub const fn starting_at(start: u64, granularity: Duration) -> Self {
        Self {
            current: AtomicU64::new(0),
            next_byte_count: AtomicU64::new(0),
            next_start_time: AtomicU64::new(start),
            changing: AtomicBool::new(false),
            windows: AtomicU64::new(0),
            granularity: as_nanos(granularity),
        }
    }

    /// Records `len` bytes at the current time.
    pub fn record(&self, len: u64) {
        self.record_at(monotonic_nanos(), len);
    }

    /// Records `len` bytes at `now` (monotonic nanos).
    pub fn record_at(&self, now: u64, len: u64) {
        self.next_byte_count.fetch_add(len, Ordering::AcqRel);

        if !self.window_elapsed(now) {
            return;
        }
        if self
            .changing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // Another recorder may have published this window between our
        // check and winning the guard.
        let start = self.next_start_time.load(Ordering::Acquire);
        let period = now.saturating_sub(start);
        if period >= self.granularity && period > 0 {
            let total = self.next_byte_count.swap(0, Ordering::AcqRel);
            let rate = u128::from(total) * NANOS_PER_SEC / u128::from(period);
            self.next_start_time.store(now, Ordering::Release);
            self.current
                .store(u64::try_from(rate).unwrap_or(u64::MAX), Ordering::Release);
            self.windows.fetch_add(1, Ordering::Relaxed);
        }

        self.changing.store(false, Ordering::Release);
    }

    fn window_elapsed(&self, now: u64) -> bool {
        now.saturating_sub(self.next_start_time.load(Ordering::Acquire)) >= self.granularity
    }

    /// Published rate in bytes per second.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Start of the open window, in monotonic nanos.
    #[must_use]
    pub fn window_start(&self) -> u64 {
        self.next_start_time.load(Ordering::Acquire)
    }

    /// Returns `true` if the published rate is at most two windows old.
    #[must_use]
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start()) <= self.granularity.saturating_mul(2)
    }

    /// Number of windows published so far.
    #[must_use]
    pub fn windows_published(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(MEASUREMENT_GRANULARITY)
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_uniform_feed_yields_expected_rate() {
        let rate = RateEstimator::starting_at(0, MEASUREMENT_GRANULARITY);

        // 100 x 1000 bytes spread evenly over 500ms => 200 KB/s
        for i in 1..=100u64 {
            rate.record_at(i * 5 * MS, 1000);
        }

        let expected = 200_000u64;
        let got = rate.current();
        assert!(got.abs_diff(expected) <= expected / 100, "rate {got}");
        assert_eq!(rate.windows_published(), 1);
        assert_eq!(rate.window_start(), 500 * MS);
    }

    #[test]
    fn test_no_publish_inside_window() {
        let rate = RateEstimator::starting_at(0, MEASUREMENT_GRANULARITY);
        rate.record_at(100 * MS, 1_000_000);
        rate.record_at(499 * MS, 1_000_000);
        assert_eq!(rate.current(), 0);
        assert_eq!(rate.windows_published(), 0);
    }

    #[test]
    fn test_concurrent_updates_publish_once_per_window() {
        let rate = Arc::new(RateEstimator::starting_at(0, MEASUREMENT_GRANULARITY));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rate = Arc::clone(&rate);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        rate.record_at(600 * MS, 10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(rate.windows_published(), 1);
    }

    #[test]
    fn test_should_spin_requires_rate_and_freshness() {
        let policy = PollPolicy::default();
        let rate = RateEstimator::starting_at(0, MEASUREMENT_GRANULARITY);
        assert!(!policy.should_spin(&rate, 0));

        // 60 MB in 500ms => 120 MB/s, above the 100 MB/s threshold
        rate.record_at(500 * MS, 60_000_000);
        assert!(rate.current() >= SPIN_RATE_THRESHOLD);
        assert!(policy.should_spin(&rate, 600 * MS));
        assert!(policy.should_spin(&rate, 1500 * MS));

        // stale reading
        assert!(!policy.should_spin(&rate, 1501 * MS));
    }

    #[test]
    fn test_low_rate_never_spins() {
        let policy = PollPolicy::default();
        let rate = RateEstimator::starting_at(0, MEASUREMENT_GRANULARITY);
        rate.record_at(500 * MS, 1500);
        assert!(!policy.should_spin(&rate, 510 * MS));
        assert!(!PollPolicy::never_spin().should_spin(&rate, 510 * MS));
    }

    #[test]
    fn test_spin_budget() {
        let policy = PollPolicy::default();
        assert!(policy.within_budget(0));
        assert!(policy.within_budget(12_499));
        assert!(!policy.within_budget(12_500));
        assert!(!PollPolicy::never_spin().within_budget(0));
    }
}
