// ============================================
// File: crates/tunlink-common/src/time.rs
// ============================================
//! # Time Utilities
//!
//! ## Creation Reason
//! The device read/write path and the rate estimator need a monotonic
//! clock they can store in atomics; flows need lock-free last-activity
//! stamps for idle expiry.
//!
//! ## Main Functionality
//! - `monotonic_nanos()`: nanoseconds since a process-wide reference instant
//! - `AtomicInstant`: Thread-safe wrapper around `Instant`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Both share the same reference instant, so values are comparable
//! - `AtomicInstant` uses `AtomicU64` internally (nanoseconds since start)
//!
//! ## Last Modified
//! v0.1.0 - Initial time utilities

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Reference instant (lazily initialized on first use).
fn reference() -> Instant {
    static REFERENCE: OnceLock<Instant> = OnceLock::new();
    *REFERENCE.get_or_init(Instant::now)
}

#[allow(clippy::cast_possible_truncation)]
fn nanos_since_reference(instant: Instant) -> u64 {
    instant
        .checked_duration_since(reference())
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Returns monotonic nanoseconds since the process-wide reference instant.
///
/// Never returns 0 after the first call has initialized the reference,
/// except on that very first call.
#[must_use]
pub fn monotonic_nanos() -> u64 {
    nanos_since_reference(Instant::now())
}

// ============================================
// AtomicInstant
// ============================================

/// Thread-safe wrapper around [`Instant`] for concurrent access.
///
/// # Example
/// ```
/// use tunlink_common::time::AtomicInstant;
/// use std::time::Instant;
///
/// let atomic = AtomicInstant::now();
/// atomic.store(Instant::now());
/// assert!(atomic.elapsed().as_secs() < 1);
/// ```
#[derive(Debug)]
pub struct AtomicInstant {
    /// Nanoseconds since the reference instant
    nanos: AtomicU64,
}

impl AtomicInstant {
    /// Creates a new `AtomicInstant` set to the current time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    /// Creates a new `AtomicInstant` from an `Instant`.
    #[must_use]
    pub fn from_instant(instant: Instant) -> Self {
        Self {
            nanos: AtomicU64::new(nanos_since_reference(instant)),
        }
    }

    /// Loads the stored instant.
    #[must_use]
    pub fn load(&self) -> Instant {
        let nanos = self.nanos.load(Ordering::Relaxed);
        reference() + Duration::from_nanos(nanos)
    }

    /// Stores a new instant.
    pub fn store(&self, instant: Instant) {
        self.nanos
            .store(nanos_since_reference(instant), Ordering::Relaxed);
    }

    /// Updates to the current time and returns the previous value.
    pub fn touch(&self) -> Instant {
        let old = self.load();
        self.store(Instant::now());
        old
    }

    /// Returns the elapsed time since the stored instant.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.load().elapsed()
    }

    /// Checks if more than `duration` has elapsed since the stored instant.
    #[must_use]
    pub fn has_elapsed(&self, duration: Duration) -> bool {
        self.elapsed() > duration
    }
}

impl Default for AtomicInstant {
    fn default() -> Self {
        Self::now()
    }
}

// ============================================
// Tests
// ============================================
