//! Clock sources
//!
//! Every time-dependent decision in the engine (lease age, circuit retry
//! deadlines, cache TTLs, access frequency) reads time through [`Clock`],
//! so tests can drive the whole registry with simulated time instead of
//! sleeping.
//!
//! ## Usage
//!
//! ```rust
//! use discovery::clock::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(61));
//! assert_eq!(clock.now() - start, Duration::from_secs(61));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant used for all deadlines
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch
    fn wall_ms(&self) -> u64;
}

/// Real time from the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Simulated time that only moves when told to
///
/// Starts at the real current instant and wall time; [`advance`] moves
/// both forward together.
///
/// [`advance`]: ManualClock::advance
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    origin_wall_ms: u64,
    offset_ns: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_wall_ms: SystemClock.wall_ms(),
            offset_ns: AtomicU64::new(0),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Total simulated time elapsed since construction
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall_ms(&self) -> u64 {
        self.origin_wall_ms + self.elapsed().as_millis() as u64
    }
}
