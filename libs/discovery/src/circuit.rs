//! Circuit breaker for per-node fault isolation
//!
//! Each node carries a [`CircuitRecord`]. Failures accumulate while the
//! circuit is closed; at the threshold it opens and the node leaves the
//! available view until an exponentially growing retry delay elapses.
//! The next eligibility check then moves it to half-open, where a single
//! outcome decides: success closes the circuit, failure re-opens it with
//! a longer delay.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CircuitConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - node is eligible
    Closed,
    /// Failing - node is excluded until the retry deadline
    Open,
    /// Probing recovery - node is eligible, next outcome decides
    HalfOpen,
}

/// State change produced by applying an event to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Unchanged,
    Opened { retry_at: Instant },
    HalfOpened,
    Closed,
}

impl CircuitTransition {
    pub fn changed(&self) -> bool {
        !matches!(self, CircuitTransition::Unchanged)
    }
}

/// Per-node circuit state
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
    pub next_retry: Option<Instant>,
    /// Number of consecutive open episodes; drives the backoff exponent
    pub episode: u32,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            next_retry: None,
            episode: 0,
        }
    }
}

impl CircuitRecord {
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Whether the retry deadline of an open circuit has passed
    pub fn retry_due(&self, now: Instant) -> bool {
        self.is_open() && self.next_retry.map_or(true, |at| now >= at)
    }

    fn open(&mut self, config: &CircuitConfig, now: Instant) -> CircuitTransition {
        self.episode = self.episode.saturating_add(1);
        let retry_at = now + config.backoff_delay(self.episode);
        self.state = CircuitState::Open;
        self.next_retry = Some(retry_at);
        CircuitTransition::Opened { retry_at }
    }

    pub fn record_failure(&mut self, config: &CircuitConfig, now: Instant) -> CircuitTransition {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        match self.state {
            CircuitState::Closed if self.failure_count >= config.failure_threshold => {
                self.open(config, now)
            }
            CircuitState::HalfOpen => self.open(config, now),
            _ => CircuitTransition::Unchanged,
        }
    }

    /// Success always resets the counter and forces the circuit closed
    pub fn record_success(&mut self) -> CircuitTransition {
        let was = self.state;
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_retry = None;
        self.episode = 0;
        if was == CircuitState::Closed {
            CircuitTransition::Unchanged
        } else {
            CircuitTransition::Closed
        }
    }

    /// Promote an open circuit whose retry deadline has passed
    pub fn poll(&mut self, now: Instant) -> CircuitTransition {
        if self.retry_due(now) {
            self.state = CircuitState::HalfOpen;
            self.next_retry = None;
            CircuitTransition::HalfOpened
        } else {
            CircuitTransition::Unchanged
        }
    }

    /// Time left until the retry deadline
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_retry.map(|at| at.saturating_duration_since(now))
    }
}

/// Applies events to records under the current configuration and logs
/// every transition
#[derive(Debug)]
pub struct CircuitBreaker {
    config: RwLock<CircuitConfig>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: CircuitConfig) {
        *self.config.write() = config;
    }

    pub fn on_failure(&self, node: &str, record: &mut CircuitRecord, now: Instant) -> CircuitTransition {
        let config = self.config.read();
        let transition = record.record_failure(&config, now);
        match transition {
            CircuitTransition::Opened { retry_at } => warn!(
                "Circuit opened for {} after {} failures, retry in {:?}",
                node,
                record.failure_count,
                retry_at.saturating_duration_since(now)
            ),
            _ => debug!("Failure recorded for {} ({} total)", node, record.failure_count),
        }
        transition
    }

    pub fn on_success(&self, node: &str, record: &mut CircuitRecord) -> CircuitTransition {
        let transition = record.record_success();
        if transition.changed() {
            info!("Circuit closed for {}", node);
        }
        transition
    }

    pub fn on_poll(&self, node: &str, record: &mut CircuitRecord, now: Instant) -> CircuitTransition {
        let transition = record.poll(now);
        if transition.changed() {
            info!("Circuit half-open for {}, admitting a trial request", node);
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            timer_poll_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let cfg = config();
        let now = Instant::now();
        let mut record = CircuitRecord::default();

        assert_eq!(record.record_failure(&cfg, now), CircuitTransition::Unchanged);
        assert_eq!(record.record_failure(&cfg, now), CircuitTransition::Unchanged);
        let t = record.record_failure(&cfg, now);
        assert_eq!(t, CircuitTransition::Opened { retry_at: now + Duration::from_secs(10) });
        assert!(record.is_open());
        assert_eq!(record.failure_count, 3);
    }

    #[test]
    fn test_half_open_failure_doubles_delay() {
        let cfg = config();
        let now = Instant::now();
        let mut record = CircuitRecord::default();
        for _ in 0..3 {
            record.record_failure(&cfg, now);
        }

        let early = now + Duration::from_secs(5);
        assert_eq!(record.poll(early), CircuitTransition::Unchanged);

        let due = now + Duration::from_secs(10);
        assert_eq!(record.poll(due), CircuitTransition::HalfOpened);
        assert_eq!(record.state, CircuitState::HalfOpen);

        let t = record.record_failure(&cfg, due);
        assert_eq!(t, CircuitTransition::Opened { retry_at: due + Duration::from_secs(20) });
        assert_eq!(record.episode, 2);
    }

    #[test]
    fn test_success_forces_closed_from_any_state() {
        let cfg = config();
        let now = Instant::now();
        let mut record = CircuitRecord::default();
        for _ in 0..3 {
            record.record_failure(&cfg, now);
        }
        assert_eq!(record.record_success(), CircuitTransition::Closed);
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.episode, 0);

        // Closed stays closed but the counter still resets
        record.record_failure(&cfg, now);
        assert_eq!(record.record_success(), CircuitTransition::Unchanged);
        assert_eq!(record.failure_count, 0);
    }

    #[test]
    fn test_failures_while_open_do_not_extend_deadline() {
        let cfg = config();
        let now = Instant::now();
        let mut record = CircuitRecord::default();
        for _ in 0..3 {
            record.record_failure(&cfg, now);
        }
        let deadline = record.next_retry;
        record.record_failure(&cfg, now + Duration::from_secs(1));
        assert_eq!(record.next_retry, deadline);
        assert_eq!(record.failure_count, 4);
    }
}
