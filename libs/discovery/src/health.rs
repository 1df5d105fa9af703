//! Health scoring
//!
//! Derives an advisory 0-100 score per node from its response-time
//! history and circuit state. Scores feed the health-score strategy and
//! introspection; they never gate eligibility.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::circuit::CircuitRecord;
use crate::config::HealthConfig;

/// Score of a node with no recorded problems
pub const MAX_SCORE: f64 = 100.0;

/// Rolling window of response times in milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseStats {
    samples: VecDeque<f64>,
    sum: f64,
}

impl ResponseStats {
    pub fn record(&mut self, latency_ms: f64, window: usize) {
        self.samples.push_back(latency_ms);
        self.sum += latency_ms;
        while self.samples.len() > window.max(1) {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// Mean of the window; 0 when nothing was recorded
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    /// Least-squares slope over the most recent `window` samples
    ///
    /// Negative means latency is falling. Fewer than two samples yield 0.
    pub fn trend(&self, window: usize) -> f64 {
        let skip = self.samples.len().saturating_sub(window);
        let recent: Vec<f64> = self.samples.iter().skip(skip).copied().collect();
        let n = recent.len();
        if n < 2 {
            return 0.0;
        }

        let n_f = n as f64;
        let mean_x = (n_f - 1.0) / 2.0;
        let mean_y = recent.iter().sum::<f64>() / n_f;
        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in recent.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }
}

/// `100 - min(20, avg/100) - min(30, failures*5) - (50 if open)`, clamped
pub fn compute_score(avg_response_ms: f64, failure_count: u32, circuit_open: bool) -> f64 {
    let latency_penalty = (avg_response_ms / 100.0).min(20.0);
    let failure_penalty = (failure_count as f64 * 5.0).min(30.0);
    let open_penalty = if circuit_open { 50.0 } else { 0.0 };
    (MAX_SCORE - latency_penalty - failure_penalty - open_penalty).clamp(0.0, MAX_SCORE)
}

/// Owns the health configuration and the scoring on/off switch
#[derive(Debug)]
pub struct HealthScorer {
    config: RwLock<HealthConfig>,
    enabled: AtomicBool,
}

impl HealthScorer {
    pub fn new(config: HealthConfig, enabled: bool) -> Self {
        Self {
            config: RwLock::new(config),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.config.read().clone()
    }

    pub fn update(&self, config: HealthConfig, enabled: bool) {
        *self.config.write() = config;
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn response_window(&self) -> usize {
        self.config.read().response_window
    }

    pub fn trend_window(&self) -> usize {
        self.config.read().trend_window
    }

    /// Current score; a flat maximum while scoring is disabled
    pub fn score(&self, stats: &ResponseStats, circuit: &CircuitRecord) -> f64 {
        if !self.is_enabled() {
            return MAX_SCORE;
        }
        compute_score(stats.average(), circuit.failure_count, circuit.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_formula() {
        assert_eq!(compute_score(0.0, 0, false), 100.0);
        assert_eq!(compute_score(500.0, 0, false), 95.0);
        assert_eq!(compute_score(10_000.0, 0, false), 80.0);
        assert_eq!(compute_score(0.0, 2, false), 90.0);
        assert_eq!(compute_score(0.0, 50, false), 70.0);
        assert_eq!(compute_score(0.0, 5, true), 25.0);
        assert_eq!(compute_score(5_000.0, 10, true), 0.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut stats = ResponseStats::default();
        for ms in [10.0, 20.0, 30.0, 40.0] {
            stats.record(ms, 3);
        }
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.average(), 30.0);
    }

    #[test]
    fn test_trend_slope() {
        let mut stats = ResponseStats::default();
        assert_eq!(stats.trend(10), 0.0);
        stats.record(100.0, 10);
        assert_eq!(stats.trend(10), 0.0);

        for ms in [90.0, 80.0, 70.0] {
            stats.record(ms, 10);
        }
        assert!((stats.trend(10) + 10.0).abs() < 1e-9);

        // Only the last two samples count with a window of 2
        stats.record(75.0, 10);
        assert!((stats.trend(2) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_scorer_is_flat() {
        let scorer = HealthScorer::new(crate::RegistryConfig::default().health, false);
        let mut stats = ResponseStats::default();
        stats.record(9_000.0, 10);
        let mut circuit = CircuitRecord::default();
        circuit.failure_count = 10;
        assert_eq!(scorer.score(&stats, &circuit), MAX_SCORE);
    }
}
