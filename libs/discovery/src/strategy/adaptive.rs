//! Metric-driven strategies over response-time history and health scores

use rand::seq::index::sample;
use rand::Rng;

use super::basic::{first_max_by, first_min_by};
use crate::registry::NodeSlot;

/// Candidates examined by the sampled strategy
const ADAPTIVE_SAMPLE: usize = 5;

/// Penalty in milliseconds per in-flight connection for the sampled strategy
const CONNECTION_PENALTY_MS: f64 = 10.0;

/// Lowest average response time; nodes without samples count as 0
pub fn least_response_time(candidates: &[&NodeSlot]) -> Option<usize> {
    first_min_by(candidates, |s| s.stats.average())
}

pub fn health_score(candidates: &[&NodeSlot]) -> Option<usize> {
    first_max_by(candidates, |s| s.score)
}

/// Most negative latency slope over the trend window
pub fn predictive(candidates: &[&NodeSlot], window: usize) -> Option<usize> {
    first_min_by(candidates, |s| s.stats.trend(window))
}

/// Sample up to five candidates and minimize latency plus a load penalty
pub fn sampled<R: Rng + ?Sized>(candidates: &[&NodeSlot], rng: &mut R) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let amount = candidates.len().min(ADAPTIVE_SAMPLE);
    let mut picks: Vec<usize> = sample(rng, candidates.len(), amount).into_vec();
    picks.sort_unstable();

    let cost = |i: usize| {
        let s = candidates[i];
        s.stats.average() + s.node.connections as f64 * CONNECTION_PENALTY_MS
    };
    let mut best = picks[0];
    for &i in &picks[1..] {
        if cost(i) < cost(best) {
            best = i;
        }
    }
    Some(best)
}
