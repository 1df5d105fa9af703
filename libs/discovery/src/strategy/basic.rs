//! Rotation, random and load-based strategies

use rand::seq::index::sample;
use rand::Rng;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::AtomicUsize;

use super::{position_of, rotate};
use crate::registry::NodeSlot;

pub fn round_robin(len: usize, cursor: &AtomicUsize) -> usize {
    rotate(cursor, len)
}

pub fn random<R: Rng + ?Sized>(len: usize, rng: &mut R) -> usize {
    rng.gen_range(0..len)
}

/// Draw in `[0, total)` and binary-search the cumulative weights for the
/// first bucket whose upper bound exceeds the draw
pub fn weighted_random<R: Rng + ?Sized>(candidates: &[&NodeSlot], rng: &mut R) -> Option<usize> {
    let mut cumulative = Vec::with_capacity(candidates.len());
    let mut total: u64 = 0;
    for slot in candidates {
        total += u64::from(slot.node.weight.max(1));
        cumulative.push(total);
    }
    if total == 0 {
        return None;
    }
    let draw = rng.gen_range(0..total);
    Some(cumulative.partition_point(|&upper| upper <= draw))
}

/// Position of a precomputed minimum, if it is among the candidates
pub fn indexed_minimum(candidates: &[&NodeSlot], name: Option<&str>) -> Option<usize> {
    name.and_then(|n| position_of(candidates, n))
}

/// Fewest connections; ties go to the first encountered
pub fn least_connections(candidates: &[&NodeSlot]) -> Option<usize> {
    first_min_by(candidates, |s| s.node.connections as f64)
}

pub fn weighted_least_connections(candidates: &[&NodeSlot]) -> Option<usize> {
    first_min_by(candidates, |s| s.node.connections as f64 / s.node.weight.max(1) as f64)
}

/// Two distinct random candidates; the less loaded wins, the first
/// sampled on ties
pub fn power_of_two<R: Rng + ?Sized>(candidates: &[&NodeSlot], rng: &mut R) -> Option<usize> {
    match candidates.len() {
        0 => None,
        1 => Some(0),
        len => {
            let picks = sample(rng, len, 2);
            let (a, b) = (picks.index(0), picks.index(1));
            if candidates[b].node.connections < candidates[a].node.connections {
                Some(b)
            } else {
                Some(a)
            }
        }
    }
}

/// Lowest cost tier (undeclared tiers sort last), then fewest connections
pub fn cost_aware(candidates: &[&NodeSlot]) -> Option<usize> {
    let tier = |s: &NodeSlot| s.node.cost_tier().unwrap_or(f64::INFINITY);
    let mut best: Option<usize> = None;
    for (i, slot) in candidates.iter().enumerate() {
        let better = match best {
            None => true,
            Some(b) => {
                let current = candidates[b];
                match tier(*slot).partial_cmp(&tier(current)) {
                    Some(CmpOrdering::Less) => true,
                    Some(CmpOrdering::Equal) => slot.node.connections < current.node.connections,
                    _ => false,
                }
            }
        };
        if better {
            best = Some(i);
        }
    }
    best
}

/// Index of the first candidate with the smallest key
pub(crate) fn first_min_by(candidates: &[&NodeSlot], key: impl Fn(&NodeSlot) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, slot) in candidates.iter().enumerate() {
        let value = key(*slot);
        if best.map_or(true, |(_, b)| value < b) {
            best = Some((i, value));
        }
    }
    best.map(|(i, _)| i)
}

/// Index of the first candidate with the largest key
pub(crate) fn first_max_by(candidates: &[&NodeSlot], key: impl Fn(&NodeSlot) -> f64) -> Option<usize> {
    first_min_by(candidates, |s| -key(s))
}
