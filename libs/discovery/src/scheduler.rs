//! Cancellable timer queue
//!
//! A min-heap of `(deadline, key)` entries with per-key generations.
//! Scheduling a key again cancels its previous timer; cancelled entries
//! stay in the heap until they surface and are skipped, and the heap is
//! compacted once stale entries dominate.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry<K: Ord> {
    deadline: Instant,
    generation: u64,
    key: K,
}

#[derive(Debug)]
pub struct TimerQueue<K: Ord + Hash + Clone> {
    heap: BinaryHeap<Reverse<Entry<K>>>,
    live: HashMap<K, u64>,
    next_generation: u64,
}

impl<K: Ord + Hash + Clone> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Hash + Clone> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Schedule `key` at `deadline`, replacing any pending timer for it
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(key.clone(), generation);
        self.heap.push(Reverse(Entry {
            deadline,
            generation,
            key,
        }));
        self.maybe_compact();
    }

    /// Cancel the pending timer for `key`; true if one was pending
    pub fn cancel(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale_head();
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        loop {
            self.discard_stale_head();
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.live.remove(&entry.key);
                due.push(entry.key);
            }
        }
        due
    }

    fn is_live(&self, entry: &Entry<K>) -> bool {
        self.live.get(&entry.key) == Some(&entry.generation)
    }

    fn discard_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            self.heap.pop();
        }
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.live.len() * 4 {
            let live = &self.live;
            self.heap
                .retain(|Reverse(e)| live.get(&e.key) == Some(&e.generation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule("b", t0 + Duration::from_secs(2));
        timers.schedule("a", t0 + Duration::from_secs(1));
        timers.schedule("c", t0 + Duration::from_secs(5));

        assert!(timers.pop_due(t0).is_empty());
        assert_eq!(timers.pop_due(t0 + Duration::from_secs(3)), vec!["a", "b"]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_reschedule_cancels_previous() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule("a", t0 + Duration::from_secs(1));
        timers.schedule("a", t0 + Duration::from_secs(10));

        assert!(timers.pop_due(t0 + Duration::from_secs(2)).is_empty());
        assert_eq!(timers.pop_due(t0 + Duration::from_secs(10)), vec!["a"]);
    }

    #[test]
    fn test_cancel() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(1u32, t0);
        assert!(timers.cancel(&1));
        assert!(!timers.cancel(&1));
        assert!(timers.pop_due(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_compaction_bounds_heap() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::new();
        for i in 0..1000u64 {
            timers.schedule("hot", t0 + Duration::from_millis(i));
        }
        assert!(timers.heap.len() <= 65 * 4);
        assert_eq!(timers.pop_due(t0 + Duration::from_secs(5)), vec!["hot"]);
    }
}
