//! Duplicate suppression for at-least-once delivery
//!
//! Resume replays and ack-driven retries can hand the client the same
//! envelope twice. Message IDs seen once are remembered here so the
//! application only observes each message a single time.

use std::collections::{HashSet, VecDeque};

const HIGH_WATER: usize = 10_000;
const KEEP_AFTER_TRIM: usize = 1_000;

/// Bounded set of already-seen message IDs, trimmed oldest-first.
#[derive(Debug)]
pub struct SeenSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    high_water: usize,
    keep: usize,
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SeenSet {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(HIGH_WATER, KEEP_AFTER_TRIM)
    }

    #[must_use]
    pub fn with_limits(high_water: usize, keep: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            high_water,
            keep: keep.min(high_water),
        }
    }

    /// Records an ID. Returns `false` when it was already present.
    pub fn insert(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return false;
        }
        self.seen.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());
        self.enforce_limit();
        true
    }

    #[must_use]
    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Trims down to the retention floor when the set has outgrown its
    /// high water mark. Called inline on insert and by the periodic
    /// maintenance task.
    pub fn enforce_limit(&mut self) {
        if self.order.len() > self.high_water {
            self.trim();
        }
    }

    /// Drops the oldest entries until only the newest `keep` remain.
    fn trim(&mut self) {
        while self.order.len() > self.keep {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}
