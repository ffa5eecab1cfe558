//! Bounded checkpoint ring with strict FIFO eviction.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use mm_domain::checkpoint::Checkpoint;

/// Holds the most recent K checkpoints for a session; the oldest is
/// dropped when a new one arrives at capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRing {
    capacity: usize,
    entries: VecDeque<Checkpoint>,
}

impl CheckpointRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Append a checkpoint, evicting the oldest entry at capacity.
    /// Returns the evicted checkpoint, if any.
    pub fn push(&mut self, checkpoint: Checkpoint) -> Option<Checkpoint> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(checkpoint);
        evicted
    }

    /// Checkpoint at `index` (0 = oldest surviving entry).
    pub fn get(&self, index: usize) -> Option<&Checkpoint> {
        self.entries.get(index)
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.entries.iter()
    }
}
