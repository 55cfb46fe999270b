//! Bounded FIFO of recent fixes feeding the lane classifier.

use std::collections::VecDeque;

use crate::VehicleFix;

/// Fixed-capacity window of distinct consecutive fixes with a cyclic fill counter.
///
/// The window is due for classification exactly when it is full and the
/// counter has wrapped to zero, i.e. once per `capacity` accepted fixes.
#[derive(Debug, Clone)]
pub struct FixWindow {
    capacity: usize,
    fixes: VecDeque<VehicleFix>,
    counter: usize,
}

impl FixWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            fixes: VecDeque::with_capacity(capacity),
            counter: 0,
        }
    }

    /// Insert a fix. Returns `false` (and changes nothing) when it repeats the
    /// coordinates of the most recent entry.
    pub fn push(&mut self, fix: VehicleFix) -> bool {
        if let Some(last) = self.fixes.back() {
            if last.position.same_coordinates(&fix.position) {
                return false;
            }
        }
        if self.fixes.len() == self.capacity {
            self.fixes.pop_front();
        }
        self.fixes.push_back(fix);
        self.counter = (self.counter + 1) % self.capacity;
        true
    }

    pub fn is_full(&self) -> bool {
        self.fixes.len() == self.capacity
    }

    pub fn is_due(&self) -> bool {
        self.is_full() && self.counter == 0
    }

    /// Oldest-first copy of the window contents.
    pub fn snapshot(&self) -> Vec<VehicleFix> {
        self.fixes.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
