//! First-come-first-served admission queue.

use crate::request::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Mutex-protected FIFO; the baseline worker discipline for Power-of-2 and
/// original-Malcolm configurations.
pub struct FcfsQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl FcfsQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: Task) {
        self.inner.lock().push_back(task);
    }

    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for FcfsQueue {
    fn default() -> Self {
        Self::new()
    }
}
