//! Earliest-deadline-first admission queue backed by a binary heap.

use crate::clock::Timestamp;
use crate::request::Task;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry ordered by deadline, reversed so the standard max-heap behaves as a min-heap.
/// Ties are left to the heap's internal order; deadlines are nanosecond-granular so ties
/// are rare and the contract does not promise a stable tie-break.
struct EdfEntry {
    task: Task,
}

impl Ord for EdfEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.task.deadline.cmp(&self.task.deadline)
    }
}

impl PartialOrd for EdfEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EdfEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.deadline == other.task.deadline
    }
}

impl Eq for EdfEntry {}

/// Mutex-protected deadline min-heap.
///
/// Every `try_pop` returns a task whose deadline is no later than that of any task
/// still queued.
pub struct EdfHeap {
    inner: Mutex<BinaryHeap<EdfEntry>>,
}

impl EdfHeap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn push(&self, task: Task) {
        self.inner.lock().push(EdfEntry { task });
    }

    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().pop().map(|entry| entry.task)
    }

    /// Earliest queued deadline without popping.
    pub fn peek_deadline(&self) -> Option<Timestamp> {
        self.inner.lock().peek().map(|entry| entry.task.deadline)
    }

    /// Pop every task whose deadline is at or before `now`.
    pub fn drain_expired(&self, now: Timestamp) -> Vec<Task> {
        let mut heap = self.inner.lock();
        let mut expired = Vec::new();
        while let Some(entry) = heap.peek() {
            if entry.task.deadline <= now {
                expired.push(heap.pop().unwrap().task);
            } else {
                break;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Visit every queued task under the lock; used for the slack histogram snapshot.
    pub fn for_each_deadline(&self, mut f: impl FnMut(Timestamp)) {
        let heap = self.inner.lock();
        for entry in heap.iter() {
            f(entry.task.deadline);
        }
    }
}

impl Default for EdfHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests_support::task_with_deadline;

    #[test]
    fn pops_earliest_deadline_first() {
        let heap = EdfHeap::new();
        heap.push(task_with_deadline(1, 5_000));
        heap.push(task_with_deadline(2, 1_000));
        heap.push(task_with_deadline(3, 3_000));

        assert_eq!(heap.try_pop().unwrap().request_id, 2);
        assert_eq!(heap.try_pop().unwrap().request_id, 3);
        assert_eq!(heap.try_pop().unwrap().request_id, 1);
    }

    #[test]
    fn every_pop_is_a_minimum() {
        let heap = EdfHeap::new();
        let deadlines = [9u64, 4, 7, 1, 8, 3, 6, 2, 5];
        for (i, d) in deadlines.iter().enumerate() {
            heap.push(task_with_deadline(i as u64, d * 1_000));
        }
        let mut last = 0;
        while let Some(task) = heap.try_pop() {
            // The popped deadline is never later than anything still queued.
            heap.for_each_deadline(|remaining| assert!(task.deadline <= remaining));
            assert!(task.deadline >= last);
            last = task.deadline;
        }
    }

    #[test]
    fn drain_expired_splits_on_now() {
        let heap = EdfHeap::new();
        heap.push(task_with_deadline(1, 100));
        heap.push(task_with_deadline(2, 200));
        heap.push(task_with_deadline(3, 5_000));

        let expired = heap.drain_expired(250);
        let ids: Vec<u64> = expired.iter().map(|t| t.request_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.peek_deadline(), Some(5_000));
    }
}
