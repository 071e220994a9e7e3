//! Hierarchical timing wheel: the high-throughput EDF variant.
//!
//! Deadlines hash into one of N buckets of width W; insertion is O(1) and contention spreads
//! across per-bucket mutexes. `try_get_urgent` scans the current tick bucket and the N/8 buckets
//! preceding it (modulo N), returning the minimum-deadline task from the first non-empty bucket.
//! The scan window trades exact EDF order for constant-time insert; tasks in the same bucket have
//! deadlines within W of each other, so the approximation error is bounded by the bucket width.

use crate::clock::{now_ns, Timestamp};
use crate::request::Task;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bucket count; a power of two so the modulo compiles to a mask.
pub const NUM_BUCKETS: usize = 1_024;
/// Bucket width in nanoseconds.
pub const BUCKET_WIDTH_NS: u64 = 100_000;
/// Buckets scanned behind the current tick for overdue work.
const SCAN_WINDOW: usize = NUM_BUCKETS / 8;

struct Bucket {
    tasks: Mutex<Vec<Task>>,
}

pub struct TimingWheel {
    buckets: Vec<Bucket>,
    total: AtomicUsize,
}

impl TimingWheel {
    pub fn new() -> Self {
        Self {
            buckets: (0..NUM_BUCKETS)
                .map(|_| Bucket {
                    tasks: Mutex::new(Vec::new()),
                })
                .collect(),
            total: AtomicUsize::new(0),
        }
    }

    fn bucket_index(deadline: Timestamp) -> usize {
        ((deadline / BUCKET_WIDTH_NS) as usize) & (NUM_BUCKETS - 1)
    }

    pub fn insert(&self, task: Task) {
        let idx = Self::bucket_index(task.deadline);
        self.buckets[idx].tasks.lock().push(task);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Scan from the current tick backwards through the window and return the
    /// minimum-deadline task from the first non-empty bucket.
    pub fn try_get_urgent(&self, now: Timestamp) -> Option<Task> {
        let current = ((now / BUCKET_WIDTH_NS) as usize) & (NUM_BUCKETS - 1);
        for offset in 0..SCAN_WINDOW {
            let idx = (current + NUM_BUCKETS - offset) & (NUM_BUCKETS - 1);
            let mut tasks = self.buckets[idx].tasks.lock();
            if tasks.is_empty() {
                continue;
            }
            let min_pos = tasks
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.deadline)
                .map(|(pos, _)| pos)
                .unwrap();
            let task = tasks.swap_remove(min_pos);
            self.total.fetch_sub(1, Ordering::Relaxed);
            return Some(task);
        }
        None
    }

    pub fn try_pop(&self) -> Option<Task> {
        self.try_get_urgent(now_ns())
    }

    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every queued task's deadline; used for the slack histogram snapshot.
    pub fn for_each_deadline(&self, mut f: impl FnMut(Timestamp)) {
        for bucket in &self.buckets {
            let tasks = bucket.tasks.lock();
            for task in tasks.iter() {
                f(task.deadline);
            }
        }
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests_support::task_with_deadline;

    #[test]
    fn urgent_scan_finds_task_in_current_bucket() {
        let wheel = TimingWheel::new();
        let now = 50 * BUCKET_WIDTH_NS + 10;
        wheel.insert(task_with_deadline(1, now));
        let got = wheel.try_get_urgent(now).expect("task in current bucket");
        assert_eq!(got.request_id, 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn urgent_scan_reaches_back_for_overdue_tasks() {
        let wheel = TimingWheel::new();
        let now = 200 * BUCKET_WIDTH_NS;
        // Overdue by 20 buckets, still inside the scan window of 128.
        wheel.insert(task_with_deadline(9, now - 20 * BUCKET_WIDTH_NS));
        let got = wheel.try_get_urgent(now).expect("overdue task found");
        assert_eq!(got.request_id, 9);
    }

    #[test]
    fn picks_minimum_deadline_within_a_bucket() {
        let wheel = TimingWheel::new();
        let base = 300 * BUCKET_WIDTH_NS;
        wheel.insert(task_with_deadline(1, base + 90_000));
        wheel.insert(task_with_deadline(2, base + 10_000));
        wheel.insert(task_with_deadline(3, base + 50_000));
        let got = wheel.try_get_urgent(base).unwrap();
        assert_eq!(got.request_id, 2);
        assert_eq!(wheel.len(), 2);
    }

    #[test]
    fn future_tasks_outside_window_stay_queued() {
        let wheel = TimingWheel::new();
        let now = 100 * BUCKET_WIDTH_NS;
        // A full half-wheel ahead: the backwards scan must not wrap onto it.
        wheel.insert(task_with_deadline(5, now + (NUM_BUCKETS as u64 / 2) * BUCKET_WIDTH_NS));
        assert!(wheel.try_get_urgent(now).is_none());
        assert_eq!(wheel.len(), 1);
    }
}
