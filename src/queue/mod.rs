//! Per-worker admission queues.
//!
//! Three interchangeable disciplines behind one sum type: a locked FIFO for the FCFS baselines,
//! a deadline min-heap for exact EDF, and a hierarchical timing wheel for approximate EDF at
//! high throughput. The EDF variants additionally expose a slack-time histogram that feeds the
//! load balancer's risk-aware state vector.

pub mod edf_heap;
pub mod fcfs;
pub mod spsc;
pub mod timing_wheel;

pub use edf_heap::EdfHeap;
pub use fcfs::FcfsQueue;
pub use spsc::SpscRing;
pub use timing_wheel::TimingWheel;

use crate::clock::{slack_ns, Timestamp};
use crate::request::Task;
use crate::state::{slack_bin, SLACK_HISTOGRAM_BINS};

/// Local scheduling discipline selected per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDiscipline {
    Fcfs,
    EdfHeap,
    TimingWheel,
}

/// The worker's admission queue: push from the I/O thread, pop from the compute pool.
pub enum TaskQueue {
    Fcfs(FcfsQueue),
    EdfHeap(EdfHeap),
    TimingWheel(TimingWheel),
}

impl TaskQueue {
    pub fn new(discipline: QueueDiscipline) -> Self {
        match discipline {
            QueueDiscipline::Fcfs => TaskQueue::Fcfs(FcfsQueue::new()),
            QueueDiscipline::EdfHeap => TaskQueue::EdfHeap(EdfHeap::new()),
            QueueDiscipline::TimingWheel => TaskQueue::TimingWheel(TimingWheel::new()),
        }
    }

    pub fn discipline(&self) -> QueueDiscipline {
        match self {
            TaskQueue::Fcfs(_) => QueueDiscipline::Fcfs,
            TaskQueue::EdfHeap(_) => QueueDiscipline::EdfHeap,
            TaskQueue::TimingWheel(_) => QueueDiscipline::TimingWheel,
        }
    }

    /// Whether this discipline orders by deadline and therefore emits a slack histogram.
    pub fn is_deadline_aware(&self) -> bool {
        !matches!(self, TaskQueue::Fcfs(_))
    }

    pub fn push(&self, task: Task) {
        match self {
            TaskQueue::Fcfs(q) => q.push(task),
            TaskQueue::EdfHeap(q) => q.push(task),
            TaskQueue::TimingWheel(q) => q.insert(task),
        }
    }

    pub fn try_pop(&self) -> Option<Task> {
        match self {
            TaskQueue::Fcfs(q) => q.try_pop(),
            TaskQueue::EdfHeap(q) => q.try_pop(),
            TaskQueue::TimingWheel(q) => q.try_pop(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskQueue::Fcfs(q) => q.len(),
            TaskQueue::EdfHeap(q) => q.len(),
            TaskQueue::TimingWheel(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the slack distribution of all pending tasks at `now`.
    ///
    /// Bin 0 counts already-expired tasks; bin `i ≥ 1` counts tasks with slack in
    /// `[(i−1)·W, i·W)`, saturating at the last bin. FCFS queues report all zeros,
    /// matching their contract of not tracking deadlines.
    pub fn slack_histogram(&self, now: Timestamp) -> [u32; SLACK_HISTOGRAM_BINS] {
        let mut hist = [0u32; SLACK_HISTOGRAM_BINS];
        let mut record = |deadline: Timestamp| {
            hist[slack_bin(slack_ns(deadline, now))] += 1;
        };
        match self {
            TaskQueue::Fcfs(_) => {}
            TaskQueue::EdfHeap(q) => q.for_each_deadline(&mut record),
            TaskQueue::TimingWheel(q) => q.for_each_deadline(&mut record),
        }
        hist
    }
}
