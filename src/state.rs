//! LB-side worker state.
//!
//! One `WorkerState` per statically-enumerated worker, owned by the load balancer and mutated
//! under its state lock: the dispatch path bumps the queue estimate, the response path decays it,
//! a ticker thread applies idle decay, and StateUpdate messages (when a worker pushes them)
//! overwrite the local estimate with ground truth.

use crate::clock::Timestamp;
use crate::wire::StateUpdateMsg;

/// Bins in the per-worker slack histogram; bin 0 counts expired tasks.
pub const SLACK_HISTOGRAM_BINS: usize = 32;
/// Width of one slack bin: 100 μs.
pub const SLACK_BIN_WIDTH_NS: u64 = 100_000;

/// EWMA weight for queue-length and service-time updates.
pub const EMA_ALPHA: f64 = 0.1;
/// Idle decay applied to `load_ema` on every state tick without an update.
pub const IDLE_DECAY: f64 = 0.99;

#[derive(Debug, Clone)]
pub struct WorkerState {
    pub worker_id: u8,
    pub address: String,
    pub is_healthy: bool,
    /// Relative processing capability in (0, 1]; below 1 marks a slow node.
    pub capacity_factor: f64,
    /// LB's live estimate of the worker's queue length.
    pub queue_length: u32,
    /// EWMA of the queue length (α = 0.1).
    pub load_ema: f64,
    /// EWMA of observed service time in nanoseconds (α = 0.1).
    pub avg_service_time_ns: f64,
    /// Pending-task slack distribution; zero-initialised, bin 0 = expired.
    pub slack_histogram: [u32; SLACK_HISTOGRAM_BINS],
    /// Most recent P99 estimate in nanoseconds.
    pub p99_latency_ns: f64,
    /// EWMA of the worker's deadline-miss rate.
    pub deadline_miss_rate: f64,
    pub last_update: Timestamp,
}

impl WorkerState {
    pub fn new(worker_id: u8, address: String) -> Self {
        Self {
            worker_id,
            address,
            is_healthy: true,
            capacity_factor: 1.0,
            queue_length: 0,
            load_ema: 0.0,
            avg_service_time_ns: 0.0,
            slack_histogram: [0; SLACK_HISTOGRAM_BINS],
            p99_latency_ns: 0.0,
            deadline_miss_rate: 0.0,
            last_update: 0,
        }
    }

    /// Fold a fresh queue-length observation into the load EWMA.
    pub fn update_load_ema(&mut self) {
        self.load_ema = EMA_ALPHA * self.queue_length as f64 + (1.0 - EMA_ALPHA) * self.load_ema;
    }

    /// Fold an observed service time (ns) into the service-time EWMA.
    pub fn observe_service_time(&mut self, service_ns: u64) {
        self.avg_service_time_ns =
            EMA_ALPHA * service_ns as f64 + (1.0 - EMA_ALPHA) * self.avg_service_time_ns;
    }

    /// Fold a deadline outcome into the miss-rate EWMA.
    pub fn observe_deadline(&mut self, missed: bool) {
        let sample = if missed { 1.0 } else { 0.0 };
        self.deadline_miss_rate = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * self.deadline_miss_rate;
    }

    /// Idle decay applied by the state ticker so workers regain low load scores
    /// when traffic is skewed away from them.
    pub fn tick_decay(&mut self) {
        self.load_ema *= IDLE_DECAY;
    }

    /// Overwrite the local estimate with a pushed state update.
    pub fn apply_update(&mut self, msg: &StateUpdateMsg, now: Timestamp) {
        self.queue_length = msg.queue_length as u32;
        self.load_ema = msg.load_ema as f64;
        self.is_healthy = msg.is_healthy != 0;
        self.slack_histogram = msg.slack_histogram;
        self.last_update = now;
    }

    /// Pending tasks in the first `bins` slack bins (the most urgent work).
    pub fn urgent_tasks(&self, bins: usize) -> u32 {
        self.slack_histogram
            .iter()
            .take(bins)
            .copied()
            .sum()
    }
}

/// Bin index for a slack value: negative slack lands in bin 0, everything else
/// in `slack / width + 1`, saturating at the last bin.
pub fn slack_bin(slack_ns: i64) -> usize {
    if slack_ns <= 0 {
        0
    } else {
        ((slack_ns as u64 / SLACK_BIN_WIDTH_NS) as usize + 1).min(SLACK_HISTOGRAM_BINS - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_ema_follows_queue() {
        let mut ws = WorkerState::new(0, "10.10.1.4:31850".into());
        ws.queue_length = 10;
        ws.update_load_ema();
        assert!((ws.load_ema - 1.0).abs() < 1e-9);
        ws.update_load_ema();
        assert!((ws.load_ema - 1.9).abs() < 1e-9);
    }

    #[test]
    fn tick_decay_shrinks_idle_load() {
        let mut ws = WorkerState::new(0, String::new());
        ws.load_ema = 10.0;
        for _ in 0..100 {
            ws.tick_decay();
        }
        assert!(ws.load_ema < 10.0 * 0.99f64.powi(99));
    }

    #[test]
    fn slack_bins_cover_the_range() {
        assert_eq!(slack_bin(-5), 0);
        assert_eq!(slack_bin(0), 0);
        assert_eq!(slack_bin(1), 1);
        assert_eq!(slack_bin(SLACK_BIN_WIDTH_NS as i64), 2);
        assert_eq!(slack_bin(i64::MAX), SLACK_HISTOGRAM_BINS - 1);
    }

    #[test]
    fn state_update_overwrites_estimates() {
        let mut ws = WorkerState::new(1, String::new());
        ws.queue_length = 3;
        let mut slack_histogram = [0u32; SLACK_HISTOGRAM_BINS];
        slack_histogram[2] = 8;
        let msg = StateUpdateMsg {
            queue_length: 7,
            active_requests: 2,
            completed_requests: 100,
            load_ema: 6.5,
            worker_id: 1,
            is_healthy: 1,
            slack_histogram,
        };
        ws.apply_update(&msg, 42);
        assert_eq!(ws.queue_length, 7);
        assert!((ws.load_ema - 6.5).abs() < 1e-6);
        assert_eq!(ws.slack_histogram[2], 8);
        assert_eq!(ws.last_update, 42);
        assert_eq!(ws.urgent_tasks(4), 8);
    }
}
