//! Malcolm-Strict: distributional, CVaR-shaped dispatch.
//!
//! The policy scores every healthy worker by the conditional value at risk of its predicted
//! latency distribution plus a log-barrier deadline penalty, then routes to the argmin. The
//! latency distribution comes from an opaque quantile oracle (an IQN network when one is
//! loaded); without a model the risk heuristic below stands in. The slack-time histogram in the
//! worker state is the feature that lets either path see how much urgent work a worker is
//! already committed to.

use crate::clock::Timestamp;
use crate::request::{Request, RequestTrace};
use crate::state::{WorkerState, SLACK_HISTOGRAM_BINS};
use log::warn;

/// Quantile sample count M handed to the oracle.
pub const NUM_QUANTILE_SAMPLES: usize = 32;
/// Risk level: optimise the mean of the worst 5%.
pub const DEFAULT_CVAR_ALPHA: f64 = 0.95;
const EPS: f64 = 1e-6;

/// Opaque scoring oracle.
///
/// Receives the flattened state vector and the fixed quantile sample set τ, and returns one
/// M-vector of predicted latency quantiles (nanoseconds) per worker. Implementations must be
/// deterministic for a given input; inference cost bounds the decision latency.
pub trait QuantileOracle: Send {
    fn score(&mut self, state: &[f32], taus: &[f32], num_workers: usize) -> Vec<Vec<f64>>;
}

/// VaR / CVaR / mean extracted from one worker's quantile vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvarEstimate {
    pub var: f64,
    pub cvar: f64,
    pub expected: f64,
}

/// Compute VaR, CVaR and the mean from an unordered quantile sample vector.
pub fn compute_cvar(quantiles: &[f64], alpha: f64) -> CvarEstimate {
    let mut sorted = quantiles.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let m = sorted.len();
    let expected = sorted.iter().sum::<f64>() / m as f64;
    let var_idx = ((alpha * m as f64) as usize).min(m - 1);
    let var = sorted[var_idx];
    let tail = &sorted[var_idx..];
    let cvar = tail.iter().sum::<f64>() / tail.len() as f64;
    CvarEstimate {
        var,
        cvar,
        expected,
    }
}

/// Log-barrier deadline penalty given remaining slack `s` and a CVaR-scale latency estimate.
///
/// Expired requests get a flat 1e9; inside one CVaR of the deadline the barrier climbs
/// steeply; between one and two CVaRs it ramps linearly; beyond that it vanishes.
pub fn deadline_penalty(cvar: f64, slack_ns: i64) -> f64 {
    if slack_ns <= 0 {
        return 1e9;
    }
    let ratio = slack_ns as f64 / (cvar + EPS);
    if ratio <= 1.0 {
        -1e6 * (ratio + 1e-9).ln()
    } else if ratio <= 2.0 {
        1e3 * (2.0 - ratio)
    } else {
        0.0
    }
}

/// Fixed quantile sample set with tail oversampling: the first ⌊0.8·M⌋ samples walk the body
/// evenly below 0.9 and the last ⌊0.2·M⌋ are evenly spaced across (0.9, 1.0), so the oracle is
/// always queried densely where the tail lives.
pub fn generate_quantile_samples() -> Vec<f32> {
    let m = NUM_QUANTILE_SAMPLES as f64;
    (0..NUM_QUANTILE_SAMPLES)
        .map(|i| {
            if (i as f64) < m * 0.8 {
                ((i + 1) as f64 / (m + 1.0)) as f32
            } else {
                (0.9 + 0.1 * (i as f64 - m * 0.8) / (m * 0.2)) as f32
            }
        })
        .collect()
}

pub struct MalcolmStrict {
    cvar_alpha: f64,
    taus: Vec<f32>,
    oracle: Option<Box<dyn QuantileOracle>>,
    /// Per-worker observed E2E latency EWMA fed by the completion hook.
    observed_latency_ns: Vec<f64>,
    completed: u64,
}

impl MalcolmStrict {
    pub fn new(model_path: Option<&str>) -> Self {
        if let Some(path) = model_path {
            // No in-process IQN runtime is wired in; the heuristic carries the policy.
            warn!("malcolm-strict: model '{path}' not loadable in this build, using heuristic");
        }
        Self::with_oracle(None)
    }

    pub fn with_oracle(oracle: Option<Box<dyn QuantileOracle>>) -> Self {
        Self {
            cvar_alpha: DEFAULT_CVAR_ALPHA,
            taus: generate_quantile_samples(),
            oracle,
            observed_latency_ns: Vec::new(),
            completed: 0,
        }
    }

    pub fn taus(&self) -> &[f32] {
        &self.taus
    }

    pub fn pick(&mut self, now: Timestamp, request: &Request, workers: &[WorkerState]) -> (u8, f64) {
        if self.oracle.is_some() {
            self.pick_with_oracle(now, request, workers)
        } else {
            self.pick_heuristic(now, request, workers)
        }
    }

    /// Flatten request features, per-worker features and the scaled slack histogram into the
    /// oracle's state vector.
    pub fn build_state_vector(
        now: Timestamp,
        request: &Request,
        workers: &[WorkerState],
    ) -> Vec<f32> {
        let mut state = Vec::with_capacity(4 + workers.len() * (7 + SLACK_HISTOGRAM_BINS));
        state.push(request.request_type.index() as f32);
        state.push(request.payload_size as f32 / 1_000.0);
        state.push(request.service_time_hint_us as f32 / 100.0);
        state.push(request.slack(now) as f32 / 1e6); // milliseconds
        for ws in workers {
            state.push(ws.load_ema as f32);
            state.push(ws.queue_length as f32 / 100.0);
            state.push(ws.capacity_factor as f32);
            state.push(ws.avg_service_time_ns as f32 / 1e6);
            state.push(ws.p99_latency_ns as f32 / 1e6);
            state.push(ws.deadline_miss_rate as f32);
            state.push(if ws.is_healthy { 1.0 } else { 0.0 });
            for bin in &ws.slack_histogram {
                state.push(*bin as f32 / 100.0);
            }
        }
        state
    }

    fn pick_with_oracle(
        &mut self,
        now: Timestamp,
        request: &Request,
        workers: &[WorkerState],
    ) -> (u8, f64) {
        let state = Self::build_state_vector(now, request, workers);
        let quantiles = self
            .oracle
            .as_mut()
            .expect("oracle presence checked by caller")
            .score(&state, &self.taus, workers.len());

        let slack = request.slack(now);
        let mut best: Option<(usize, f64)> = None;
        for (i, ws) in workers.iter().enumerate() {
            if !ws.is_healthy {
                continue;
            }
            let estimate = compute_cvar(&quantiles[i], self.cvar_alpha);
            let score = estimate.cvar + deadline_penalty(estimate.cvar, slack);
            match best {
                None => best = Some((i, score)),
                Some((_, best_score)) if score < best_score => best = Some((i, score)),
                _ => {}
            }
        }
        let Some((chosen, min_score)) = best else {
            return (0, 0.0);
        };
        let confidence = 1.0 / (1.0 + min_score.max(0.0) / 1e6);
        (workers[chosen].worker_id, confidence)
    }

    /// Model-free risk scoring. A pure function of its inputs, so identical state always
    /// produces the identical decision.
    fn pick_heuristic(
        &mut self,
        now: Timestamp,
        request: &Request,
        workers: &[WorkerState],
    ) -> (u8, f64) {
        let slack = request.slack(now);
        let mut best: Option<(usize, f64)> = None;
        for (i, ws) in workers.iter().enumerate() {
            if !ws.is_healthy {
                continue;
            }
            let mut risk = ws.queue_length as f64 * 100.0 + ws.p99_latency_ns / 1_000.0;
            risk *= 2.0 - ws.capacity_factor;
            risk += ws.urgent_tasks(4) as f64 * 500.0;
            // The queue-depth-scaled service estimate stands in for CVaR in the barrier.
            let expected_latency = ws.avg_service_time_ns * (1.0 + ws.queue_length as f64);
            risk += deadline_penalty(expected_latency, slack);
            match best {
                None => best = Some((i, risk)),
                Some((_, best_risk)) if risk < best_risk => best = Some((i, risk)),
                _ => {}
            }
        }
        let Some((chosen, min_risk)) = best else {
            return (0, 0.0);
        };
        let confidence = 1.0 / (1.0 + min_risk.max(0.0) / 1e6);
        (workers[chosen].worker_id, confidence)
    }

    /// Completion feedback. Online learning is out of scope; the hook keeps the
    /// per-worker observation EWMA a future learner would consume.
    pub fn on_request_complete(&mut self, trace: &RequestTrace) {
        let idx = trace.target_worker_id as usize;
        if self.observed_latency_ns.len() <= idx {
            self.observed_latency_ns.resize(idx + 1, 0.0);
        }
        let observed = trace.e2e_latency_ns() as f64;
        self.observed_latency_ns[idx] = 0.1 * observed + 0.9 * self.observed_latency_ns[idx];
        self.completed += 1;
    }

    pub fn completed_observations(&self) -> u64 {
        self.completed
    }

    pub fn observed_latency_ns(&self, worker_id: usize) -> f64 {
        self.observed_latency_ns
            .get(worker_id)
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests_support::{request_with_deadline, workers_with_loads};

    /// Oracle returning fixed quantiles per worker, for exercising the CVaR path.
    struct FixedOracle {
        per_worker: Vec<Vec<f64>>,
    }

    impl QuantileOracle for FixedOracle {
        fn score(&mut self, _state: &[f32], _taus: &[f32], num_workers: usize) -> Vec<Vec<f64>> {
            assert_eq!(num_workers, self.per_worker.len());
            self.per_worker.clone()
        }
    }

    #[test]
    fn tau_samples_oversample_the_tail() {
        let taus = generate_quantile_samples();
        assert_eq!(taus.len(), NUM_QUANTILE_SAMPLES);
        let body = &taus[..(NUM_QUANTILE_SAMPLES as f64 * 0.8) as usize];
        let tail = &taus[(NUM_QUANTILE_SAMPLES as f64 * 0.8) as usize..];
        assert!(body.iter().all(|&t| t > 0.0 && t < 0.9));
        assert!(tail.iter().all(|&t| (0.9..1.0).contains(&t)));
        assert!(taus.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn cvar_on_known_quantiles() {
        // 0..32 → VaR at index ⌊0.95·32⌋ = 30, CVaR = mean(30, 31) = 30.5.
        let quantiles: Vec<f64> = (0..32).map(|i| i as f64).collect();
        let estimate = compute_cvar(&quantiles, 0.95);
        assert_eq!(estimate.var, 30.0);
        assert!((estimate.cvar - 30.5).abs() < 1e-9);
        assert!((estimate.expected - 15.5).abs() < 1e-9);
    }

    #[test]
    fn penalty_is_piecewise_as_specified() {
        assert_eq!(deadline_penalty(1_000.0, 0), 1e9);
        assert_eq!(deadline_penalty(1_000.0, -5), 1e9);
        // ratio 0.5 → steep log barrier.
        let steep = deadline_penalty(1_000.0, 500);
        assert!(steep > 0.0 && steep > deadline_penalty(1_000.0, 999));
        // ratio 1.5 → linear warning band.
        let warned = deadline_penalty(1_000.0, 1_500);
        assert!((warned - 500.0).abs() < 1.0);
        // ratio > 2 → free.
        assert_eq!(deadline_penalty(1_000.0, 5_000), 0.0);
    }

    #[test]
    fn oracle_path_routes_away_from_fat_tails() {
        // Worker 0 has a far worse tail despite the same mean-ish body.
        let per_worker = vec![
            (0..32).map(|i| 1_000.0 + (i as f64).powi(3)).collect(),
            (0..32).map(|i| 1_200.0 + 10.0 * i as f64).collect(),
        ];
        let mut policy = MalcolmStrict::with_oracle(Some(Box::new(FixedOracle { per_worker })));
        let workers = workers_with_loads(&[0.5, 0.5]);
        let request = request_with_deadline(u64::MAX / 2);
        let (chosen, confidence) = policy.pick(1_000, &request, &workers);
        assert_eq!(chosen, 1);
        assert!((0.0..=1.0).contains(&confidence));
    }

    #[test]
    fn all_expired_slack_still_picks_a_worker() {
        let workers = workers_with_loads(&[1.0, 2.0, 3.0]);
        let request = request_with_deadline(10);
        let mut policy = MalcolmStrict::new(None);
        // now is far past every deadline, so every barrier saturates at 1e9.
        let (chosen, confidence) = policy.pick(1_000_000, &request, &workers);
        assert!((chosen as usize) < workers.len());
        assert!((0.0..=1.0).contains(&confidence));
    }

    #[test]
    fn heuristic_is_deterministic() {
        let mut workers = workers_with_loads(&[0.5, 1.5, 0.2]);
        workers[1].queue_length = 9;
        workers[2].capacity_factor = 0.2;
        workers[0].slack_histogram[1] = 12;
        let request = request_with_deadline(5_000_000);
        let mut a = MalcolmStrict::new(None);
        let mut b = MalcolmStrict::new(None);
        for _ in 0..20 {
            assert_eq!(a.pick(1_000, &request, &workers), b.pick(1_000, &request, &workers));
        }
    }

    #[test]
    fn heuristic_penalises_urgent_backlog() {
        let mut workers = workers_with_loads(&[0.0, 0.0]);
        // Same queue depth, but worker 0 is sitting on urgent (near-expiry) tasks.
        workers[0].slack_histogram[0] = 10;
        workers[0].slack_histogram[2] = 10;
        let request = request_with_deadline(u64::MAX / 2);
        let mut policy = MalcolmStrict::new(None);
        let (chosen, _) = policy.pick(1_000, &request, &workers);
        assert_eq!(chosen, 1);
    }

    #[test]
    fn heuristic_avoids_low_capacity_nodes() {
        let mut workers = workers_with_loads(&[0.0, 0.0]);
        workers[0].capacity_factor = 0.2;
        workers[0].queue_length = 2;
        workers[1].queue_length = 2;
        let request = request_with_deadline(u64::MAX / 2);
        let mut policy = MalcolmStrict::new(None);
        let (chosen, _) = policy.pick(1_000, &request, &workers);
        assert_eq!(chosen, 1);
    }

    #[test]
    fn completion_hook_accumulates_observations() {
        let mut policy = MalcolmStrict::new(None);
        let trace = RequestTrace {
            request_id: 1,
            deadline: 10_000,
            t1_client_send: 0,
            t7_client_recv: 5_000,
            target_worker_id: 3,
            ..RequestTrace::default()
        };
        policy.on_request_complete(&trace);
        policy.on_request_complete(&trace);
        assert_eq!(policy.completed_observations(), 2);
        assert!(policy.observed_latency_ns(3) > 0.0);
        assert_eq!(policy.observed_latency_ns(0), 0.0);
    }

    #[test]
    fn state_vector_layout_matches_feature_count() {
        let workers = workers_with_loads(&[0.1, 0.2, 0.3]);
        let request = request_with_deadline(1_000_000);
        let state = MalcolmStrict::build_state_vector(500, &request, &workers);
        assert_eq!(state.len(), 4 + 3 * (7 + SLACK_HISTOGRAM_BINS));
    }
}
