//! Original Malcolm: Nash-equilibrium load-variance minimisation.
//!
//! Each request goes to the worker whose hypothetical +1 load unit increases the fleet's
//! squared deviation from the mean the least. This chases mean-load equality, which is exactly
//! the behaviour that backfires under heavy-tailed service times: equal queue lengths are not
//! equal tail latencies. It is the baseline the risk-aware policy is measured against.

use crate::state::WorkerState;

pub struct Malcolm;

impl Malcolm {
    pub fn new() -> Self {
        Malcolm
    }

    pub fn pick(&mut self, workers: &[WorkerState]) -> (u8, f64) {
        let n = workers.len() as f64;
        let loads: Vec<f64> = workers.iter().map(|ws| ws.load_ema).collect();
        let mean = loads.iter().sum::<f64>() / n;

        // Marginal change in squared deviation from adding one unit of load to worker i.
        let mut best: Option<(usize, f64)> = None;
        for (i, ws) in workers.iter().enumerate() {
            if !ws.is_healthy {
                continue;
            }
            let old = loads[i] - mean;
            let new = loads[i] + 1.0 - mean;
            let delta = new * new - old * old;
            match best {
                None => best = Some((i, delta)),
                Some((_, best_delta)) if delta < best_delta => best = Some((i, delta)),
                _ => {}
            }
        }
        let Some((chosen, _)) = best else {
            return (0, 0.0);
        };

        let variance = loads.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>() / n;
        let confidence = (-variance).exp();
        (workers[chosen].worker_id, confidence)
    }
}

impl Default for Malcolm {
    fn default() -> Self {
        Self::new()
    }
}
