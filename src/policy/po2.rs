//! Power-of-k choices (default k = 2).
//!
//! Draw k candidates uniformly without replacement from the healthy workers and take the one
//! with the smallest load EWMA, ties broken by smaller id. O(k) per decision, and a
//! deterministic function of the PRNG state and the load vector.

use crate::state::WorkerState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct PowerOfTwo {
    num_choices: usize,
    rng: StdRng,
}

impl PowerOfTwo {
    pub fn new(seed: u64) -> Self {
        Self::with_choices(seed, 2)
    }

    pub fn with_choices(seed: u64, num_choices: usize) -> Self {
        Self {
            num_choices: num_choices.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn pick(&mut self, workers: &[WorkerState]) -> (u8, f64) {
        let healthy: Vec<usize> = workers
            .iter()
            .enumerate()
            .filter(|(_, ws)| ws.is_healthy)
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            return (0, 0.0);
        }

        // Partial Fisher–Yates over the healthy set: the first k slots end up holding
        // k distinct uniform draws.
        let mut pool = healthy;
        let k = self.num_choices.min(pool.len());
        for slot in 0..k {
            let pick = self.rng.gen_range(slot..pool.len());
            pool.swap(slot, pick);
        }

        let mut best = pool[0];
        for &candidate in &pool[1..k] {
            let (cand_load, best_load) = (workers[candidate].load_ema, workers[best].load_ema);
            if cand_load < best_load || (cand_load == best_load && candidate < best) {
                best = candidate;
            }
        }

        let confidence = (1.0 - workers[best].load_ema).clamp(0.0, 1.0);
        (workers[best].worker_id, confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests_support::workers_with_loads;

    #[test]
    fn same_seed_same_choices() {
        let workers = workers_with_loads(&[0.5, 0.1, 0.9, 0.3, 0.7]);
        let picks_a: Vec<u8> = {
            let mut p = PowerOfTwo::new(77);
            (0..100).map(|_| p.pick(&workers).0).collect()
        };
        let picks_b: Vec<u8> = {
            let mut p = PowerOfTwo::new(77);
            (0..100).map(|_| p.pick(&workers).0).collect()
        };
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn picks_lighter_of_the_candidates() {
        // Two workers: candidates are always {0, 1}, so the lighter one must win.
        let workers = workers_with_loads(&[0.9, 0.2]);
        let mut p = PowerOfTwo::new(3);
        for _ in 0..50 {
            assert_eq!(p.pick(&workers).0, 1);
        }
    }

    #[test]
    fn ties_break_toward_smaller_id() {
        let workers = workers_with_loads(&[0.4, 0.4]);
        let mut p = PowerOfTwo::new(5);
        for _ in 0..50 {
            assert_eq!(p.pick(&workers).0, 0);
        }
    }

    #[test]
    fn unhealthy_workers_are_never_candidates() {
        let mut workers = workers_with_loads(&[0.0, 0.5, 0.5]);
        workers[0].is_healthy = false;
        let mut p = PowerOfTwo::new(11);
        for _ in 0..100 {
            assert_ne!(p.pick(&workers).0, 0);
        }
    }

    #[test]
    fn confidence_reflects_chosen_load() {
        let workers = workers_with_loads(&[0.25, 0.25]);
        let mut p = PowerOfTwo::new(1);
        let (_, confidence) = p.pick(&workers);
        assert!((confidence - 0.75).abs() < 1e-9);
    }
}
