//! Dispatch policies.
//!
//! The three policies form a closed set, so they live behind a sum type rather than boxed trait
//! objects; the LB owns the policy and calls it with the state lock held, which also serialises
//! `schedule` against `on_request_complete` by construction.

pub mod malcolm;
pub mod malcolm_strict;
pub mod po2;

pub use malcolm::Malcolm;
pub use malcolm_strict::{MalcolmStrict, QuantileOracle};
pub use po2::PowerOfTwo;

use crate::clock::{now_ns, Timestamp};
use crate::error::Error;
use crate::request::{Request, RequestTrace};
use crate::state::WorkerState;
use std::fmt;
use std::str::FromStr;

/// Outcome of one scheduling decision.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub target_worker_id: u8,
    /// Policy self-assessment in [0, 1]; diagnostic only.
    pub confidence: f64,
    /// Wall time the decision took, recorded by the policy itself.
    pub decision_time_ns: u64,
}

/// Algorithm selector parsed from `--algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Po2,
    Malcolm,
    MalcolmStrict,
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "po2" | "power-of-2" | "power_of_2" => Ok(Algorithm::Po2),
            "malcolm" => Ok(Algorithm::Malcolm),
            "malcolm_strict" | "malcolm-strict" | "strict" => Ok(Algorithm::MalcolmStrict),
            other => Err(Error::Config(format!("unknown algorithm '{other}'"))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Algorithm::Po2 => "po2",
            Algorithm::Malcolm => "malcolm",
            Algorithm::MalcolmStrict => "malcolm_strict",
        };
        write!(f, "{label}")
    }
}

/// The LB's dispatch policy: one of the three algorithms under comparison.
pub enum DispatchPolicy {
    Po2(PowerOfTwo),
    Malcolm(Malcolm),
    MalcolmStrict(MalcolmStrict),
}

impl DispatchPolicy {
    pub fn new(algorithm: Algorithm, seed: u64, model_path: Option<&str>) -> Self {
        match algorithm {
            Algorithm::Po2 => DispatchPolicy::Po2(PowerOfTwo::new(seed)),
            Algorithm::Malcolm => DispatchPolicy::Malcolm(Malcolm::new()),
            Algorithm::MalcolmStrict => {
                DispatchPolicy::MalcolmStrict(MalcolmStrict::new(model_path))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchPolicy::Po2(_) => "Power-of-2",
            DispatchPolicy::Malcolm(_) => "Malcolm",
            DispatchPolicy::MalcolmStrict(_) => "Malcolm-Strict",
        }
    }

    /// Pick a target worker from a consistent snapshot of worker state.
    ///
    /// Completes in time independent of the in-flight request count and stamps
    /// its own `decision_time_ns`.
    pub fn schedule(&mut self, request: &Request, workers: &[WorkerState]) -> Decision {
        let start = now_ns();
        self.schedule_at(start, request, workers, start)
    }

    /// Deterministic entry point with an explicit clock, shared by tests.
    pub fn schedule_at(
        &mut self,
        now: Timestamp,
        request: &Request,
        workers: &[WorkerState],
        started: Timestamp,
    ) -> Decision {
        let (target_worker_id, confidence) = if workers.is_empty() {
            (0, 0.0)
        } else {
            match self {
                DispatchPolicy::Po2(p) => p.pick(workers),
                DispatchPolicy::Malcolm(p) => p.pick(workers),
                DispatchPolicy::MalcolmStrict(p) => p.pick(now, request, workers),
            }
        };
        Decision {
            target_worker_id,
            confidence: confidence.clamp(0.0, 1.0),
            decision_time_ns: now_ns().saturating_sub(started),
        }
    }

    /// Feedback hook invoked by the LB after every completed request.
    ///
    /// Po2 and Malcolm ignore it; Malcolm-Strict folds the trace into its
    /// observation state. Callers hold the policy exclusively, which serialises
    /// this against `schedule`.
    pub fn on_request_complete(&mut self, trace: &RequestTrace) {
        if let DispatchPolicy::MalcolmStrict(p) = self {
            p.on_request_complete(trace);
        }
    }
}
