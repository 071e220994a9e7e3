//! Heavy-tailed workload generation.
//!
//! The generator produces a lazy, infinite sequence of deadline-carrying requests whose service
//! times follow one of four distributions. Pareto with shape α ≤ 2 has infinite population
//! variance, which is the regime that separates variance-minimising dispatch from tail-aware
//! dispatch. Given the same seed and config, the exact same sequence of
//! (type, service_us, deadline offset, payload) is produced; each sender thread owns its own
//! generator seeded `base + thread_index` so two threads never draw correlated samples.

use crate::clock::{now_ns, us_to_ns, Timestamp};
use crate::request::{Request, RequestType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Service-time distribution selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    /// Pareto(α, x_min); α ≤ 2 has infinite variance, α ≤ 1 infinite mean.
    Pareto { alpha: f64, x_min: f64 },
    /// Lognormal(μ, σ) on the log scale.
    Lognormal { mu: f64, sigma: f64 },
    /// Mixture of a tight normal around `light_mean` (probability `p_light`) and
    /// a wider normal around `heavy_mean`.
    Bimodal {
        p_light: f64,
        light_mean: f64,
        heavy_mean: f64,
    },
    /// Uniform over [x_min, 2·x_min).
    Uniform { x_min: f64 },
}

impl Distribution {
    /// Theoretical mean of the Pareto member; infinite when α ≤ 1.
    pub fn pareto_mean(alpha: f64, x_min: f64) -> f64 {
        if alpha <= 1.0 {
            f64::INFINITY
        } else {
            alpha * x_min / (alpha - 1.0)
        }
    }

    /// Theoretical variance of the Pareto member; infinite when α ≤ 2.
    pub fn pareto_variance(alpha: f64, x_min: f64) -> f64 {
        if alpha <= 2.0 {
            f64::INFINITY
        } else {
            x_min * x_min * alpha / ((alpha - 1.0) * (alpha - 1.0) * (alpha - 2.0))
        }
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        match *self {
            Distribution::Pareto { alpha, x_min } => {
                // Inverse-CDF sampling: x = x_min / u^(1/α), u in (0, 1].
                let u: f64 = 1.0 - rng.gen::<f64>();
                x_min / u.powf(1.0 / alpha)
            }
            Distribution::Lognormal { mu, sigma } => {
                (mu + sigma * sample_standard_normal(rng)).exp()
            }
            Distribution::Bimodal {
                p_light,
                light_mean,
                heavy_mean,
            } => {
                let (mean, sd) = if rng.gen::<f64>() < p_light {
                    (light_mean, light_mean * 0.1)
                } else {
                    (heavy_mean, heavy_mean * 0.2)
                };
                (mean + sd * sample_standard_normal(rng)).max(1.0)
            }
            Distribution::Uniform { x_min } => x_min * (1.0 + rng.gen::<f64>()),
        }
    }
}

/// Box–Muller transform; two uniforms in, one standard normal out.
fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Generator parameters.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub distribution: Distribution,
    /// Floor applied to every sampled service time (μs).
    pub service_time_min_us: f64,
    /// deadline = send + service_us · multiplier, unless `fixed_deadline_us` > 0.
    pub deadline_multiplier: f64,
    /// Fixed deadline offset in μs; 0 selects the multiplier.
    pub fixed_deadline_us: u64,
    pub p_get: f64,
    pub p_put: f64,
    pub p_scan: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            distribution: Distribution::Pareto {
                alpha: 1.2,
                x_min: 10.0,
            },
            service_time_min_us: 10.0,
            deadline_multiplier: 5.0,
            fixed_deadline_us: 0,
            p_get: 0.7,
            p_put: 0.2,
            p_scan: 0.05,
        }
    }
}

/// Seeded request generator; one instance per sender thread.
pub struct RequestGenerator {
    config: WorkloadConfig,
    rng: StdRng,
    client_id: u8,
    next_id: u64,
}

impl RequestGenerator {
    pub fn new(config: WorkloadConfig, client_id: u8, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            client_id,
            next_id: 0,
        }
    }

    /// Draw the next request, stamping the current clock as its send time.
    pub fn generate(&mut self) -> Request {
        self.generate_at(now_ns())
    }

    /// Draw the next request against an explicit send timestamp.
    ///
    /// The drawn (type, service, deadline offset, payload) tuple depends only on the seed and
    /// config, never on the timestamp, which is what makes replays reproducible.
    pub fn generate_at(&mut self, send_time: Timestamp) -> Request {
        let request_type = self.draw_type();
        let service_us = self
            .config
            .distribution
            .sample(&mut self.rng)
            .max(self.config.service_time_min_us);
        let deadline_offset_ns = if self.config.fixed_deadline_us > 0 {
            us_to_ns(self.config.fixed_deadline_us)
        } else {
            us_to_ns((service_us * self.config.deadline_multiplier) as u64).max(1)
        };
        let payload_size = 64 + self.rng.gen_range(0u16..256);

        let request = Request {
            request_id: self.next_id,
            client_send_time: send_time,
            deadline: send_time + deadline_offset_ns,
            service_time_hint_us: service_us as u32,
            request_type,
            client_id: self.client_id,
            payload_size,
        };
        self.next_id += 1;
        request
    }

    fn draw_type(&mut self) -> RequestType {
        let r: f64 = self.rng.gen();
        let c = &self.config;
        if r < c.p_get {
            RequestType::Get
        } else if r < c.p_get + c.p_put {
            RequestType::Put
        } else if r < c.p_get + c.p_put + c.p_scan {
            RequestType::Scan
        } else {
            RequestType::Compute
        }
    }
}
