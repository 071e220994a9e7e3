//! Command-line surfaces for the three binaries.
//!
//! Parsing failures (missing or malformed flags) exit with code 1; transport initialisation
//! failures exit with code 2; clean shutdown exits 0.

use crate::error::Error;
use crate::policy::Algorithm;
use crate::queue::QueueDiscipline;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code for configuration problems.
pub const EXIT_BAD_ARGS: u8 = 1;
/// Exit code for transport initialisation failures.
pub const EXIT_TRANSPORT: u8 = 2;

/// Experiment subnet prefix used for local interface selection.
pub const DEFAULT_SUBNET_PREFIX: &str = "10.10.1.";
/// Base port for LB endpoints; clients and workers derive theirs from their id.
pub const DEFAULT_PORT: u16 = 31850;

/// Load-generating client.
#[derive(Debug, Parser)]
#[command(name = "client", about = "Deadline-carrying load generator")]
pub struct ClientArgs {
    /// Client id; also offsets the local port and the workload seed.
    #[arg(long, default_value_t = 0)]
    pub id: u8,

    /// Load balancer address (ip:port).
    #[arg(long = "lb")]
    pub lb_address: String,

    /// Generator threads (each gets a disjoint seed).
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Aggregate target request rate.
    #[arg(long = "target_rps", default_value_t = 100_000)]
    pub target_rps: u64,

    /// Measured duration in seconds.
    #[arg(long, default_value_t = 60)]
    pub duration: u64,

    /// Warm-up seconds before metrics reset.
    #[arg(long, default_value_t = 10)]
    pub warmup: u64,

    /// Pareto shape parameter for the service-time distribution.
    #[arg(long = "pareto_alpha", default_value_t = 1.2)]
    pub pareto_alpha: f64,

    /// Minimum service time in microseconds.
    #[arg(long = "service_min", default_value_t = 10.0)]
    pub service_min: f64,

    /// Deadline multiplier over the sampled service time.
    #[arg(long = "deadline_multiplier", default_value_t = 5.0)]
    pub deadline_multiplier: f64,

    /// Expected probability of landing on a slow worker (reporting only).
    #[arg(long = "slow_prob", default_value_t = 0.0)]
    pub slow_prob: f64,

    /// Output directory for histograms and summaries.
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    /// Subnet prefix for local interface selection.
    #[arg(long, default_value = DEFAULT_SUBNET_PREFIX)]
    pub subnet: String,
}

/// Load balancer.
#[derive(Debug, Parser)]
#[command(name = "lb", about = "Dispatching load balancer")]
pub struct LbArgs {
    /// Listen port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Comma-separated worker addresses (ip:port,...).
    #[arg(long, value_delimiter = ',', required = true)]
    pub workers: Vec<String>,

    /// Dispatch algorithm: po2 | malcolm | malcolm_strict.
    #[arg(long, default_value = "po2")]
    pub algorithm: String,

    /// Path to a quantile-model file for malcolm_strict.
    #[arg(long)]
    pub model: Option<String>,

    /// Reserved for multi-endpoint scaling; the event loop itself is single-threaded.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Output directory for histograms and summaries.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Subnet prefix for local interface selection.
    #[arg(long, default_value = DEFAULT_SUBNET_PREFIX)]
    pub subnet: String,
}

impl LbArgs {
    pub fn algorithm(&self) -> Result<Algorithm, Error> {
        self.algorithm.parse()
    }
}

/// Worker node.
#[derive(Debug, Parser)]
#[command(name = "worker", about = "Request-executing worker")]
pub struct WorkerArgs {
    /// Worker id; also offsets the local port.
    #[arg(long, default_value_t = 0)]
    pub id: u8,

    /// Listen port (defaults to the base port plus the worker id).
    #[arg(long)]
    pub port: Option<u16>,

    /// Compute threads.
    #[arg(long, default_value_t = 2)]
    pub threads: usize,

    /// fast: full capacity, no injected delay; slow: capacity 0.2 plus 500 μs delay.
    #[arg(long, default_value = "fast")]
    pub mode: String,

    /// Local scheduling discipline: fcfs | edf | wheel.
    #[arg(long, default_value = "fcfs")]
    pub scheduler: String,

    /// Capacity factor override in (0, 1].
    #[arg(long)]
    pub capacity: Option<f64>,

    /// Output directory for histograms and summaries.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Subnet prefix for local interface selection.
    #[arg(long, default_value = DEFAULT_SUBNET_PREFIX)]
    pub subnet: String,
}

impl WorkerArgs {
    pub fn discipline(&self) -> Result<QueueDiscipline, Error> {
        match self.scheduler.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(QueueDiscipline::Fcfs),
            "edf" => Ok(QueueDiscipline::EdfHeap),
            "wheel" | "timing_wheel" => Ok(QueueDiscipline::TimingWheel),
            other => Err(Error::Config(format!("unknown scheduler '{other}'"))),
        }
    }

    /// Capacity factor and artificial delay derived from `--mode`, with `--capacity`
    /// taking precedence over the mode default.
    pub fn heterogeneity(&self) -> Result<(f64, u64), Error> {
        let (mode_capacity, delay_ns) = match self.mode.to_ascii_lowercase().as_str() {
            "fast" => (1.0, 0),
            "slow" => (0.2, 500_000),
            other => return Err(Error::Config(format!("unknown mode '{other}'"))),
        };
        let capacity = self.capacity.unwrap_or(mode_capacity);
        if capacity <= 0.0 || capacity > 1.0 {
            return Err(Error::Config(format!(
                "capacity factor {capacity} outside (0, 1]"
            )));
        }
        Ok((capacity, delay_ns))
    }

    pub fn listen_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT + 1 + self.id as u16)
    }
}

/// Parse arguments for a binary, mapping clap failures to exit code 1.
pub fn parse_or_exit<A: Parser>() -> Result<A, ExitCode> {
    match A::try_parse() {
        Ok(args) => Ok(args),
        Err(err) => {
            // Help and version requests are not configuration errors.
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_BAD_ARGS,
            };
            let _ = err.print();
            Err(ExitCode::from(code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lb_args_parse_worker_list() {
        let args = LbArgs::parse_from([
            "lb",
            "--workers",
            "10.10.1.4:31851,10.10.1.5:31852",
            "--algorithm",
            "malcolm_strict",
        ]);
        assert_eq!(args.workers.len(), 2);
        assert_eq!(args.algorithm().unwrap(), Algorithm::MalcolmStrict);
    }

    #[test]
    fn lb_args_require_workers() {
        assert!(LbArgs::try_parse_from(["lb"]).is_err());
    }

    #[test]
    fn worker_mode_sets_heterogeneity_knobs() {
        let fast = WorkerArgs::parse_from(["worker", "--id", "0"]);
        assert_eq!(fast.heterogeneity().unwrap(), (1.0, 0));

        let slow = WorkerArgs::parse_from(["worker", "--id", "1", "--mode", "slow"]);
        assert_eq!(slow.heterogeneity().unwrap(), (0.2, 500_000));

        let tuned = WorkerArgs::parse_from(["worker", "--mode", "slow", "--capacity", "0.5"]);
        assert_eq!(tuned.heterogeneity().unwrap(), (0.5, 500_000));
    }

    #[test]
    fn worker_rejects_bad_capacity() {
        let args = WorkerArgs::parse_from(["worker", "--capacity", "1.5"]);
        assert!(args.heterogeneity().is_err());
    }

    #[test]
    fn worker_port_derives_from_id() {
        let args = WorkerArgs::parse_from(["worker", "--id", "3"]);
        assert_eq!(args.listen_port(), DEFAULT_PORT + 4);
    }

    #[test]
    fn scheduler_spellings() {
        let edf = WorkerArgs::parse_from(["worker", "--scheduler", "edf"]);
        assert_eq!(edf.discipline().unwrap(), QueueDiscipline::EdfHeap);
        let bad = WorkerArgs::parse_from(["worker", "--scheduler", "lifo"]);
        assert!(bad.discipline().is_err());
    }

    #[test]
    fn client_defaults() {
        let args = ClientArgs::parse_from(["client", "--lb", "10.10.1.2:31850"]);
        assert_eq!(args.target_rps, 100_000);
        assert_eq!(args.threads, 1);
        assert!(!args.verbose);
    }
}
