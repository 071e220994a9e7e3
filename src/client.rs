//! Client: paced request generation, admission control and client-side deadline judgement.
//!
//! A single thread drives the transport pump and the generator together, which keeps every
//! transport call on the binding thread. Pacing aims each send at `next_send += interval` and
//! snaps forward when it falls behind rather than accumulating a backlog. The client judges
//! deadline misses against its own per-slot deadline array and its own clock; the LB's
//! `deadline_met` byte is advisory only, so cross-host clock skew never pollutes the metrics.

use crate::clock::now_ns;
use crate::config::ClientArgs;
use crate::error::Error;
use crate::metrics::{MetricsCollector, ThroughputCounter};
use crate::transport::{local_ip_for_subnet, Endpoint};
use crate::wire::{ClientRequestMsg, ClientResponseMsg, REQ_CLIENT_TO_LB};
use crate::workload::{Distribution, RequestGenerator, WorkloadConfig};
use log::{info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Hard cap on concurrently in-flight requests.
pub const MAX_INFLIGHT: usize = 64;
/// Message-buffer slots; in-flight requests may never exceed this either.
const SLOT_COUNT: usize = 1_024;
/// Pacing interval when the target rate is zero: at most one request per millisecond.
const IDLE_INTERVAL_NS: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: u8,
    pub lb_address: String,
    /// Bind address, `ip:port`; port 0 picks an ephemeral port (used by tests).
    pub bind_addr: String,
    pub target_rps: u64,
    pub warmup: Duration,
    pub duration: Duration,
    pub workload: WorkloadConfig,
    pub max_inflight: usize,
    /// Seed spacing mirrors the multi-process layout: `client_id · 1000 + thread`.
    pub seed: u64,
    pub connect_timeout: Duration,
    pub output_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl ClientConfig {
    pub fn from_args(args: &ClientArgs) -> ClientConfig {
        let ip = local_ip_for_subnet(&args.subnet);
        let port = 31_870u16.wrapping_add(args.id as u16);
        ClientConfig {
            client_id: args.id,
            lb_address: args.lb_address.clone(),
            bind_addr: format!("{ip}:{port}"),
            target_rps: args.target_rps,
            warmup: Duration::from_secs(args.warmup),
            duration: Duration::from_secs(args.duration),
            workload: WorkloadConfig {
                distribution: Distribution::Pareto {
                    alpha: args.pareto_alpha,
                    x_min: args.service_min,
                },
                service_time_min_us: args.service_min,
                deadline_multiplier: args.deadline_multiplier,
                ..WorkloadConfig::default()
            },
            max_inflight: MAX_INFLIGHT,
            seed: args.id as u64 * 1_000,
            connect_timeout: Duration::from_secs(5),
            output_dir: args.output.clone(),
            verbose: args.verbose,
        }
    }
}

/// End-of-run accounting.
#[derive(Debug)]
pub struct ClientStats {
    pub sent_requests: u64,
    pub completed_requests: u64,
    pub deadline_misses: u64,
    pub actual_rps: f64,
    pub p50_latency_us: f64,
    pub p99_latency_us: f64,
    pub p999_latency_us: f64,
    /// Message buffers still leased at shutdown; zero on a clean run.
    pub leaked_buffers: u64,
}

struct ClientShared {
    metrics: Mutex<MetricsCollector>,
    throughput: ThroughputCounter,
    slot_deadlines: Vec<AtomicU64>,
    inflight: AtomicUsize,
    completed: AtomicU64,
    in_warmup: AtomicBool,
}

/// Run the client to completion on the calling thread.
pub fn run(config: ClientConfig, running: Arc<AtomicBool>) -> Result<ClientStats, Error> {
    let mut endpoint = Endpoint::bind(&config.bind_addr)?;
    let session = endpoint.core().create_session(&config.lb_address)?;
    if !endpoint
        .wait_connected(config.connect_timeout.as_nanos() as u64)
        .is_empty()
    {
        return Err(Error::TransportInit(format!(
            "load balancer at {} unreachable",
            config.lb_address
        )));
    }
    info!(
        "[client {}] connected to {} (target {} rps)",
        config.client_id, config.lb_address, config.target_rps
    );
    if let Distribution::Pareto { alpha, x_min } = config.workload.distribution {
        info!(
            "[client {}] pareto(α={alpha}, x_min={x_min}): mean={:.1}us variance={}",
            config.client_id,
            Distribution::pareto_mean(alpha, x_min),
            Distribution::pareto_variance(alpha, x_min),
        );
    }

    let shared = Arc::new(ClientShared {
        metrics: Mutex::new(MetricsCollector::new()),
        throughput: ThroughputCounter::new(),
        slot_deadlines: (0..SLOT_COUNT).map(|_| AtomicU64::new(0)).collect(),
        inflight: AtomicUsize::new(0),
        completed: AtomicU64::new(0),
        in_warmup: AtomicBool::new(true),
    });

    let mut generator = RequestGenerator::new(config.workload.clone(), config.client_id, config.seed);
    let interval_ns = if config.target_rps > 0 {
        1_000_000_000 / config.target_rps
    } else {
        IDLE_INTERVAL_NS
    };

    let start = now_ns();
    let warmup_end = start + config.warmup.as_nanos() as u64;
    let end = warmup_end + config.duration.as_nanos() as u64;
    let mut next_send = start;
    let mut next_report = start + 5_000_000_000;
    let mut next_expiry = start + 1_000_000_000;
    let mut sent: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let now = now_ns();
        if now >= end {
            break;
        }

        endpoint.pump_once();

        if shared.in_warmup.load(Ordering::Relaxed) && now >= warmup_end {
            shared.in_warmup.store(false, Ordering::Relaxed);
            shared.metrics.lock().reset();
            info!("[client {}] warmup complete, measuring", config.client_id);
        }

        if now >= next_report {
            next_report = now + 5_000_000_000;
            let metrics = shared.metrics.lock();
            info!(
                "[client {}] progress: sent={} completed={} inflight={} rps={:.0} p99={:.1}us",
                config.client_id,
                sent,
                shared.completed.load(Ordering::Relaxed),
                shared.inflight.load(Ordering::Relaxed),
                shared.throughput.get_rps(),
                metrics.e2e_latency().percentile(99.0) as f64 / 1_000.0,
            );
        }

        if now >= next_expiry {
            next_expiry = now + 1_000_000_000;
            endpoint.core().expire_calls(10_000_000_000);
        }

        let inflight = shared.inflight.load(Ordering::Relaxed);
        if now >= next_send && inflight < config.max_inflight && inflight < SLOT_COUNT {
            let request = generator.generate_at(now);
            let slot = (request.request_id % SLOT_COUNT as u64) as usize;
            shared.slot_deadlines[slot].store(request.deadline, Ordering::Relaxed);

            let msg = ClientRequestMsg::from_request(&request);
            let mut buf = [0u8; ClientRequestMsg::SIZE];
            msg.encode(&mut buf);

            let continuation_shared = Arc::clone(&shared);
            shared.inflight.fetch_add(1, Ordering::Relaxed);
            let enqueued = endpoint.core().enqueue_request(
                session,
                REQ_CLIENT_TO_LB,
                &buf,
                Box::new(move |_core, response| {
                    on_response(&continuation_shared, slot, response);
                }),
            );
            match enqueued {
                Ok(_) => sent += 1,
                Err(e) => {
                    shared.inflight.fetch_sub(1, Ordering::Relaxed);
                    warn!("[client] send failed: {e}");
                }
            }

            next_send += interval_ns;
            if next_send < now {
                // Snap forward; a stall must not turn into a burst of back-to-back sends.
                next_send = now;
            }
        } else {
            std::hint::spin_loop();
        }
    }

    // Collect straggler responses briefly after a natural end of run; a shutdown
    // signal drops them instead.
    if running.load(Ordering::Relaxed) {
        let grace_end = now_ns() + 100_000_000;
        while shared.inflight.load(Ordering::Relaxed) > 0 && now_ns() < grace_end {
            endpoint.pump_once();
            std::thread::sleep(Duration::from_micros(10));
        }
    }
    endpoint.core().expire_calls(0);

    let stats = {
        let metrics = shared.metrics.lock();
        let elapsed_ns = now_ns().saturating_sub(start).max(1);
        ClientStats {
            sent_requests: sent,
            completed_requests: shared.completed.load(Ordering::Relaxed),
            deadline_misses: metrics.deadline_misses(),
            actual_rps: shared.completed.load(Ordering::Relaxed) as f64 * 1e9 / elapsed_ns as f64,
            p50_latency_us: metrics.e2e_latency().percentile(50.0) as f64 / 1_000.0,
            p99_latency_us: metrics.e2e_latency().percentile(99.0) as f64 / 1_000.0,
            p999_latency_us: metrics.e2e_latency().percentile(99.9) as f64 / 1_000.0,
            leaked_buffers: endpoint.buffer_pool().outstanding(),
        }
    };

    if let Some(dir) = &config.output_dir {
        let metrics = shared.metrics.lock();
        match metrics.export_all(dir) {
            Ok(()) => info!("[client {}] results exported to {}", config.client_id, dir.display()),
            Err(e) => warn!("[client {}] export failed: {e}", config.client_id),
        }
    }
    shared
        .metrics
        .lock()
        .e2e_latency()
        .log_summary(&format!("client {} e2e", config.client_id));
    info!(
        "[client {}] done: sent={} completed={} misses={} rps={:.0}",
        config.client_id,
        stats.sent_requests,
        stats.completed_requests,
        stats.deadline_misses,
        stats.actual_rps
    );
    Ok(stats)
}

fn on_response(shared: &Arc<ClientShared>, slot: usize, response: Option<&[u8]>) {
    shared.inflight.fetch_sub(1, Ordering::Relaxed);
    let Some(bytes) = response else {
        // Expired call: the request is lost, nothing to record.
        return;
    };
    let recv_time = now_ns();
    let msg = match ClientResponseMsg::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("[client] undecodable response: {e}");
            return;
        }
    };
    shared.completed.fetch_add(1, Ordering::Relaxed);
    shared.throughput.record_at(recv_time);

    if !shared.in_warmup.load(Ordering::Relaxed) {
        let e2e = recv_time.saturating_sub(msg.client_send_time);
        let mut metrics = shared.metrics.lock();
        metrics.record_latency(e2e);
        // Client clock domain is authoritative for the miss decision.
        let recorded_deadline = shared.slot_deadlines[slot].load(Ordering::Relaxed);
        if recv_time > recorded_deadline {
            metrics.record_deadline_miss();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn config_from_args_builds_pareto_workload() {
        let args = ClientArgs::parse_from([
            "client",
            "--id",
            "2",
            "--lb",
            "127.0.0.1:31850",
            "--pareto_alpha",
            "1.5",
            "--service_min",
            "20",
            "--subnet",
            "127.0.0.",
        ]);
        let config = ClientConfig::from_args(&args);
        assert_eq!(config.client_id, 2);
        assert_eq!(config.seed, 2_000);
        match config.workload.distribution {
            Distribution::Pareto { alpha, x_min } => {
                assert_eq!(alpha, 1.5);
                assert_eq!(x_min, 20.0);
            }
            other => panic!("expected pareto, got {other:?}"),
        }
    }

    #[test]
    fn zero_rps_saturates_interval_at_one_ms() {
        assert_eq!(IDLE_INTERVAL_NS, 1_000_000);
    }
}
