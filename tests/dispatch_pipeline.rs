// In-process end-to-end tests: workers, LB and client wired over loopback UDP.

use malcolm::client::{self, ClientConfig, MAX_INFLIGHT};
use malcolm::lb::{self, LbConfig, LbHandle};
use malcolm::policy::Algorithm;
use malcolm::queue::QueueDiscipline;
use malcolm::worker::{self, WorkerConfig, WorkerHandle};
use malcolm::workload::{Distribution, WorkloadConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fleet {
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    lb: LbHandle,
}

impl Fleet {
    fn start(num_workers: usize, discipline: QueueDiscipline, algorithm: Algorithm) -> Fleet {
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::new();
        let mut worker_addresses = Vec::new();
        for i in 0..num_workers {
            let handle = worker::spawn(
                WorkerConfig {
                    worker_id: i as u8,
                    bind_addr: "127.0.0.1:0".to_string(),
                    num_compute_threads: 1,
                    discipline,
                    capacity_factor: 1.0,
                    artificial_delay_ns: 0,
                    state_update_interval_ns: match discipline {
                        QueueDiscipline::Fcfs => 0,
                        _ => 1_000_000,
                    },
                    output_dir: None,
                },
                Arc::clone(&running),
            )
            .expect("worker spawn");
            worker_addresses.push(handle.local_addr.to_string());
            workers.push(handle);
        }

        let lb = lb::spawn(
            LbConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                worker_addresses,
                algorithm,
                model_path: None,
                state_update_interval_ns: 100_000,
                connect_timeout_ns: 2_000_000_000,
                output_dir: None,
            },
            Arc::clone(&running),
        )
        .expect("lb spawn");

        Fleet {
            running,
            workers,
            lb,
        }
    }

    fn client_config(&self, target_rps: u64, duration_ms: u64) -> ClientConfig {
        ClientConfig {
            client_id: 0,
            lb_address: self.lb.local_addr.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            target_rps,
            warmup: Duration::ZERO,
            duration: Duration::from_millis(duration_ms),
            workload: WorkloadConfig {
                distribution: Distribution::Uniform { x_min: 30.0 },
                service_time_min_us: 20.0,
                deadline_multiplier: 200.0,
                ..WorkloadConfig::default()
            },
            max_inflight: MAX_INFLIGHT,
            seed: 42,
            connect_timeout: Duration::from_secs(2),
            output_dir: None,
            verbose: false,
        }
    }

    fn shutdown(self) -> (Vec<worker::WorkerStats>, lb::LbStats) {
        self.running.store(false, Ordering::Relaxed);
        let worker_stats = self.workers.into_iter().map(|w| w.join()).collect();
        let lb_stats = self.lb.join();
        (worker_stats, lb_stats)
    }
}

#[test]
fn requests_round_trip_through_the_fleet() {
    let fleet = Fleet::start(3, QueueDiscipline::Fcfs, Algorithm::Po2);
    let stats = client::run(
        fleet.client_config(2_000, 800),
        Arc::clone(&fleet.running),
    )
    .expect("client run");

    assert!(stats.sent_requests > 100, "sent only {}", stats.sent_requests);
    assert!(
        stats.completed_requests > 0,
        "no responses made it back to the client"
    );
    assert!(stats.completed_requests <= stats.sent_requests);
    // Admission control: in-flight never exceeds the cap, so at the end the gap
    // between sent and completed is bounded by it.
    assert!(stats.sent_requests <= stats.completed_requests + MAX_INFLIGHT as u64);
    assert!(stats.deadline_misses <= stats.completed_requests);
    // Service simulation floors at 20 us, so the median round trip cannot be below it.
    assert!(stats.p50_latency_us >= 20.0);
    assert_eq!(stats.leaked_buffers, 0);

    let (worker_stats, lb_stats) = fleet.shutdown();
    assert!(lb_stats.total_requests >= stats.completed_requests);
    assert_eq!(lb_stats.orphan_responses, 0);
    assert_eq!(lb_stats.leaked_buffers, 0);
    let completed_by_workers: u64 = worker_stats.iter().map(|w| w.completed_requests).sum();
    assert!(completed_by_workers >= lb_stats.total_requests);
    for ws in &worker_stats {
        assert_eq!(ws.leaked_buffers, 0);
    }
}

#[test]
fn all_policies_drive_traffic_end_to_end() {
    for algorithm in [Algorithm::Po2, Algorithm::Malcolm, Algorithm::MalcolmStrict] {
        let fleet = Fleet::start(2, QueueDiscipline::Fcfs, algorithm);
        let stats = client::run(
            fleet.client_config(1_000, 400),
            Arc::clone(&fleet.running),
        )
        .expect("client run");
        assert!(
            stats.completed_requests > 0,
            "{algorithm}: no completions"
        );
        let (_, lb_stats) = fleet.shutdown();
        assert!(lb_stats.total_requests > 0, "{algorithm}: lb saw nothing");
    }
}

#[test]
fn edf_worker_ships_state_updates_and_completes_requests() {
    let fleet = Fleet::start(2, QueueDiscipline::EdfHeap, Algorithm::MalcolmStrict);
    let stats = client::run(
        fleet.client_config(1_000, 600),
        Arc::clone(&fleet.running),
    )
    .expect("client run");
    assert!(stats.completed_requests > 0);
    let (worker_stats, lb_stats) = fleet.shutdown();
    assert!(lb_stats.total_requests > 0);
    for ws in &worker_stats {
        assert_eq!(ws.leaked_buffers, 0);
    }
}

#[test]
fn timing_wheel_worker_completes_requests() {
    let fleet = Fleet::start(1, QueueDiscipline::TimingWheel, Algorithm::Po2);
    let stats = client::run(
        fleet.client_config(500, 400),
        Arc::clone(&fleet.running),
    )
    .expect("client run");
    assert!(stats.completed_requests > 0);
    fleet.shutdown();
}

#[test]
fn shutdown_joins_quickly_and_leaks_nothing() {
    let fleet = Fleet::start(2, QueueDiscipline::Fcfs, Algorithm::Po2);
    let running = Arc::clone(&fleet.running);
    let config = fleet.client_config(1_000, 10_000);
    let client_thread = std::thread::spawn(move || client::run(config, running));

    // Let the pipeline reach steady state, then pull the plug mid-run.
    std::thread::sleep(Duration::from_millis(300));
    fleet.running.store(false, Ordering::Relaxed);

    let begin = Instant::now();
    let client_stats = client_thread
        .join()
        .expect("client thread")
        .expect("client run");
    let (worker_stats, lb_stats) = fleet.shutdown();
    assert!(
        begin.elapsed() < Duration::from_secs(2),
        "threads took {:?} to join",
        begin.elapsed()
    );
    assert_eq!(client_stats.leaked_buffers, 0);
    assert_eq!(lb_stats.leaked_buffers, 0);
    for ws in &worker_stats {
        assert_eq!(ws.leaked_buffers, 0);
    }
}

#[test]
fn zero_inflight_cap_sends_nothing() {
    let fleet = Fleet::start(1, QueueDiscipline::Fcfs, Algorithm::Po2);
    let mut config = fleet.client_config(5_000, 200);
    config.max_inflight = 0;
    let stats = client::run(config, Arc::clone(&fleet.running)).expect("client run");
    assert_eq!(stats.sent_requests, 0);
    assert_eq!(stats.completed_requests, 0);
    fleet.shutdown();
}

#[test]
fn unreachable_lb_is_a_transport_error() {
    let running = Arc::new(AtomicBool::new(true));
    let config = ClientConfig {
        client_id: 0,
        lb_address: "127.0.0.1:1".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        target_rps: 100,
        warmup: Duration::ZERO,
        duration: Duration::from_millis(100),
        workload: WorkloadConfig::default(),
        max_inflight: MAX_INFLIGHT,
        seed: 0,
        connect_timeout: Duration::from_millis(300),
        output_dir: None,
        verbose: false,
    };
    let result = client::run(config, running);
    assert!(matches!(result, Err(malcolm::Error::TransportInit(_))));
}
