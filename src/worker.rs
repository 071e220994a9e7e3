//! Worker node: transport pump, local admission queue and the compute pool.
//!
//! The I/O thread owns the endpoint: it pumps the socket, turns inbound requests into tasks on
//! the admission queue, drains completion rings and emits responses. Compute threads only ever
//! touch the queue and their own completion ring, so a compute stall can never stall network I/O
//! and no transport call happens off the I/O thread. Each compute thread hands finished tasks
//! back through its own SPSC ring.

use crate::clock::{now_ns, Timestamp};
use crate::config::WorkerArgs;
use crate::error::Error;
use crate::metrics::MetricsCollector;
use crate::queue::{QueueDiscipline, SpscRing, TaskQueue};
use crate::request::{RequestType, Task};
use crate::state::EMA_ALPHA;
use crate::threading;
use crate::transport::{local_ip_for_subnet, Endpoint, SessionId};
use crate::wire::{StateUpdateMsg, WorkerRequestMsg, WorkerResponseMsg, REQ_LB_TO_WORKER, REQ_STATE_UPDATE};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Completions drained per pump iteration so a burst of finishes cannot starve the socket.
const COMPLETION_BATCH: usize = 32;
/// Capacity of each compute thread's completion ring.
const COMPLETION_RING_CAPACITY: usize = 1_024;
/// Sleep applied by compute threads when the admission queue is empty.
const IDLE_POLL: Duration = Duration::from_micros(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: u8,
    /// Bind address, `ip:port`; port 0 picks an ephemeral port (used by tests).
    pub bind_addr: String,
    pub num_compute_threads: usize,
    pub discipline: QueueDiscipline,
    /// Relative processing capability in (0, 1]; service times divide by it.
    pub capacity_factor: f64,
    /// Extra busy-wait injected after every task (the "slow worker" knob).
    pub artificial_delay_ns: u64,
    /// Push interval for state updates; 0 disables the push path.
    pub state_update_interval_ns: u64,
    pub output_dir: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn from_args(args: &WorkerArgs) -> Result<WorkerConfig, Error> {
        let (capacity_factor, artificial_delay_ns) = args.heterogeneity()?;
        let discipline = args.discipline()?;
        let ip = local_ip_for_subnet(&args.subnet);
        Ok(WorkerConfig {
            worker_id: args.id,
            bind_addr: format!("{ip}:{}", args.listen_port()),
            num_compute_threads: args.threads.max(1),
            discipline,
            capacity_factor,
            artificial_delay_ns,
            // EDF variants ship their slack histogram to the LB; FCFS has nothing to ship.
            state_update_interval_ns: match discipline {
                QueueDiscipline::Fcfs => 0,
                _ => 1_000_000,
            },
            output_dir: args.output.clone(),
        })
    }
}

/// Final accounting returned when the worker joins.
#[derive(Debug)]
pub struct WorkerStats {
    pub completed_requests: u64,
    pub deadline_misses: u64,
    /// Message buffers still leased at shutdown; zero on a clean run.
    pub leaked_buffers: u64,
}

/// Running worker; `join` blocks until the shutdown flag stops the pipeline.
pub struct WorkerHandle {
    pub local_addr: std::net::SocketAddr,
    io_thread: thread::JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    pub fn join(self) -> WorkerStats {
        self.io_thread.join().expect("worker I/O thread panicked")
    }
}

/// Bind the endpoint and launch the worker pipeline.
///
/// The endpoint is created here and moved into the I/O thread, which is the only
/// thread that ever touches it afterwards.
pub fn spawn(config: WorkerConfig, running: Arc<AtomicBool>) -> Result<WorkerHandle, Error> {
    let mut endpoint = Endpoint::bind(&config.bind_addr)?;
    let local_addr = endpoint.local_addr();
    info!(
        "[worker {}] listening on {local_addr} ({:?}, capacity={:.2}, delay={}ns, threads={})",
        config.worker_id,
        config.discipline,
        config.capacity_factor,
        config.artificial_delay_ns,
        config.num_compute_threads
    );

    let queue = Arc::new(TaskQueue::new(config.discipline));
    let active_requests = Arc::new(AtomicU32::new(0));
    let completed_requests = Arc::new(AtomicU64::new(0));
    let rings: Vec<Arc<SpscRing<Task>>> = (0..config.num_compute_threads)
        .map(|_| Arc::new(SpscRing::with_capacity(COMPLETION_RING_CAPACITY)))
        .collect();

    let handler_queue = Arc::clone(&queue);
    let handler_active = Arc::clone(&active_requests);
    let worker_id = config.worker_id;
    endpoint.register_handler(REQ_LB_TO_WORKER, move |_core, handle, payload| {
        let recv_time = now_ns();
        let msg = match WorkerRequestMsg::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[worker {worker_id}] dropping undecodable request: {e}");
                return;
            }
        };
        let task = Task {
            request_id: msg.request_id,
            client_send_time: msg.client_send_time,
            deadline: msg.deadline,
            service_time_hint_us: msg.service_time_hint_us,
            request_type: RequestType::from_u8(msg.request_type),
            payload_size: msg.payload_size,
            arrival_time: recv_time,
            worker_done_time: 0,
            actual_service_time_ns: 0,
            queue_time_ns: 0,
            request_handle: handle,
        };
        handler_queue.push(task);
        handler_active.fetch_add(1, Ordering::Relaxed);
    });

    let io_config = config.clone();
    let io_queue = Arc::clone(&queue);
    let io_rings = rings.clone();
    let io_thread = thread::Builder::new()
        .name(format!("worker{}-io", config.worker_id))
        .spawn(move || {
            io_loop(
                io_config,
                endpoint,
                io_queue,
                io_rings,
                active_requests,
                completed_requests,
                running,
            )
        })
        .expect("failed to spawn worker I/O thread");

    Ok(WorkerHandle {
        local_addr,
        io_thread,
    })
}

#[allow(clippy::too_many_arguments)]
fn io_loop(
    config: WorkerConfig,
    mut endpoint: Endpoint,
    queue: Arc<TaskQueue>,
    rings: Vec<Arc<SpscRing<Task>>>,
    active_requests: Arc<AtomicU32>,
    completed_requests: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
) -> WorkerStats {
    // Compute pool: pops tasks, simulates service, hands completions back by ring.
    let mut compute_threads = Vec::with_capacity(config.num_compute_threads);
    for (thread_id, ring) in rings.iter().enumerate() {
        let queue = Arc::clone(&queue);
        let ring = Arc::clone(ring);
        let running = Arc::clone(&running);
        let capacity_factor = config.capacity_factor;
        let artificial_delay_ns = config.artificial_delay_ns;
        let handle = thread::Builder::new()
            .name(format!("worker{}-compute{thread_id}", config.worker_id))
            .spawn(move || {
                threading::set_thread_priority(2);
                compute_loop(queue, ring, running, capacity_factor, artificial_delay_ns);
            })
            .expect("failed to spawn compute thread");
        compute_threads.push(handle);
    }

    let mut metrics = MetricsCollector::new();
    let mut lb_session: Option<SessionId> = None;
    let mut load_ema = 0.0f64;
    let mut next_state_update = now_ns();

    while running.load(Ordering::Relaxed) {
        let pumped = endpoint.pump_once();

        // Completion drain runs on this thread because it is the only one allowed to
        // touch the endpoint.
        let mut drained = 0;
        'drain: loop {
            let mut progressed = false;
            for ring in &rings {
                if drained >= COMPLETION_BATCH {
                    break 'drain;
                }
                let Some(task) = ring.try_pop() else { continue };
                progressed = true;
                drained += 1;

                let latency = task.worker_done_time.saturating_sub(task.arrival_time);
                metrics.record_latency(latency);
                if task.worker_done_time > task.deadline {
                    metrics.record_deadline_miss();
                }
                active_requests.fetch_sub(1, Ordering::Relaxed);
                completed_requests.fetch_add(1, Ordering::Relaxed);

                // First contact with the LB pins the session used for state pushes.
                if lb_session.is_none() && config.state_update_interval_ns > 0 {
                    match endpoint
                        .core()
                        .create_session(&task.request_handle.peer.to_string())
                    {
                        Ok(session) => lb_session = Some(session),
                        Err(e) => warn!(
                            "[worker {}] state-update session setup failed: {e}",
                            config.worker_id
                        ),
                    }
                }

                let response = WorkerResponseMsg {
                    request_id: task.request_id,
                    worker_recv_time: task.arrival_time,
                    worker_done_time: task.worker_done_time,
                    queue_time_ns: task.queue_time_ns,
                    service_time_us: (task.actual_service_time_ns / 1_000) as u32,
                    queue_length: queue.len().min(u16::MAX as usize) as u16,
                    worker_id: config.worker_id,
                    success: 1,
                };
                let mut buf = [0u8; WorkerResponseMsg::SIZE];
                response.encode(&mut buf);
                if let Err(e) = endpoint.core().enqueue_response(&task.request_handle, &buf) {
                    error!(
                        "[worker {}] response for request {} failed: {e}",
                        config.worker_id, task.request_id
                    );
                }
            }
            if !progressed {
                break;
            }
        }

        // Periodic state push carrying the slack histogram (EDF variants only).
        let now = now_ns();
        if config.state_update_interval_ns > 0 && now >= next_state_update {
            next_state_update = now + config.state_update_interval_ns;
            load_ema = EMA_ALPHA * queue.len() as f64 + (1.0 - EMA_ALPHA) * load_ema;
            if let Some(session) = lb_session {
                let update = StateUpdateMsg {
                    queue_length: queue.len().min(u16::MAX as usize) as u16,
                    active_requests: active_requests.load(Ordering::Relaxed).min(u16::MAX as u32)
                        as u16,
                    completed_requests: completed_requests.load(Ordering::Relaxed)
                        .min(u32::MAX as u64) as u32,
                    load_ema: load_ema as f32,
                    worker_id: config.worker_id,
                    is_healthy: 1,
                    slack_histogram: queue.slack_histogram(now),
                };
                let mut buf = [0u8; StateUpdateMsg::SIZE];
                update.encode(&mut buf);
                let _ = endpoint
                    .core()
                    .enqueue_request(session, REQ_STATE_UPDATE, &buf, Box::new(|_, _| {}));
            }
            endpoint.core().expire_calls(1_000_000_000);
        }

        if pumped == 0 && drained == 0 {
            thread::sleep(IDLE_POLL);
        }
    }

    for handle in compute_threads {
        let _ = handle.join();
    }
    // The endpoint releases send leases synchronously, so anything still outstanding
    // once the pump is quiescent leaked; the shutdown test asserts this is zero.
    let leaked_buffers = endpoint.buffer_pool().outstanding();
    let stats = WorkerStats {
        completed_requests: completed_requests.load(Ordering::Relaxed),
        deadline_misses: metrics.deadline_misses(),
        leaked_buffers,
    };

    if let Some(dir) = &config.output_dir {
        if let Err(e) = metrics.export_all(dir) {
            error!("[worker {}] metrics export failed: {e}", config.worker_id);
        } else {
            info!("[worker {}] metrics exported to {}", config.worker_id, dir.display());
        }
    }
    metrics.e2e_latency().log_summary(&format!("worker {} service", config.worker_id));
    info!(
        "[worker {}] stopped: completed={} misses={}",
        config.worker_id, stats.completed_requests, stats.deadline_misses
    );
    stats
}

fn compute_loop(
    queue: Arc<TaskQueue>,
    ring: Arc<SpscRing<Task>>,
    running: Arc<AtomicBool>,
    capacity_factor: f64,
    artificial_delay_ns: u64,
) {
    while running.load(Ordering::Relaxed) {
        let Some(mut task) = queue.try_pop() else {
            // Bounded wake latency while idle.
            thread::sleep(IDLE_POLL);
            continue;
        };
        let start = now_ns();
        task.queue_time_ns = start.saturating_sub(task.arrival_time);

        let adjusted_us =
            (task.service_time_hint_us.max(1) as f64 / capacity_factor)
                * task.request_type.service_multiplier();
        let service_target = start + (adjusted_us * 1_000.0) as u64;
        busy_wait_until(service_target);
        if artificial_delay_ns > 0 {
            busy_wait_until(now_ns() + artificial_delay_ns);
        }
        let done = now_ns();
        task.worker_done_time = done;
        task.actual_service_time_ns = done.saturating_sub(start);

        // The ring only fills if the I/O thread has stalled; spin until it drains.
        let mut pending = task;
        loop {
            match ring.try_push(pending) {
                Ok(()) => break,
                Err(back) => {
                    pending = back;
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(IDLE_POLL);
                }
            }
        }
    }
}

/// Hybrid sleep-then-spin wait: coarse sleeps while far from the target, a pause-hinted
/// spin for the final stretch.
pub fn busy_wait_until(target: Timestamp) {
    loop {
        let now = now_ns();
        if now >= target {
            return;
        }
        let remaining = target - now;
        if remaining > 60_000 {
            thread::sleep(Duration::from_nanos(remaining - 50_000));
        } else {
            std::hint::spin_loop();
        }
    }
}
