//! Load balancer: policy dispatch, pending-request tracking and worker-state maintenance.
//!
//! All transport calls are confined to the binding thread. Both event contexts (inbound client
//! requests and inbound worker responses) run as a registered handler and per-request
//! continuations on that thread; a separate ticker thread only touches the shared worker-state
//! vector, decaying load scores so idle workers become attractive again when traffic is skewed.

use crate::clock::{now_ns, us_to_ns};
use crate::config::LbArgs;
use crate::error::Error;
use crate::metrics::{LatencyHistogram, MetricsCollector};
use crate::policy::{Algorithm, DispatchPolicy};
use crate::request::RequestTrace;
use crate::state::WorkerState;
use crate::transport::{local_ip_for_subnet, Endpoint, EndpointCore, ReqHandle, SessionId};
use crate::wire::{
    ClientRequestMsg, ClientResponseMsg, StateUpdateMsg, WorkerRequestMsg, WorkerResponseMsg,
    REQ_CLIENT_TO_LB, REQ_LB_TO_WORKER, REQ_STATE_UPDATE,
};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Calls with no response after this long fire their continuation with `None`.
const CALL_TIMEOUT_NS: u64 = 5_000_000_000;
/// How often the I/O loop sweeps for expired calls.
const EXPIRY_SWEEP_NS: u64 = 100_000_000;

#[derive(Debug, Clone)]
pub struct LbConfig {
    /// Bind address, `ip:port`; port 0 picks an ephemeral port (used by tests).
    pub bind_addr: String,
    pub worker_addresses: Vec<String>,
    pub algorithm: Algorithm,
    pub model_path: Option<String>,
    /// Ticker period for load-EMA decay.
    pub state_update_interval_ns: u64,
    /// How long session handshakes may take before a slot is written off.
    pub connect_timeout_ns: u64,
    pub output_dir: Option<PathBuf>,
}

impl LbConfig {
    pub fn from_args(args: &LbArgs) -> Result<LbConfig, Error> {
        let algorithm = args.algorithm()?;
        let ip = local_ip_for_subnet(&args.subnet);
        Ok(LbConfig {
            bind_addr: format!("{ip}:{}", args.port),
            worker_addresses: args.workers.clone(),
            algorithm,
            model_path: args.model.clone(),
            state_update_interval_ns: 100_000,
            connect_timeout_ns: 5_000_000_000,
            output_dir: args.output.clone(),
        })
    }
}

/// One record per in-flight request, inserted when forwarded and removed exactly
/// once on worker response or timeout.
struct PendingRequest {
    client_send_time: u64,
    recv_time: u64,
    dispatch_time: u64,
    deadline: u64,
    #[allow(dead_code)]
    target_worker: u8,
    client_reply: ReqHandle,
}

struct LbShared {
    states: Mutex<Vec<WorkerState>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    policy: Mutex<DispatchPolicy>,
    metrics: Mutex<MetricsCollector>,
    scheduling_latency: Mutex<LatencyHistogram>,
    orphan_responses: AtomicU64,
    dropped_requests: AtomicU64,
}

/// Final accounting returned when the LB joins.
#[derive(Debug)]
pub struct LbStats {
    pub total_requests: u64,
    pub orphan_responses: u64,
    pub dropped_requests: u64,
    pub leaked_buffers: u64,
}

pub struct LbHandle {
    pub local_addr: std::net::SocketAddr,
    io_thread: thread::JoinHandle<LbStats>,
}

impl LbHandle {
    pub fn join(self) -> LbStats {
        self.io_thread.join().expect("lb I/O thread panicked")
    }
}

/// Bind the endpoint, connect to every worker and launch the LB event loop.
pub fn spawn(config: LbConfig, running: Arc<AtomicBool>) -> Result<LbHandle, Error> {
    let mut endpoint = Endpoint::bind(&config.bind_addr)?;
    let local_addr = endpoint.local_addr();

    let policy = DispatchPolicy::new(config.algorithm, 0x6d616c63, config.model_path.as_deref());
    info!(
        "[lb] listening on {local_addr}, policy={}, workers={}",
        policy.name(),
        config.worker_addresses.len()
    );

    let mut states = Vec::with_capacity(config.worker_addresses.len());
    let mut sessions: Vec<Option<SessionId>> = Vec::with_capacity(config.worker_addresses.len());
    for (i, addr) in config.worker_addresses.iter().enumerate() {
        states.push(WorkerState::new(i as u8, addr.clone()));
        match endpoint.core().create_session(addr) {
            Ok(session) => sessions.push(Some(session)),
            Err(e) => {
                // Fatal for this slot only; the fleet keeps running without it.
                error!("[lb] worker {i} session to {addr} failed: {e}");
                states[i].is_healthy = false;
                sessions.push(None);
            }
        }
    }

    let unconnected = endpoint.wait_connected(config.connect_timeout_ns);
    for session in unconnected {
        for (i, slot) in sessions.iter_mut().enumerate() {
            if *slot == Some(session) {
                error!(
                    "[lb] worker {i} at {} never completed the handshake, marking unhealthy",
                    config.worker_addresses[i]
                );
                states[i].is_healthy = false;
                *slot = None;
            }
        }
    }
    info!(
        "[lb] {} of {} workers connected",
        sessions.iter().filter(|s| s.is_some()).count(),
        sessions.len()
    );

    let shared = Arc::new(LbShared {
        states: Mutex::new(states),
        pending: Mutex::new(HashMap::new()),
        policy: Mutex::new(policy),
        metrics: Mutex::new(MetricsCollector::new()),
        scheduling_latency: Mutex::new(LatencyHistogram::new()),
        orphan_responses: AtomicU64::new(0),
        dropped_requests: AtomicU64::new(0),
    });

    register_client_handler(&mut endpoint, Arc::clone(&shared), sessions);
    register_state_update_handler(&mut endpoint, Arc::clone(&shared));

    let io_thread = thread::Builder::new()
        .name("lb-io".to_string())
        .spawn({
            let shared = Arc::clone(&shared);
            let config = config.clone();
            move || io_loop(config, endpoint, shared, running)
        })
        .expect("failed to spawn lb I/O thread");

    Ok(LbHandle {
        local_addr,
        io_thread,
    })
}

fn register_client_handler(
    endpoint: &mut Endpoint,
    shared: Arc<LbShared>,
    sessions: Vec<Option<SessionId>>,
) {
    endpoint.register_handler(REQ_CLIENT_TO_LB, move |core, handle, payload| {
        let recv_time = now_ns();
        let msg = match ClientRequestMsg::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[lb] dropping undecodable client request: {e}");
                return;
            }
        };
        let request = msg.to_request();

        // Scheduling happens under the state lock so the policy sees a consistent snapshot.
        let decision = {
            let states = shared.states.lock();
            let mut policy = shared.policy.lock();
            policy.schedule(&request, &states)
        };
        shared
            .scheduling_latency
            .lock()
            .record(decision.decision_time_ns);

        let target = decision.target_worker_id as usize;
        let Some(session) = sessions.get(target).copied().flatten() else {
            // No pending record is inserted for an unroutable request.
            warn!(
                "[lb] request {} targets worker {target} with no session, dropping",
                request.request_id
            );
            shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let dispatch_time = now_ns();
        shared.pending.lock().insert(
            request.request_id,
            PendingRequest {
                client_send_time: request.client_send_time,
                recv_time,
                dispatch_time,
                deadline: request.deadline,
                target_worker: decision.target_worker_id,
                client_reply: handle,
            },
        );

        {
            let mut states = shared.states.lock();
            let ws = &mut states[target];
            ws.queue_length += 1;
            ws.update_load_ema();
        }

        let forward = WorkerRequestMsg {
            request_id: request.request_id,
            client_send_time: request.client_send_time,
            deadline: request.deadline,
            lb_forward_time: dispatch_time,
            service_time_hint_us: request.service_time_hint_us,
            worker_id: decision.target_worker_id,
            request_type: msg.request_type,
            payload_size: request.payload_size,
        };
        let mut buf = [0u8; WorkerRequestMsg::SIZE];
        forward.encode(&mut buf);

        // Per-request continuation: carries the shared context to the response path.
        let continuation_shared = Arc::clone(&shared);
        let request_id = request.request_id;
        let result = core.enqueue_request(
            session,
            REQ_LB_TO_WORKER,
            &buf,
            Box::new(move |core, response| match response {
                Some(bytes) => match WorkerResponseMsg::decode(bytes) {
                    Ok(resp) => complete_request(core, &resp, &continuation_shared),
                    Err(e) => warn!("[lb] undecodable worker response: {e}"),
                },
                None => {
                    // Timed out: drop the pending record so the table cannot grow unbounded.
                    if continuation_shared
                        .pending
                        .lock()
                        .remove(&request_id)
                        .is_some()
                    {
                        warn!("[lb] request {request_id} timed out waiting for its worker");
                    }
                }
            }),
        );
        if let Err(e) = result {
            error!("[lb] forward of request {} failed: {e}", request.request_id);
            shared.pending.lock().remove(&request.request_id);
            shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
        }
    });
}

/// Worker-response path: pending lookup, state refresh, metrics, client reply.
fn complete_request(core: &mut EndpointCore, resp: &WorkerResponseMsg, shared: &Arc<LbShared>) {
    let complete_time = now_ns();

    let Some(pending) = shared.pending.lock().remove(&resp.request_id) else {
        // The record was already consumed; log and drop.
        warn!(
            "[lb] orphan response for request {} from worker {}",
            resp.request_id, resp.worker_id
        );
        shared.orphan_responses.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let deadline_met = complete_time <= pending.deadline;
    {
        let mut states = shared.states.lock();
        if let Some(ws) = states.get_mut(resp.worker_id as usize) {
            if ws.queue_length > 0 {
                ws.queue_length -= 1;
            }
            ws.update_load_ema();
            ws.observe_service_time(us_to_ns(resp.service_time_us as u64));
            ws.observe_deadline(!deadline_met);
        }
    }

    let trace = RequestTrace {
        request_id: resp.request_id,
        deadline: pending.deadline,
        t1_client_send: pending.client_send_time,
        t2_lb_receive: pending.recv_time,
        t3_lb_dispatch: pending.dispatch_time,
        t4_worker_recv: resp.worker_recv_time,
        t5_worker_done: resp.worker_done_time,
        t6_lb_response: complete_time,
        // The LB cannot observe the client's receive clock; its own response
        // timestamp is the closest lower bound.
        t7_client_recv: complete_time,
        target_worker_id: resp.worker_id,
    };
    {
        let mut metrics = shared.metrics.lock();
        metrics.record_request(&trace);
        let p99 = metrics.worker_latency(resp.worker_id as usize).percentile(99.0);
        let mut states = shared.states.lock();
        if let Some(ws) = states.get_mut(resp.worker_id as usize) {
            ws.p99_latency_ns = p99 as f64;
        }
    }
    shared.policy.lock().on_request_complete(&trace);

    let reply = ClientResponseMsg {
        request_id: resp.request_id,
        client_send_time: pending.client_send_time,
        e2e_latency_ns: complete_time.saturating_sub(pending.client_send_time),
        service_time_us: resp.service_time_us,
        worker_id: resp.worker_id,
        // Advisory: the client re-judges against its own clock.
        deadline_met: deadline_met as u8,
        success: resp.success,
    };
    let mut buf = [0u8; ClientResponseMsg::SIZE];
    reply.encode(&mut buf);
    if let Err(e) = core.enqueue_response(&pending.client_reply, &buf) {
        error!("[lb] reply for request {} failed: {e}", resp.request_id);
    }
}

fn register_state_update_handler(endpoint: &mut Endpoint, shared: Arc<LbShared>) {
    endpoint.register_handler(REQ_STATE_UPDATE, move |core, handle, payload| {
        match StateUpdateMsg::decode(payload) {
            Ok(update) => {
                let mut states = shared.states.lock();
                if let Some(ws) = states.get_mut(update.worker_id as usize) {
                    ws.apply_update(&update, now_ns());
                } else {
                    warn!("[lb] state update from unknown worker {}", update.worker_id);
                }
            }
            Err(e) => warn!("[lb] undecodable state update: {e}"),
        }
        // Ack so the worker's outstanding call resolves promptly.
        let _ = core.enqueue_response(&handle, &[1]);
    });
}

fn io_loop(
    config: LbConfig,
    mut endpoint: Endpoint,
    shared: Arc<LbShared>,
    running: Arc<AtomicBool>,
) -> LbStats {
    // State ticker: periodic load decay, independent of traffic.
    let ticker = {
        let shared = Arc::clone(&shared);
        let running = Arc::clone(&running);
        let interval = Duration::from_nanos(config.state_update_interval_ns);
        thread::Builder::new()
            .name("lb-state-ticker".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    {
                        let mut states = shared.states.lock();
                        for ws in states.iter_mut() {
                            ws.tick_decay();
                        }
                    }
                    thread::sleep(interval);
                }
            })
            .expect("failed to spawn state ticker")
    };

    let mut next_sweep = now_ns() + EXPIRY_SWEEP_NS;
    while running.load(Ordering::Relaxed) {
        let pumped = endpoint.pump_once();
        let now = now_ns();
        if now >= next_sweep {
            next_sweep = now + EXPIRY_SWEEP_NS;
            endpoint.core().expire_calls(CALL_TIMEOUT_NS);
        }
        if pumped == 0 {
            thread::sleep(Duration::from_micros(1));
        }
    }

    let _ = ticker.join();

    let stats = {
        let metrics = shared.metrics.lock();
        LbStats {
            total_requests: metrics.total_requests(),
            orphan_responses: shared.orphan_responses.load(Ordering::Relaxed),
            dropped_requests: shared.dropped_requests.load(Ordering::Relaxed),
            leaked_buffers: endpoint.buffer_pool().outstanding(),
        }
    };

    if let Some(dir) = &config.output_dir {
        let metrics = shared.metrics.lock();
        let export = metrics.export_all(dir).and_then(|()| {
            shared
                .scheduling_latency
                .lock()
                .export_hdr(&dir.join("scheduling_latency.hdr"))
        });
        match export {
            Ok(()) => info!("[lb] metrics exported to {}", dir.display()),
            Err(e) => error!("[lb] metrics export failed: {e}"),
        }
    }
    {
        let metrics = shared.metrics.lock();
        metrics.e2e_latency().log_summary("lb e2e");
        shared.scheduling_latency.lock().log_summary("lb scheduling");
    }
    info!(
        "[lb] stopped: total={} orphans={} dropped={}",
        stats.total_requests, stats.orphan_responses, stats.dropped_requests
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Algorithm;

    fn test_shared(num_workers: usize) -> Arc<LbShared> {
        let states = (0..num_workers)
            .map(|i| WorkerState::new(i as u8, format!("127.0.0.1:4000{i}")))
            .collect();
        Arc::new(LbShared {
            states: Mutex::new(states),
            pending: Mutex::new(HashMap::new()),
            policy: Mutex::new(DispatchPolicy::new(Algorithm::Po2, 0, None)),
            metrics: Mutex::new(MetricsCollector::new()),
            scheduling_latency: Mutex::new(LatencyHistogram::new()),
            orphan_responses: AtomicU64::new(0),
            dropped_requests: AtomicU64::new(0),
        })
    }

    fn response_for(request_id: u64) -> WorkerResponseMsg {
        WorkerResponseMsg {
            request_id,
            worker_recv_time: 2_000,
            worker_done_time: 3_000,
            queue_time_ns: 100,
            service_time_us: 1,
            queue_length: 0,
            worker_id: 0,
            success: 1,
        }
    }

    #[test]
    fn orphan_response_is_dropped_without_touching_totals() {
        let shared = test_shared(1);
        let mut endpoint = Endpoint::bind("127.0.0.1:0").unwrap();
        complete_request(endpoint.core(), &response_for(99), &shared);
        assert_eq!(shared.orphan_responses.load(Ordering::Relaxed), 1);
        assert_eq!(shared.metrics.lock().total_requests(), 0);
    }

    #[test]
    fn duplicate_response_counts_as_orphan_exactly_once_each() {
        let shared = test_shared(1);
        let mut endpoint = Endpoint::bind("127.0.0.1:0").unwrap();
        shared.pending.lock().insert(
            7,
            PendingRequest {
                client_send_time: 1_000,
                recv_time: 1_500,
                dispatch_time: 1_600,
                deadline: u64::MAX / 2,
                target_worker: 0,
                client_reply: ReqHandle::synthetic(),
            },
        );

        // First response consumes the pending record.
        complete_request(endpoint.core(), &response_for(7), &shared);
        assert_eq!(shared.metrics.lock().total_requests(), 1);
        assert_eq!(shared.orphan_responses.load(Ordering::Relaxed), 0);
        assert!(shared.pending.lock().is_empty());

        // The duplicate finds no record: logged, dropped, totals unchanged.
        complete_request(endpoint.core(), &response_for(7), &shared);
        assert_eq!(shared.metrics.lock().total_requests(), 1);
        assert_eq!(shared.orphan_responses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn completion_refreshes_worker_state() {
        let shared = test_shared(1);
        let mut endpoint = Endpoint::bind("127.0.0.1:0").unwrap();
        {
            let mut states = shared.states.lock();
            states[0].queue_length = 3;
        }
        shared.pending.lock().insert(
            1,
            PendingRequest {
                client_send_time: 1_000,
                recv_time: 1_200,
                dispatch_time: 1_300,
                deadline: u64::MAX / 2,
                target_worker: 0,
                client_reply: ReqHandle::synthetic(),
            },
        );
        complete_request(endpoint.core(), &response_for(1), &shared);
        let states = shared.states.lock();
        assert_eq!(states[0].queue_length, 2);
        assert!(states[0].avg_service_time_ns > 0.0);
        assert!(states[0].deadline_miss_rate < 0.05);
    }

    #[test]
    fn config_from_args_parses_algorithm() {
        use clap::Parser;
        let args = LbArgs::parse_from([
            "lb",
            "--workers",
            "127.0.0.1:40001,127.0.0.1:40002",
            "--algorithm",
            "malcolm",
            "--subnet",
            "127.0.0.",
        ]);
        let config = LbConfig::from_args(&args).unwrap();
        assert_eq!(config.algorithm, Algorithm::Malcolm);
        assert_eq!(config.worker_addresses.len(), 2);
        assert!(config.bind_addr.starts_with("127.0.0.1:"));
    }
}
