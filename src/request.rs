//! Request, task and trace types shared by all three tiers.

use crate::clock::{slack_ns, Nanos, Timestamp};
use crate::transport::ReqHandle;
use std::fmt;

/// Workload request classes ordered from lightest to heaviest service cost.
///
/// The ordering is stable so tables indexed by `index()` never need to branch on specific labels;
/// adding a class only requires appending it to [`RequestType::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestType {
    Get,
    Put,
    Scan,
    Compute,
}

impl RequestType {
    /// Ordered list of all request types for iteration utilities.
    pub const ALL: [RequestType; 4] = [
        RequestType::Get,
        RequestType::Put,
        RequestType::Scan,
        RequestType::Compute,
    ];

    /// Stable index for type-based arrays.
    pub const fn index(self) -> usize {
        match self {
            RequestType::Get => 0,
            RequestType::Put => 1,
            RequestType::Scan => 2,
            RequestType::Compute => 3,
        }
    }

    /// Service-time multiplier applied by the worker simulator.
    pub const fn service_multiplier(self) -> f64 {
        match self {
            RequestType::Get => 1.0,
            RequestType::Put => 1.2,
            RequestType::Scan => 2.0,
            RequestType::Compute => 1.5,
        }
    }

    /// Wire encoding of the type tag.
    pub const fn as_u8(self) -> u8 {
        self.index() as u8
    }

    /// Decode a wire type tag, mapping unknown tags to `Get`.
    pub fn from_u8(raw: u8) -> RequestType {
        match raw {
            1 => RequestType::Put,
            2 => RequestType::Scan,
            3 => RequestType::Compute,
            _ => RequestType::Get,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestType::Get => "get",
            RequestType::Put => "put",
            RequestType::Scan => "scan",
            RequestType::Compute => "compute",
        };
        write!(f, "{label}")
    }
}

/// A deadline-carrying request, immutable along the client → LB → worker path.
#[derive(Debug, Clone)]
pub struct Request {
    /// Monotonic per-client id.
    pub request_id: u64,
    /// Client-clock send timestamp (ns).
    pub client_send_time: Timestamp,
    /// Absolute deadline in the client clock domain; always > `client_send_time`.
    pub deadline: Timestamp,
    /// Generator's expected service time in microseconds.
    pub service_time_hint_us: u32,
    pub request_type: RequestType,
    pub client_id: u8,
    pub payload_size: u16,
}

impl Request {
    /// Remaining slack at `now`; negative once expired.
    pub fn slack(&self, now: Timestamp) -> Nanos {
        slack_ns(self.deadline, now)
    }
}

/// Worker-side task: the request fields plus local accounting filled in as the
/// task moves through the admission queue and the compute pool.
#[derive(Debug)]
pub struct Task {
    pub request_id: u64,
    pub client_send_time: Timestamp,
    pub deadline: Timestamp,
    pub service_time_hint_us: u32,
    pub request_type: RequestType,
    pub payload_size: u16,
    /// I/O-thread receive timestamp.
    pub arrival_time: Timestamp,
    /// Set by the compute thread when service simulation finishes.
    pub worker_done_time: Timestamp,
    /// Measured busy-wait duration (ns).
    pub actual_service_time_ns: u64,
    /// Time spent in the admission queue before a compute thread picked it up.
    pub queue_time_ns: u64,
    /// Transport handle used by the I/O thread to emit the response.
    pub request_handle: ReqHandle,
}

impl Task {
    /// Remaining slack at `now`; negative once expired.
    pub fn slack(&self, now: Timestamp) -> Nanos {
        slack_ns(self.deadline, now)
    }

    /// Whether the deadline already passed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.deadline <= now
    }
}

/// Seven-timestamp chain for one completed request.
///
/// `t1..t3` and `t6..t7` are in the LB/client clock domain, `t4..t5` in the worker's; with a
/// shared monotonic host clock the chain is totally ordered, and the derived metrics only ever
/// subtract within a domain or across the full round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTrace {
    pub request_id: u64,
    pub deadline: Timestamp,
    pub t1_client_send: Timestamp,
    pub t2_lb_receive: Timestamp,
    pub t3_lb_dispatch: Timestamp,
    pub t4_worker_recv: Timestamp,
    pub t5_worker_done: Timestamp,
    pub t6_lb_response: Timestamp,
    pub t7_client_recv: Timestamp,
    pub target_worker_id: u8,
}

impl RequestTrace {
    /// End-to-end latency (ns).
    pub fn e2e_latency_ns(&self) -> u64 {
        self.t7_client_recv.saturating_sub(self.t1_client_send)
    }

    /// Time spent inside the LB between receive and dispatch.
    pub fn lb_overhead_ns(&self) -> u64 {
        self.t3_lb_dispatch.saturating_sub(self.t2_lb_receive)
    }

    /// Slack at completion; positive means the deadline was met with room to spare.
    pub fn slack_ns(&self) -> Nanos {
        slack_ns(self.deadline, self.t7_client_recv)
    }

    /// Whether the response arrived after the deadline.
    pub fn is_deadline_miss(&self) -> bool {
        self.slack_ns() < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_index_is_stable() {
        assert_eq!(RequestType::Get.index(), 0);
        assert_eq!(RequestType::Compute.index(), 3);
        for ty in RequestType::ALL {
            assert_eq!(RequestType::from_u8(ty.as_u8()), ty);
        }
    }

    #[test]
    fn unknown_wire_tag_defaults_to_get() {
        assert_eq!(RequestType::from_u8(200), RequestType::Get);
    }

    #[test]
    fn trace_derivations() {
        let trace = RequestTrace {
            request_id: 7,
            deadline: 1_000,
            t1_client_send: 100,
            t2_lb_receive: 150,
            t3_lb_dispatch: 175,
            t4_worker_recv: 200,
            t5_worker_done: 700,
            t6_lb_response: 750,
            t7_client_recv: 800,
            target_worker_id: 2,
        };
        assert_eq!(trace.e2e_latency_ns(), 700);
        assert_eq!(trace.lb_overhead_ns(), 25);
        assert_eq!(trace.slack_ns(), 200);
        assert!(!trace.is_deadline_miss());

        let late = RequestTrace {
            t7_client_recv: 1_500,
            ..trace
        };
        assert!(late.is_deadline_miss());
    }
}
