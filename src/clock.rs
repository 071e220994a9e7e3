//! Monotonic nanosecond clock shared by every node on a host.
//!
//! All timestamps in the system are `u64` nanoseconds from `CLOCK_MONOTONIC`, so a deadline
//! stamped by a client process compares directly against `now_ns()` inside the load balancer or
//! a worker running on the same machine. On non-Linux hosts the clock degrades to a process-local
//! `Instant` epoch, which keeps single-process tests exact but makes cross-process comparisons
//! approximate.

#[cfg(not(target_os = "linux"))]
use std::sync::OnceLock;
#[cfg(not(target_os = "linux"))]
use std::time::Instant;

/// Nanosecond timestamp on the monotonic clock.
pub type Timestamp = u64;

/// Signed nanosecond interval; negative values mean "already in the past".
pub type Nanos = i64;

/// Current monotonic time in nanoseconds.
#[cfg(target_os = "linux")]
#[inline]
pub fn now_ns() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC never fails with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn now_ns() -> Timestamp {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Microseconds to nanoseconds.
#[inline]
pub const fn us_to_ns(us: u64) -> Timestamp {
    us * 1_000
}

/// Milliseconds to nanoseconds.
#[inline]
pub const fn ms_to_ns(ms: u64) -> Timestamp {
    ms * 1_000_000
}

/// Nanoseconds to fractional microseconds.
#[inline]
pub fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / 1_000.0
}

/// Remaining slack before `deadline`; negative once the deadline has passed.
#[inline]
pub fn slack_ns(deadline: Timestamp, now: Timestamp) -> Nanos {
    deadline as i64 - now as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn conversions() {
        assert_eq!(us_to_ns(100), 100_000);
        assert_eq!(ms_to_ns(5), 5_000_000);
        assert_eq!(ns_to_us(2_500), 2.5);
    }

    #[test]
    fn slack_goes_negative_past_deadline() {
        assert_eq!(slack_ns(1_000, 400), 600);
        assert_eq!(slack_ns(400, 1_000), -600);
    }
}
