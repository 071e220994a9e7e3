//! Thread priority and CPU affinity helpers shared by the pipeline threads.

/// Attempt to set a cooperative thread priority on supported platforms.
///
/// On Linux this maps onto the real-time scheduling policies (`SCHED_FIFO`/`SCHED_RR`), which
/// require elevated privileges; the call fails silently without them. Priority 0 restores the
/// default `SCHED_OTHER` policy.
pub fn set_thread_priority(priority: i32) {
    #[cfg(target_os = "linux")]
    {
        use libc::{
            pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR,
        };
        use std::mem;

        let (policy, sched_priority) = if priority >= 3 {
            (SCHED_FIFO, 90)
        } else if priority == 2 {
            (SCHED_FIFO, 70)
        } else if priority == 1 {
            (SCHED_RR, 30)
        } else {
            (SCHED_OTHER, 0)
        };

        unsafe {
            let mut param: sched_param = mem::zeroed();
            param.sched_priority = sched_priority;
            let _ = pthread_setschedparam(pthread_self(), policy, &param);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = priority;
    }
}

/// Attempt to pin the current thread to a specific core when supported.
///
/// The experiment assumes pinned cores with reserved CPUs; on hosts where pinning is not
/// permitted the call fails silently and the scheduler places threads as usual.
pub fn set_thread_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        let _ = pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}
