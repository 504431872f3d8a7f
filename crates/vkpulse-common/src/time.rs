//! Timestamps and thread ids in the shapes the profiler correlates on.
//!
//! CPU timestamps must come from CLOCK_MONOTONIC so the out-of-process
//! consumer can line them up with its own samples; a process-local
//! `Instant` has no cross-process meaning.

/// Nanoseconds on the monotonic clock.
pub fn monotonic_timestamp_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// OS thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> i32 {
    unsafe { libc::gettid() }
}

/// OS thread id of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> i32 {
    // No gettid on this platform; the process id still groups events.
    std::process::id() as i32
}
