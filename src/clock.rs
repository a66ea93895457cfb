//! The `clock` module returns time values derived from the POSIX
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! family of functions.
//!
//! The runtime keeps all of its own time arithmetic in *cycles*: an opaque
//! `u64` count of monotonic nanoseconds. Cycles never go backwards and never
//! observe wall-clock adjustments, which makes them safe to feed into the
//! cascading time queue. External callers convert to and from
//! [`Duration`](std::time::Duration) at the API boundary, see
//! [`crate::time::Instant`].
//!
//! - [cycles()](fn.cycles.html) - Get the monotonic time in cycles
//! - [monotonic()](fn.monotonic.html) - Get the monotonic time in seconds
//! - [time()](fn.time.html) - Get the wall clock time in seconds
//! - [process()](fn.process.html) - Get the processor time in seconds
//! - [thread()](fn.thread.html) - Get the thread time in seconds

use std::mem::MaybeUninit;
use std::time::Duration;

pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Number of cycles per second. One cycle is one nanosecond of the
/// monotonic clock.
pub const CYCLES_PER_SEC: u64 = 1_000_000_000;

#[inline]
fn gettime(clock_id: libc::clockid_t) -> libc::timespec {
    unsafe {
        let mut timespec = MaybeUninit::<libc::timespec>::zeroed().assume_init();
        if libc::clock_gettime(clock_id, &mut timespec as *mut _) != 0 {
            let err = std::io::Error::last_os_error();
            panic!("failed to get time: {}", err)
        }
        timespec
    }
}

#[inline]
fn as_secs(ts: libc::timespec) -> f64 {
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

#[inline]
fn as_nanos(ts: libc::timespec) -> u64 {
    ts.tv_sec as u64 * CYCLES_PER_SEC + ts.tv_nsec as u64
}

/// The monotonic time in cycles.
///
/// Derived from C function `clock_gettime(CLOCK_MONOTONIC)`. This is the
/// timestamp the reactor, the time queue and all timeout bookkeeping run on.
///
/// Return: nanoseconds since an unspecified point in the past (boot time on
/// Linux), monotonically nondecreasing.
#[inline(always)]
pub fn cycles() -> u64 {
    as_nanos(gettime(libc::CLOCK_MONOTONIC))
}

/// Convert a [`Duration`] into cycles, saturating at `u64::MAX`.
#[inline(always)]
pub fn duration_to_cycles(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(CYCLES_PER_SEC)
        .saturating_add(duration.subsec_nanos() as u64)
}

/// Convert cycles into a [`Duration`].
#[inline(always)]
pub fn cycles_to_duration(cycles: u64) -> Duration {
    Duration::new(cycles / CYCLES_PER_SEC, (cycles % CYCLES_PER_SEC) as u32)
}

/// The wall clock time in seconds.
///
/// Derived from C function `clock_gettime(CLOCK_REALTIME)`.
/// This is the best function for knowing what the official time is, as
/// determined by the system administrator. It is affected by NTP and manual
/// adjustments and must not be used for timeouts.
///
/// Return: seconds since epoch (1970-01-01 00:00:00), adjusted.
#[inline(always)]
pub fn time() -> f64 {
    as_secs(gettime(libc::CLOCK_REALTIME))
}

/// The wall clock time in nanoseconds since epoch.
///
/// See: [time()](fn.time.html)
#[inline(always)]
pub fn time64() -> u64 {
    as_nanos(gettime(libc::CLOCK_REALTIME))
}

/// The monotonic time in seconds.
///
/// Monotonic time is similar to wall clock time but is not affected by
/// changes to or from daylight saving time, or by changes done by a user.
/// This is the best function to use with benchmarks that need to calculate
/// elapsed time.
#[inline(always)]
pub fn monotonic() -> f64 {
    as_secs(gettime(libc::CLOCK_MONOTONIC))
}

/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic64() -> u64 {
    cycles()
}

/// The processor time in seconds.
///
/// Derived from C function `clock_gettime(CLOCK_PROCESS_CPUTIME_ID)`.
/// This is the best function to use with benchmarks that need to calculate
/// the amount of time for which the CPU was used.
#[inline(always)]
pub fn process() -> f64 {
    as_secs(gettime(libc::CLOCK_PROCESS_CPUTIME_ID))
}

/// See: [process()](fn.process.html)
#[inline(always)]
pub fn process64() -> u64 {
    as_nanos(gettime(libc::CLOCK_PROCESS_CPUTIME_ID))
}

/// The thread time in seconds.
///
/// Derived from C function `clock_gettime(CLOCK_THREAD_CPUTIME_ID)`.
#[inline(always)]
pub fn thread() -> f64 {
    as_secs(gettime(libc::CLOCK_THREAD_CPUTIME_ID))
}

/// See: [thread()](fn.thread.html)
#[inline(always)]
pub fn thread64() -> u64 {
    as_nanos(gettime(libc::CLOCK_THREAD_CPUTIME_ID))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonicity() {
        let a = cycles();
        let b = cycles();
        assert!(b >= a);
    }

    #[test]
    fn duration_round_trip() {
        let d = Duration::new(3, 141_592_653);
        assert_eq!(cycles_to_duration(duration_to_cycles(d)), d);
        assert_eq!(duration_to_cycles(Duration::ZERO), 0);
    }

    #[test]
    fn saturating_conversion() {
        assert_eq!(duration_to_cycles(Duration::MAX), u64::MAX);
    }
}
