//! Wall-clock timers.
//!
//! Callbacks are scheduled on the reactor's cascading time queue with
//! [`call_at`], [`call_in`] and [`call_every`] and revoked with [`cancel`].
//! They run on the scheduler context under an implicit critical section, so
//! a timer callback must not suspend; it may freely [`resume`] fibers,
//! spawn new ones or re-arm timers, including cancelling its own cookie.
//!
//! Timers only fire while the ready queue is empty: a fiber that never
//! yields starves them, which is the cooperative contract of the runtime.
//! Callbacks are expected to be short; the reactor logs a warning past one
//! duration threshold and an error past a higher one (see
//! [`Options`](crate::reactor::Options)).
//!
//! [`resume`]: crate::fiber::resume

use std::time::Duration;

use crate::clock;
use crate::error::Result;
use crate::pool::RawHandle;
use crate::reactor::{self, CriticalGuard};
use crate::time::Instant;

pub(crate) mod wheel;

use wheel::{Repeat, TimerCallback};

/// Revocation token of a scheduled timer. Weak like a fiber handle: stale
/// after the timer fired (one-shots) or was cancelled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerCookie(RawHandle);

/// Schedules `f` to run once when the monotonic clock reaches `deadline`.
///
/// A deadline in the past fires on the next dispatch. Fails with
/// [`TooFarAhead`](crate::error::Error::TooFarAhead) when the deadline lies
/// beyond the time queue's total span and with
/// [`PoolDepleted`](crate::error::Error::PoolDepleted) when the entry pool
/// is exhausted.
pub fn call_at<F>(deadline: Instant, f: F) -> Result<TimerCookie>
where
    F: FnMut() + 'static,
{
    insert(deadline.as_cycles(), Repeat::No, TimerCallback::new(f))
}

/// Schedules `f` to run once, `delay` from now.
pub fn call_in<F>(delay: Duration, f: F) -> Result<TimerCookie>
where
    F: FnMut() + 'static,
{
    call_at(Instant::now().saturating_add(delay), f)
}

/// Schedules `f` to run every `interval`, first firing one interval from
/// now.
///
/// With `aligned` the next deadline snaps to the `first + k * interval`
/// grid so dispatch jitter does not accumulate; otherwise each firing is
/// scheduled `interval` after the previous one actually ran.
pub fn call_every<F>(interval: Duration, f: F, aligned: bool) -> Result<TimerCookie>
where
    F: FnMut() + 'static,
{
    assert!(
        !interval.is_zero(),
        "a periodic timer interval must be positive"
    );
    let cycles = clock::duration_to_cycles(interval);
    let repeat = if aligned {
        Repeat::Aligned(cycles)
    } else {
        Repeat::Unaligned(cycles)
    };
    insert(
        Instant::now().saturating_add(interval).as_cycles(),
        repeat,
        TimerCallback::new(f),
    )
}

/// Revokes a scheduled timer in O(1). Returns whether a live entry was
/// cancelled; safe to call with a stale cookie, including from inside the
/// timer's own callback.
pub fn cancel(cookie: TimerCookie) -> bool {
    reactor::with(|r| r.wheel.cancel(cookie.0)).unwrap_or(false)
}

fn insert(deadline_cycles: u64, repeat: Repeat, callback: TimerCallback) -> Result<TimerCookie> {
    let raw = reactor::with(|r| r.wheel.insert(deadline_cycles, repeat, callback))??;
    Ok(TimerCookie(raw))
}

/// Arms a runtime-internal unaligned periodic timer. Internal entries do
/// not keep [`mainloop`](crate::reactor::mainloop) alive.
pub(crate) fn arm_internal<F>(interval: Duration, f: F) -> Result<TimerCookie>
where
    F: FnMut() + 'static,
{
    let cookie = call_every(interval, f, false)?;
    reactor::with(|r| r.internal_timers += 1)?;
    Ok(cookie)
}

/// Cancels an internal timer, adjusting the internal count.
pub(crate) fn cancel_internal(cookie: TimerCookie) {
    if cancel(cookie) {
        let _ = reactor::with(|r| r.internal_timers -= 1);
    }
}

/// The timer-callbacks role of the scheduler: pops every due entry and
/// invokes its callback, re-arming periodic ones. Runs under a critical
/// section for the whole drain; durations are policed against the
/// configured thresholds.
pub(crate) fn dispatch_due() {
    let _cs = CriticalGuard::enter();
    let (warn, error) = match reactor::with(|r| {
        (
            clock::duration_to_cycles(r.options.timer_callback_warn),
            clock::duration_to_cycles(r.options.timer_callback_error),
        )
    }) {
        Ok(thresholds) => thresholds,
        Err(_) => return,
    };

    loop {
        let now = clock::cycles();
        let due = reactor::with(|r| {
            r.wheel
                .pop_due(now)
                .map(|id| (id, r.wheel.take_callback(id)))
        });
        let (id, mut callback) = match due {
            Ok(Some(entry)) => entry,
            _ => break,
        };

        let started = clock::cycles();
        callback.call();
        let took = clock::cycles().saturating_sub(started);
        if took >= error {
            log::error!(
                "timer callback ran for {:?}",
                clock::cycles_to_duration(took)
            );
        } else if took >= warn {
            log::warn!(
                "timer callback ran for {:?}",
                clock::cycles_to_duration(took)
            );
        }

        let _ = reactor::with(|r| r.wheel.finish_dispatch(id, callback, clock::cycles()));
    }
}
