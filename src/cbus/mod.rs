//! The bridge between the reactor thread and its worker thread pool.
//!
//! A fiber that must run genuinely blocking code (a synchronous syscall, a
//! long computation) hands it to [`defer_to_thread`]: the closure is copied
//! into a fixed task record, its index travels to a worker through the
//! request ring, and the fiber suspends. Workers push finished indices into
//! the result ring; a recurring reactor timer drains it and resumes each
//! requesting fiber, which then picks its typed result (or the re-raised
//! worker panic) out of the record.
//!
//! ```text
//!  reactor thread                        worker threads
//! ┌───────────────┐   requests (MCSP)   ┌──────────────┐
//! │ defer_to_thread├──────────────────► │  run closure │
//! │   (suspends)  │                     │              │
//! │ result drain  │ ◄──────────────────┤  push result │
//! └───────────────┘   results (SCMP)    └──────────────┘
//! ```
//!
//! If the requesting fiber is killed or times out while its closure is
//! still running, the record is marked abandoned; the worker completes
//! normally and the drain path releases the slot, so a worker never writes
//! to freed memory. An optional *finalizer* closure runs on the reactor
//! exactly once when the task completes, whether or not the requester is
//! still there to see the result.

mod pool;
pub(crate) mod ring;

pub(crate) use pool::ThreadPool;

use pool::{DeferredTask, Finalizer};

use crate::clock;
use crate::error::{Error, Result};
use crate::fiber::{self, FiberHandle};
use crate::reactor;
use crate::time::Timeout;
use crate::timer;

/// Runs `f` on a worker thread while the calling fiber suspends, returning
/// the closure's output as if it were a local call.
///
/// A panic on the worker is caught, carried back and re-raised here as
/// [`Error::DeferredTaskFailed`]. On timeout the call returns
/// [`Error::Timeout`] and the task is disowned: the worker finishes on its
/// own and the runtime reclaims the record afterwards.
///
/// Fails with [`Error::ThreadPoolDisabled`] when the reactor was opened
/// with `thread_pool_workers = 0`.
pub fn defer_to_thread<F, T>(f: F, timeout: Timeout) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    defer_inner(f, None, timeout)
}

/// Like [`defer_to_thread`], additionally running `finalizer` on the
/// reactor thread exactly once when the task completes — even if the
/// requesting fiber was killed or timed out in the meantime. The place for
/// cleanup that must not be skipped.
pub fn defer_with_finalizer<F, T, G>(f: F, finalizer: G, timeout: Timeout) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    G: FnOnce() + 'static,
{
    defer_inner(f, Some(Finalizer::new(finalizer)), timeout)
}

fn defer_inner<F, T>(f: F, finalizer: Option<Finalizer>, timeout: Timeout) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let me = fiber::current().ok_or(Error::ReactorClosed)?;

    let (index, shared) = reactor::with(|r| {
        let pool = r.cbus.as_mut().ok_or(Error::ThreadPoolDisabled)?;
        let index = pool
            .free_tasks
            .pop()
            .ok_or(Error::PoolDepleted("deferred task"))?;
        // Safety: the index came off the free list, the record is ours.
        unsafe { DeferredTask::prepare(pool.shared.task_ptr(index), f, finalizer, me.raw) };
        if !pool.shared.requests.push(index) {
            pool.free_tasks.push(index);
            return Err(Error::PoolDepleted("thread pool request queue"));
        }
        pool.inflight += 1;
        Ok((index, std::sync::Arc::clone(&pool.shared)))
    })??;
    let mut guard = TaskGuard {
        index,
        armed: true,
    };
    shared.wake.notify_one();
    ensure_drain_timer()?;

    // Only the drain hands the record back; a resume from anywhere else is
    // spurious and we keep waiting.
    loop {
        fiber::suspend(timeout)?;
        let delivered = reactor::with(|r| {
            let pool = r
                .cbus
                .as_ref()
                .expect("thread pool vanished under a deferred task");
            unsafe { (*pool.shared.task_ptr(index)).delivered }
        })?;
        if delivered {
            break;
        }
    }
    guard.armed = false;

    // The record is ours again, result included.
    let (outcome, finalizer) = reactor::with(|r| {
        let pool = r
            .cbus
            .as_mut()
            .expect("thread pool vanished under a deferred task");
        // Safety: `delivered` was set by the drain after the worker's
        // release; `T` is the type `prepare` installed.
        let taken = unsafe { DeferredTask::take_result::<T>(pool.shared.task_ptr(index)) };
        pool.free_tasks.push(index);
        taken
    })?;
    if let Some(finalizer) = finalizer {
        finalizer.call();
    }
    outcome.map_err(|panic| panic.into_error())
}

/// Restores task ownership when `defer_inner` leaves early: on an `Err`
/// return or a kill unwinding through the suspend.
struct TaskGuard {
    index: u32,
    armed: bool,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let index = self.index;
        let finalizer = reactor::try_with(|r| {
            let pool = r.cbus.as_mut()?;
            let t = pool.shared.task_ptr(index);
            // Safety: reactor-side fields of a record we submitted.
            unsafe {
                if (*t).delivered {
                    // The drain already handed the record back to us; we
                    // are the one who must dispose of it.
                    let finalizer = DeferredTask::dispose(t);
                    pool.free_tasks.push(index);
                    finalizer
                } else {
                    (*t).abandoned = true;
                    None
                }
            }
        })
        .flatten();
        if let Some(finalizer) = finalizer {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| finalizer.call()));
        }
    }
}

/// Arms the recurring result-drain timer unless a previous request already
/// left it armed.
fn ensure_drain_timer() -> Result<()> {
    let needed = reactor::with(|r| {
        let resolution = r.options.timer_resolution;
        match &r.cbus {
            Some(pool) if pool.drain_timer.is_none() => Some(resolution),
            _ => None,
        }
    })?;
    if let Some(interval) = needed {
        let cookie = timer::arm_internal(interval, drain_results)?;
        reactor::with(|r| {
            if let Some(pool) = r.cbus.as_mut() {
                pool.drain_timer = Some(cookie);
            }
        })?;
    }
    Ok(())
}

enum DrainAction {
    Resume(FiberHandle),
    Finalize(Option<Finalizer>),
}

/// The recurring drain: pops every completed task index and either resumes
/// the owner fiber or, when the owner is gone, disposes of the record in
/// place. Cancels its own timer once nothing is in flight.
fn drain_results() {
    loop {
        let action = reactor::with(|r| {
            let pool = r.cbus.as_mut()?;
            let index = pool.shared.results.pop()?;
            pool.inflight -= 1;
            let t = pool.shared.task_ptr(index);
            // Safety: the result-ring pop transferred the record back to
            // the reactor.
            unsafe {
                log::debug!(
                    "deferred task finished in {:?}",
                    clock::cycles_to_duration((*t).completed_at.saturating_sub((*t).enqueued_at))
                );
                if (*t).abandoned || !r.fibers.is_valid((*t).owner) {
                    // The requester is gone; the completion path owns the
                    // cleanup.
                    let finalizer = DeferredTask::dispose(t);
                    pool.free_tasks.push(index);
                    Some(DrainAction::Finalize(finalizer))
                } else {
                    (*t).delivered = true;
                    Some(DrainAction::Resume(FiberHandle { raw: (*t).owner }))
                }
            }
        });
        match action {
            Ok(Some(DrainAction::Resume(h))) => {
                fiber::resume(h);
            }
            Ok(Some(DrainAction::Finalize(finalizer))) => {
                if let Some(finalizer) = finalizer {
                    finalizer.call();
                }
            }
            _ => break,
        }
    }

    // Idle again: stop burning a wheel slot until the next request.
    let idle_cookie = reactor::with(|r| match r.cbus.as_mut() {
        Some(pool) if pool.inflight == 0 => pool.drain_timer.take(),
        _ => None,
    })
    .unwrap_or(None);
    if let Some(cookie) = idle_cookie {
        timer::cancel_internal(cookie);
    }
}
