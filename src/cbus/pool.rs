//! The worker thread pool and the deferred task records.
//!
//! Task records live in a fixed shared pool; the duplex rings carry only
//! their indices. Ownership of a record travels with its index: the reactor
//! owns it while preparing, the worker that popped the index owns it while
//! running, and the reactor owns it again once the index comes back through
//! the result ring. The `owner`, `abandoned`, `delivered` and `finalizer`
//! fields are reactor-side bookkeeping the workers never touch; the
//! closure, result and panic fields are handed across threads by the ring's
//! release/acquire pairs.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::closure::{Fits, InlineTask, RawBuf};
use crate::clock;
use crate::error::{DeferredPanic, Result};
use crate::pool::{RawHandle, SlotId};

use super::ring::{McspRing, ScmpRing};

/// Inline capacity for the deferred closure and its captures.
pub(crate) const TASK_PAYLOAD: usize = 96;
/// Inline capacity for the closure's output.
pub(crate) const TASK_RESULT: usize = 64;
/// Inline capacity for the reactor-side finalizer.
pub(crate) const FINALIZER_INLINE: usize = 64;

pub(crate) type Finalizer = InlineTask<FINALIZER_INLINE>;

/// Request-ring sentinel telling a worker to exit.
pub(crate) const POISON: u32 = u32::MAX;

////////////////////////////////////////////////////////////////////////////////
// DeferredTask
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct DeferredTask {
    /// Runs the payload closure in place, storing its output or panic into
    /// the record. Executed once, on a worker thread.
    run: Option<unsafe fn(*mut DeferredTask)>,
    /// Drops an unconsumed success value. Present iff the result buffer is
    /// live.
    drop_result: Option<unsafe fn(*mut u8)>,
    payload: RawBuf<TASK_PAYLOAD>,
    result: RawBuf<TASK_RESULT>,
    panic: Option<DeferredPanic>,
    /// The requesting fiber. Reactor-side only.
    pub(crate) owner: RawHandle,
    /// The requester gave up (timeout or kill); the drain path disposes of
    /// the record. Reactor-side only.
    pub(crate) abandoned: bool,
    /// The drain path already handed the record to the requester.
    /// Reactor-side only.
    pub(crate) delivered: bool,
    pub(crate) finalizer: Option<Finalizer>,
    pub(crate) enqueued_at: u64,
    pub(crate) completed_at: u64,
}

impl DeferredTask {
    fn vacant() -> Self {
        Self {
            run: None,
            drop_result: None,
            payload: RawBuf::uninit(),
            result: RawBuf::uninit(),
            panic: None,
            owner: RawHandle {
                id: SlotId(0),
                incarnation: 0,
            },
            abandoned: false,
            delivered: false,
            finalizer: None,
            enqueued_at: 0,
            completed_at: 0,
        }
    }

    /// Installs a fresh request into a free record.
    ///
    /// # Safety
    ///
    /// `t` must point at a record owned by the reactor (freshly taken from
    /// the free list).
    pub(crate) unsafe fn prepare<F, T>(
        t: *mut DeferredTask,
        f: F,
        finalizer: Option<Finalizer>,
        owner: RawHandle,
    ) where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let () = Fits::<F, TASK_PAYLOAD>::CHECK;
        let () = Fits::<T, TASK_RESULT>::CHECK;
        ptr::write((*t).payload.as_ptr().cast::<F>(), f);
        (*t).run = Some(Self::run_erased::<F, T>);
        (*t).drop_result = None;
        (*t).panic = None;
        (*t).owner = owner;
        (*t).abandoned = false;
        (*t).delivered = false;
        (*t).finalizer = finalizer;
        (*t).enqueued_at = clock::cycles();
        (*t).completed_at = 0;
    }

    unsafe fn run_erased<F, T>(t: *mut DeferredTask)
    where
        F: FnOnce() -> T,
    {
        let f = ptr::read((*t).payload.as_ptr().cast::<F>());
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                ptr::write((*t).result.as_ptr().cast::<T>(), value);
                (*t).drop_result = Some(Self::drop_erased::<T>);
            }
            Err(payload) => {
                (*t).panic = Some(describe_panic(payload));
            }
        }
    }

    unsafe fn drop_erased<T>(p: *mut u8) {
        ptr::drop_in_place(p.cast::<T>());
    }

    /// Moves the outcome out of a completed record for the requester.
    ///
    /// # Safety
    ///
    /// `t` must point at a record whose worker run has completed and whose
    /// result has not been taken or dropped yet; `T` must match the type
    /// `prepare` was called with.
    pub(crate) unsafe fn take_result<T>(
        t: *mut DeferredTask,
    ) -> (std::result::Result<T, DeferredPanic>, Option<Finalizer>) {
        let finalizer = (*t).finalizer.take();
        match (*t).panic.take() {
            Some(panic) => (Err(panic), finalizer),
            None => {
                (*t).drop_result = None;
                (Ok(ptr::read((*t).result.as_ptr().cast::<T>())), finalizer)
            }
        }
    }

    /// Disposes of a completed record nobody will read: drops the result in
    /// place and hands the finalizer back to run outside the reactor
    /// borrow.
    ///
    /// # Safety
    ///
    /// `t` must point at a record whose worker run has completed.
    pub(crate) unsafe fn dispose(t: *mut DeferredTask) -> Option<Finalizer> {
        if let Some(drop_result) = (*t).drop_result.take() {
            drop_result((*t).result.as_ptr());
        }
        (*t).panic = None;
        (*t).finalizer.take()
    }
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> DeferredPanic {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker closure panicked with a non-string payload".to_owned()
    };
    DeferredPanic {
        message,
        location: None,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Shared state & workers
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct TaskSlot {
    cell: std::cell::UnsafeCell<DeferredTask>,
}

// Safety: a record is touched by exactly one thread at a time, the handover
// happening through the rings' release/acquire pairs; reactor-only fields
// are never read or written by workers.
unsafe impl Send for TaskSlot {}
unsafe impl Sync for TaskSlot {}

pub(crate) struct Shared {
    /// Requests: reactor produces, workers consume.
    pub(crate) requests: McspRing<u32>,
    /// Results: workers produce, reactor consumes.
    pub(crate) results: ScmpRing<u32>,
    tasks: Box<[TaskSlot]>,
    sleep: Mutex<()>,
    pub(crate) wake: Condvar,
    shutting_down: AtomicBool,
}

impl Shared {
    #[inline(always)]
    pub(crate) fn task_ptr(&self, index: u32) -> *mut DeferredTask {
        self.tasks[index as usize].cell.get()
    }
}

/// The worker thread pool, owned by the reactor.
pub(crate) struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
    /// Reactor-side free list of task indices.
    pub(crate) free_tasks: Vec<u32>,
    /// Tasks handed to the pool and not yet reaped by the result drain.
    pub(crate) inflight: usize,
    /// The recurring result-drain timer, armed while anything is in
    /// flight.
    pub(crate) drain_timer: Option<crate::timer::TimerCookie>,
}

impl ThreadPool {
    pub(crate) fn new(workers: usize, task_count: usize) -> Result<Self> {
        let ring_capacity = (task_count + workers + 2).next_power_of_two();
        let shared = Arc::new(Shared {
            requests: McspRing::new(ring_capacity, workers),
            results: ScmpRing::new(ring_capacity, workers),
            tasks: (0..task_count)
                .map(|_| TaskSlot {
                    cell: std::cell::UnsafeCell::new(DeferredTask::vacant()),
                })
                .collect(),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .spawn(move || worker_main(shared))
                .map_err(crate::error::Error::from)?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: handles,
            free_tasks: (0..task_count as u32).rev().collect(),
            inflight: 0,
            drain_timer: None,
        })
    }

    /// Stops the workers (poison, one per worker) and joins them. Any tasks
    /// still in flight are disposed of without waking anybody; the reactor
    /// is going away. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutting_down.store(true, Ordering::Relaxed);
        for _ in 0..self.workers.len() {
            while !self.shared.requests.push(POISON) {
                self.shared.wake.notify_all();
                thread::yield_now();
            }
        }
        self.shared.wake.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Workers are gone; whatever reached the result ring is disposed
        // here, finalizers included.
        while let Some(index) = self.shared.results.pop() {
            let finalizer = unsafe { DeferredTask::dispose(self.shared.task_ptr(index)) };
            if let Some(finalizer) = finalizer {
                let _ = panic::catch_unwind(AssertUnwindSafe(|| finalizer.call()));
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: Arc<Shared>) {
    block_reactor_signals();
    loop {
        match shared.requests.pop() {
            Some(POISON) => break,
            Some(index) => {
                let t = shared.task_ptr(index);
                // Safety: popping the index transferred ownership of the
                // record to this worker; `run` was installed by `prepare`.
                unsafe {
                    let run = (*t).run.take().expect("task record has no closure");
                    run(t);
                    (*t).completed_at = clock::cycles();
                }
                while !shared.results.push(index) {
                    thread::yield_now();
                }
            }
            None => {
                if shared.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                // Nothing queued: nap until the reactor submits or the
                // timeout polls again.
                let guard = shared.sleep.lock().expect("worker sleep mutex poisoned");
                let _ = shared
                    .wake
                    .wait_timeout(guard, Duration::from_millis(1))
                    .expect("worker sleep mutex poisoned");
            }
        }
    }
}

/// Blocks every signal the reactor cares about so they are all delivered to
/// the reactor thread, never to a worker.
fn block_reactor_signals() {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in [
            libc::SIGHUP,
            libc::SIGINT,
            libc::SIGTERM,
            libc::SIGALRM,
            libc::SIGCHLD,
            libc::SIGPIPE,
            libc::SIGUSR1,
            libc::SIGUSR2,
        ] {
            libc::sigaddset(&mut set, sig);
        }
        for sig in libc::SIGRTMIN()..=libc::SIGRTMAX() {
            libc::sigaddset(&mut set, sig);
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
    }
}
