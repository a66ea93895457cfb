//! The reactor: a single-threaded event loop driving fibers, timers and
//! descriptor readiness.
//!
//! Each OS thread may own at most one reactor, opened with [`open`] and torn
//! down with [`close`]. [`mainloop`] runs the scheduler on the opening
//! thread: it pops ready fibers round-robin, drains expired timers when the
//! ready queue runs dry, and parks in the kernel for at most
//! *time-to-next-timer* when there is nothing else to do. The calling
//! context doubles as the built-in `main` fiber; the idle parking and the
//! timer-callback dispatch are the other two built-in roles it plays.
//!
//! The loop returns when [`stop`] is requested or when nothing can ever run
//! again: no live fiber, no armed timer, no registered descriptor and no
//! deferred task in flight.
//!
//! A panic escaping a fiber body is caught by the fiber wrapper and
//! re-raised here, in the main loop, which normally terminates the program
//! with the original message.

use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::panic;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::cbus::ThreadPool;
use crate::clock;
use crate::coio::CoIo;
use crate::error::{Error, Result};
use crate::fiber::{self, FiberRecord, FiberState};
use crate::list::List;
use crate::log::{say, Severity};
use crate::pool::{Pool, SlotId};
use crate::timer;
use crate::timer::wheel::Wheel;

/// The wheel geometry of a reactor instance: 256 bins over 4 levels. At the
/// default millisecond resolution the deepest level reaches several weeks
/// out.
pub(crate) type ReactorWheel = Wheel<256, 4>;

////////////////////////////////////////////////////////////////////////////////
// Options
////////////////////////////////////////////////////////////////////////////////

/// Reactor construction parameters, consumed by [`open`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Capacity of the fiber pool. [`fiber::spawn`] fails with
    /// `PoolDepleted` beyond it.
    pub max_fibers: usize,
    /// Default usable stack size per fiber, rounded up to a page. A guard
    /// page is added on top.
    pub fiber_stack_size: usize,
    /// Granularity of the timer wheel. Deadlines are rounded up to it.
    pub timer_resolution: Duration,
    /// Capacity of the timer entry pool (user timers plus one per currently
    /// suspended-with-timeout fiber).
    pub max_timers: usize,
    /// Capacity of the descriptor context pool.
    pub max_fd_contexts: usize,
    /// Worker OS threads behind `defer_to_thread`. Zero disables the thread
    /// pool entirely.
    pub thread_pool_workers: usize,
    /// Capacity of the deferred task pool.
    pub max_deferred_tasks: usize,
    /// Arms a SIGRTMIN watchdog that aborts the process when the main loop
    /// has not advanced for this long. `None` disables it.
    pub hang_detector_grace: Option<Duration>,
    /// Periodically releases the backing pages of fiber stacks parked on
    /// the free list. `None` disables the sweep.
    pub gc_interval: Option<Duration>,
    /// Installs a SIGSEGV handler that recognizes guard-page hits and
    /// reports them as fiber stack overflows before aborting.
    pub setup_segfault_handler: bool,
    /// Timer callbacks running longer than this are logged as warnings.
    pub timer_callback_warn: Duration,
    /// ... and longer than this as errors.
    pub timer_callback_error: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_fibers: 1024,
            fiber_stack_size: 64 * 1024,
            timer_resolution: Duration::from_millis(1),
            max_timers: 4096,
            max_fd_contexts: 1024,
            thread_pool_workers: 4,
            max_deferred_tasks: 256,
            hang_detector_grace: None,
            gc_interval: None,
            setup_segfault_handler: false,
            timer_callback_warn: Duration::from_micros(50),
            timer_callback_error: Duration::from_micros(200),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Reactor
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Reactor {
    pub(crate) options: Options,
    pub(crate) fibers: Pool<FiberRecord>,
    pub(crate) ready: List,
    pub(crate) blocked: List,
    /// The fiber currently running, `None` on the scheduler context.
    pub(crate) current: Option<SlotId>,
    /// Saved stack pointer of the scheduler context while a fiber runs.
    pub(crate) sched_sp: usize,
    /// Reentrant critical-section counter; while non-zero any suspension
    /// attempt is a fatal logic error.
    pub(crate) critical: u32,
    pub(crate) stop_requested: bool,
    in_mainloop: bool,
    /// A panic that escaped a fiber, to be re-raised by the main loop.
    pub(crate) pending_panic: Option<Box<dyn Any + Send>>,
    pub(crate) wheel: ReactorWheel,
    /// Armed wheel entries belonging to the runtime itself (stack GC sweep,
    /// thread-pool result drain); excluded from the loop exit condition.
    pub(crate) internal_timers: usize,
    pub(crate) coio: CoIo,
    pub(crate) cbus: Option<ThreadPool>,
    watchdog: Option<Watchdog>,
    alt_stack: Option<AltStack>,
}

impl Reactor {
    /// Whether nothing can ever become runnable again.
    fn is_drained(&mut self) -> bool {
        self.fibers.live() == 0
            && self.wheel.len() <= self.internal_timers
            && self.coio.live() == 0
            && self.cbus.as_ref().map_or(true, |p| p.inflight == 0)
    }
}

thread_local! {
    static REACTOR: RefCell<Option<Box<Reactor>>> = RefCell::new(None);
}

/// Runs `f` with the reactor of the current thread.
///
/// The borrow is released when `f` returns; nothing that can reach another
/// `with` (user callbacks, context switches) may run inside `f`.
pub(crate) fn with<R>(f: impl FnOnce(&mut Reactor) -> R) -> Result<R> {
    REACTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_deref_mut() {
            Some(r) => Ok(f(r)),
            None => Err(Error::ReactorClosed),
        }
    })
}

/// Non-panicking variant of [`with`] for paths that may run while the
/// reactor is already borrowed (the logger). Returns `None` in that case.
pub(crate) fn try_with<R>(f: impl FnOnce(&mut Reactor) -> R) -> Option<R> {
    REACTOR.with(|cell| {
        let mut slot = cell.try_borrow_mut().ok()?;
        slot.as_deref_mut().map(f)
    })
}

/// Whether a reactor is open on the current thread.
pub fn is_open() -> bool {
    REACTOR.with(|cell| match cell.try_borrow() {
        Ok(slot) => slot.is_some(),
        // Borrowed means somebody is using it, so it exists.
        Err(_) => true,
    })
}

////////////////////////////////////////////////////////////////////////////////
// Lifecycle
////////////////////////////////////////////////////////////////////////////////

/// Opens a reactor on the current thread.
///
/// Fails if one is already open here. All pools are allocated up front;
/// nothing else happens until [`mainloop`] runs.
pub fn open(options: Options) -> Result<()> {
    assert!(options.max_fibers >= 1, "max_fibers must be positive");
    assert!(options.max_timers >= 1, "max_timers must be positive");
    assert!(
        options.max_fd_contexts >= 1,
        "max_fd_contexts must be positive"
    );
    assert!(
        !options.timer_resolution.is_zero(),
        "timer_resolution must be positive"
    );

    let gc_interval = options.gc_interval;
    REACTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(Error::other("a reactor is already open on this thread"));
        }
        let now = clock::cycles();
        let resolution = clock::duration_to_cycles(options.timer_resolution).max(1);
        let coio = CoIo::new(options.max_fd_contexts)?;
        let cbus = if options.thread_pool_workers > 0 {
            Some(ThreadPool::new(
                options.thread_pool_workers,
                options.max_deferred_tasks,
            )?)
        } else {
            None
        };
        let mut reactor = Box::new(Reactor {
            fibers: Pool::new(options.max_fibers, |_| FiberRecord::vacant()),
            ready: List::new(),
            blocked: List::new(),
            current: None,
            sched_sp: 0,
            critical: 0,
            stop_requested: false,
            in_mainloop: false,
            pending_panic: None,
            wheel: ReactorWheel::new(options.max_timers, resolution, now),
            internal_timers: 0,
            coio,
            cbus,
            watchdog: None,
            alt_stack: None,
            options,
        });
        if reactor.options.setup_segfault_handler {
            reactor.alt_stack = Some(AltStack::install()?);
        }
        if let Some(grace) = reactor.options.hang_detector_grace {
            reactor.watchdog = Some(Watchdog::install(grace)?);
        }
        *slot = Some(reactor);
        Ok(())
    })?;

    // The GC sweep is an ordinary periodic timer; arming it needs the
    // reactor registered first.
    if let Some(interval) = gc_interval {
        timer::arm_internal(interval, || {
            let _ = with(|r| {
                for i in 0..r.fibers.capacity() as u32 {
                    let id = SlotId(i);
                    if !r.fibers.is_allocated(id) {
                        r.fibers.get_mut(id).reclaim_stack();
                    }
                }
            });
        })?;
    }
    log::debug!("reactor open");
    Ok(())
}

/// Tears the reactor down: stops the worker threads, closes the readiness
/// notifier and releases every pool.
///
/// Must be called on the opening thread after [`mainloop`] has returned.
/// Fibers still suspended at this point are discarded without unwinding;
/// their stacks are unmapped as-is.
pub fn close() -> Result<()> {
    let mut reactor = REACTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.take() {
            Some(r) => {
                if r.in_mainloop {
                    *slot = Some(r);
                    return Err(Error::other("cannot close the reactor from inside mainloop"));
                }
                Ok(r)
            }
            None => Err(Error::ReactorClosed),
        }
    })?;
    if let Some(mut pool) = reactor.cbus.take() {
        pool.shutdown();
    }
    if let Some(watchdog) = reactor.watchdog.take() {
        watchdog.uninstall();
    }
    if let Some(alt_stack) = reactor.alt_stack.take() {
        alt_stack.uninstall();
    }
    let leaked = reactor.fibers.live();
    drop(reactor);
    if leaked > 0 {
        log::warn!("reactor closed with {leaked} fibers still alive, their stacks were discarded");
    } else {
        log::debug!("reactor closed");
    }
    Ok(())
}

/// Requests [`mainloop`] to return at its next iteration. Callable from any
/// fiber or callback on the reactor thread; a no-op when nothing is open.
pub fn stop() {
    let _ = with(|r| r.stop_requested = true);
}

/// Runs the scheduler until [`stop`] is requested or all work is drained.
pub fn mainloop() -> Result<()> {
    with(|r| {
        assert!(
            r.current.is_none(),
            "mainloop must not be entered from a fiber"
        );
        assert!(!r.in_mainloop, "mainloop is already running");
        r.in_mainloop = true;
        r.stop_requested = false;
    })?;

    loop {
        LOOP_TICK.store(clock::cycles(), Ordering::Relaxed);
        repanic_if_pending()?;
        if with(|r| r.stop_requested)? {
            break;
        }

        // Expired timers are dispatched once the ready fibers have had
        // their turn.
        let now = clock::cycles();
        let (ready_empty, timers_due) = with(|r| (r.ready.is_empty(), r.wheel.has_due(now)))?;
        if ready_empty && timers_due {
            timer::dispatch_due();
        }

        if with(|r| r.ready.is_empty())? {
            if with(Reactor::is_drained)? {
                break;
            }
            idle_park()?;
            continue;
        }

        schedule_next();
    }

    with(|r| r.in_mainloop = false)?;
    Ok(())
}

/// Opens a reactor, runs `f` as its first fiber, drives the loop until all
/// work is drained (or [`stop`] is called) and closes. The convenience
/// entrypoint used all over the test suite.
pub fn run<F>(options: Options, f: F) -> Result<()>
where
    F: FnOnce() + 'static,
{
    open(options)?;
    let out = fiber::spawn(f).and_then(|_| mainloop());
    let closed = close();
    out.and(closed)
}

/// Takes a panic parked by a finished fiber and re-raises it on the
/// scheduler context.
fn repanic_if_pending() -> Result<()> {
    let pending = with(|r| {
        let p = r.pending_panic.take();
        if p.is_some() {
            // Unwinding out of mainloop; leave the reactor closeable.
            r.in_mainloop = false;
        }
        p
    })?;
    if let Some(p) = pending {
        panic::resume_unwind(p);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Scheduling
////////////////////////////////////////////////////////////////////////////////

/// Pops the head of the ready queue and switches to it. Returns once that
/// fiber suspends or finishes.
fn schedule_next() {
    let switch = with(|r| {
        let popped = {
            let Reactor { ready, fibers, .. } = &mut *r;
            ready.pop_front(fibers)
        };
        let id = match popped {
            Some(id) => id,
            None => return None,
        };
        let rec = r.fibers.get_mut(id);
        rec.state = FiberState::Running;
        rec.csw += 1;
        r.current = Some(id);
        if let Some((lo, hi)) = r.fibers.get(id).guard_range() {
            GUARD_LO.store(lo, Ordering::Relaxed);
            GUARD_HI.store(hi, Ordering::Relaxed);
        }
        Some((&mut r.sched_sp as *mut usize, r.fibers.get(id).sp))
    })
    .unwrap_or(None);

    let (save, to) = match switch {
        Some(pair) => pair,
        None => return,
    };
    // Safety: `save` is the scheduler's stable stack-pointer cell inside the
    // boxed reactor, `to` is a seeded or previously saved fiber stack
    // pointer, and the reactor borrow was released above.
    unsafe { fiber::context::switch(save, to) };

    let _ = with(|r| {
        r.current = None;
        GUARD_LO.store(0, Ordering::Relaxed);
        GUARD_HI.store(0, Ordering::Relaxed);
    });
}

/// The idle role: blocks in the readiness notifier for up to
/// *time-to-next-timer* and dispatches whatever events arrive.
fn idle_park() -> Result<()> {
    let now = clock::cycles();
    let (timeout, hopeless) = with(|r| {
        let timeout = r.wheel.time_to_next(now);
        let hopeless = timeout.is_none() && r.coio.live() == 0 && r.fibers.live() > 0;
        (timeout, hopeless)
    })?;
    if hopeless {
        // Parking forever; every remaining fiber is blocked with nothing
        // armed to wake it.
        log::warn!("all fibers are blocked with no timer or descriptor wake source");
    }
    PARKED.store(true, Ordering::Relaxed);
    let res = crate::coio::poll_and_dispatch(timeout);
    PARKED.store(false, Ordering::Relaxed);
    res
}

////////////////////////////////////////////////////////////////////////////////
// Critical sections
////////////////////////////////////////////////////////////////////////////////

/// Runs `f` with cooperative switching forbidden.
///
/// While inside, the current fiber cannot be interleaved with others: any
/// suspension attempt panics as a logic error. The counter is reentrant.
/// Timer callbacks are dispatched under an implicit critical section.
///
/// # Panics
///
/// Panics when no reactor is open on this thread.
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    let _guard = CriticalGuard::enter();
    f()
}

pub(crate) struct CriticalGuard {
    _priv: (),
}

impl CriticalGuard {
    pub(crate) fn enter() -> Self {
        with(|r| r.critical += 1).expect("reactor is not open on this thread");
        Self { _priv: () }
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        let _ = try_with(|r| {
            debug_assert!(r.critical > 0);
            r.critical -= 1;
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// Hang detector
////////////////////////////////////////////////////////////////////////////////

/// Cycle timestamp of the main loop's last iteration.
static LOOP_TICK: AtomicU64 = AtomicU64::new(0);
/// Raised while the loop is intentionally blocked in the kernel.
static PARKED: AtomicBool = AtomicBool::new(false);
/// Watchdog grace in cycles; zero disarms the handler.
static WATCHDOG_GRACE: AtomicU64 = AtomicU64::new(0);

struct Watchdog {
    timer: libc::timer_t,
}

impl Watchdog {
    /// Arms a POSIX interval timer delivering SIGRTMIN to this process; the
    /// handler aborts when the main loop has not stamped its tick within
    /// the grace period.
    fn install(grace: Duration) -> Result<Self> {
        WATCHDOG_GRACE.store(clock::duration_to_cycles(grace).max(1), Ordering::Relaxed);
        LOOP_TICK.store(clock::cycles(), Ordering::Relaxed);
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = watchdog_handler as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGRTMIN(), &sa, ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }

            let mut sev: libc::sigevent = mem::zeroed();
            sev.sigev_notify = libc::SIGEV_SIGNAL;
            sev.sigev_signo = libc::SIGRTMIN();
            let mut timer: libc::timer_t = mem::zeroed();
            if libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }

            let period = (grace / 4).max(Duration::from_millis(10));
            let ts = libc::timespec {
                tv_sec: period.as_secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            };
            let its = libc::itimerspec {
                it_interval: ts,
                it_value: ts,
            };
            if libc::timer_settime(timer, 0, &its, ptr::null_mut()) != 0 {
                libc::timer_delete(timer);
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(Self { timer })
        }
    }

    fn uninstall(self) {
        WATCHDOG_GRACE.store(0, Ordering::Relaxed);
        unsafe {
            libc::timer_delete(self.timer);
        }
    }
}

extern "C" fn watchdog_handler(_: libc::c_int) {
    let grace = WATCHDOG_GRACE.load(Ordering::Relaxed);
    if grace == 0 || PARKED.load(Ordering::Relaxed) {
        return;
    }
    let last = LOOP_TICK.load(Ordering::Relaxed);
    if clock::cycles().saturating_sub(last) > grace {
        say(
            Severity::Error,
            "reactor main loop has stalled past the hang detector grace, aborting",
        );
        unsafe { libc::abort() }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Stack overflow diagnostic
////////////////////////////////////////////////////////////////////////////////

/// Guard page range of the currently running fiber, for the fault handler.
static GUARD_LO: AtomicUsize = AtomicUsize::new(0);
static GUARD_HI: AtomicUsize = AtomicUsize::new(0);

struct AltStack {
    base: *mut libc::c_void,
    len: usize,
}

impl AltStack {
    /// Installs a SIGSEGV handler on a dedicated signal stack. A fault
    /// inside the running fiber's guard page is reported as a stack
    /// overflow; anything else is re-raised with the default disposition.
    fn install() -> Result<Self> {
        unsafe {
            let len = libc::SIGSTKSZ.max(64 * 1024);
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }
            let ss = libc::stack_t {
                ss_sp: base,
                ss_flags: 0,
                ss_size: len,
            };
            if libc::sigaltstack(&ss, ptr::null_mut()) != 0 {
                libc::munmap(base, len);
                return Err(std::io::Error::last_os_error().into());
            }

            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = segv_handler as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut()) != 0 {
                libc::munmap(base, len);
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(Self { base, len })
        }
    }

    fn uninstall(self) {
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut());
            let ss = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            libc::sigaltstack(&ss, ptr::null_mut());
            libc::munmap(self.base, self.len);
        }
    }
}

extern "C" fn segv_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;
    let lo = GUARD_LO.load(Ordering::Relaxed);
    let hi = GUARD_HI.load(Ordering::Relaxed);
    if lo != 0 && addr >= lo && addr < hi {
        say(
            Severity::Error,
            "fiber stack overflow: store hit the guard page, aborting",
        );
        unsafe { libc::abort() }
    }
    // Not a guard hit: restore the default disposition so the fault
    // re-fires into a normal crash.
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut());
    }
}
