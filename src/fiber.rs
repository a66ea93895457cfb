//! Cooperative multitasking module.
//!
//! A fiber is a lightweight execution context scheduled cooperatively on the
//! reactor thread. It owns a private guarded stack and yields control only at
//! explicit suspension points: [`suspend`], [`sleep`], [`reschedule`], a wait
//! on one of the synchronization primitives of the submodules, or returning
//! from its entry closure. There is no preemption; between suspension points
//! a fiber has the reactor to itself.
//!
//! Fibers are spawned with [`spawn`] / [`Builder`], addressed through weak
//! incarnation-tagged [`FiberHandle`]s, woken with [`resume`], cancelled with
//! [`throw_in`] or [`kill`] and awaited with [`join`]. A handle never dangles:
//! once the fiber finishes and its slot is recycled, every operation through
//! the old handle becomes a no-op.
//!
//! Cancellation is delivered at suspension points only. An error injected
//! with [`throw_in`] surfaces as an `Err` return from whatever blocking call
//! the target is parked in (or enters next); [`kill`] instead unwinds the
//! fiber stack so its RAII guards run, and the unwind is absorbed by the
//! fiber wrapper.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use crate::closure::InlineTask;
use crate::error::{Error, Result};
use crate::list::{Linked, ListLink};
use crate::pool::{RawHandle, SlotId};
use crate::reactor::{self, Reactor};
use crate::time::{Instant, Timeout};
use crate::timer::wheel::{Repeat, TimerCallback};

pub mod barrier;
pub mod channel;
pub(crate) mod context;
pub mod csw;
pub mod event;
pub mod mutex;
pub mod semaphore;
mod stack;
pub mod wait_queue;

pub use barrier::Barrier;
pub use channel::{Channel, RecvError, SendError, TryRecvError, TrySendError};
pub use csw::{check_yield, csw, YieldResult};
pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use wait_queue::WaitQueue;

pub(crate) use stack::FiberStack;

/// Inline capacity for fiber entry closures. A closure that does not fit
/// fails to compile; box its captures to shrink it.
pub(crate) const ENTRY_INLINE: usize = 128;

pub(crate) type FiberEntry = InlineTask<ENTRY_INLINE>;

/// Panic payload delivered by [`kill`]. The fiber wrapper recognizes it and
/// treats the unwind as a clean termination instead of a crash.
pub(crate) struct FiberKill;

////////////////////////////////////////////////////////////////////////////////
// FiberRecord
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FiberState {
    /// On the pool free list, stack cached for reuse.
    Free,
    /// On the ready queue, waiting for a scheduler slot.
    Ready,
    /// The one fiber currently executing.
    Running,
    /// On the blocked set, waiting for a resume, timer or descriptor event.
    Blocked,
    /// Finished, being torn down. Transient, never observable from outside.
    Done,
}

/// Why a blocked fiber was made ready again.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Wake {
    Normal,
    Timeout,
}

/// The per-fiber control block. Lives in the reactor's fixed pool for the
/// lifetime of the reactor; recycled, never freed individually.
pub(crate) struct FiberRecord {
    link: ListLink,
    pub(crate) state: FiberState,
    /// Saved machine stack pointer while not running.
    pub(crate) sp: usize,
    stack: Option<FiberStack>,
    /// Whether the wrapper loop is live on the cached stack. A seeded stack
    /// is re-entered through the saved `sp`; an unseeded one gets a fresh
    /// initial frame on the next spawn.
    seeded: bool,
    entry: Option<FiberEntry>,
    pub(crate) name: String,
    /// Goes to the head of the ready queue on the next resume, then clears.
    pub(crate) prioritized: bool,
    killed: bool,
    backtrace_requested: bool,
    /// Error injected by `throw_in`, delivered at the next suspension point.
    pending: Option<Error>,
    wake: Wake,
    /// One-shot timeout timer armed by `suspend`, cancelled on normal wake.
    wake_timer: Option<RawHandle>,
    pub(crate) csw: u64,
    joiners: Vec<FiberHandle>,
    locals: Vec<(usize, Box<dyn Any>)>,
}

impl Linked for FiberRecord {
    fn link(&self) -> &ListLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink {
        &mut self.link
    }
}

impl FiberRecord {
    pub(crate) fn vacant() -> Self {
        Self {
            link: ListLink::default(),
            state: FiberState::Free,
            sp: 0,
            stack: None,
            seeded: false,
            entry: None,
            name: String::new(),
            prioritized: false,
            killed: false,
            backtrace_requested: false,
            pending: None,
            wake: Wake::Normal,
            wake_timer: None,
            csw: 0,
            joiners: Vec::new(),
            locals: Vec::new(),
        }
    }

    /// Releases the backing pages of a parked stack and forces a re-seed on
    /// the next spawn. Only meaningful for records on the free list.
    pub(crate) fn reclaim_stack(&mut self) {
        if let Some(stack) = &self.stack {
            stack.reclaim();
            self.seeded = false;
        }
    }

    /// Guard page range of the stack, for the fault diagnostic.
    pub(crate) fn guard_range(&self) -> Option<(usize, usize)> {
        let stack = self.stack.as_ref()?;
        Some((stack.guard(), stack.guard() + stack::page_size()))
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberHandle
////////////////////////////////////////////////////////////////////////////////

/// A weak reference to a fiber.
///
/// A handle is a `(slot, incarnation)` pair: it stays valid while the fiber
/// it was created for is alive and silently invalidates when the slot is
/// recycled. All operations taking a handle ([`resume`], [`throw_in`],
/// [`kill`], [`join`]) are safe to call with a stale one and report the
/// staleness through their return value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberHandle {
    pub(crate) raw: RawHandle,
}

impl FiberHandle {
    /// Whether the fiber this handle was created for is still alive.
    #[inline]
    pub fn is_valid(&self) -> bool {
        reactor::with(|r| r.fibers.is_valid(self.raw)).unwrap_or(false)
    }

    /// Stable index of the fiber's slot. Reused by later fibers after this
    /// one dies, so only meaningful together with handle validity.
    #[inline(always)]
    pub fn permanent_id(&self) -> u32 {
        self.raw.id.0
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberHandle({:?})", self.raw)
    }
}

/// Handle of the currently running fiber, `None` on the scheduler context or
/// when no reactor is open on this thread.
pub fn current() -> Option<FiberHandle> {
    reactor::with(|r| r.current.map(|id| FiberHandle { raw: r.fibers.handle(id) }))
        .ok()
        .flatten()
}

/// Log tag of the current fiber. Uses a non-panicking reactor access so it is
/// callable from the logger itself.
pub(crate) fn current_name() -> Option<String> {
    reactor::try_with(|r| {
        let id = r.current?;
        let rec = r.fibers.get(id);
        if rec.name.is_empty() {
            Some(format!("fiber#{}", id.0))
        } else {
            Some(format!("{}#{}", rec.name, id.0))
        }
    })
    .flatten()
}

/// Context switch count of the current fiber, 0 outside fiber context.
pub(crate) fn current_csw() -> u64 {
    reactor::with(|r| r.current.map(|id| r.fibers.get(id).csw))
        .ok()
        .flatten()
        .unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////////////
// Builder / JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The [`proc`] and
/// [`func`] terminators spawn the configured fiber and hand back either a
/// bare [`FiberHandle`] or a [`JoinHandle`] carrying the closure's output.
///
/// [`proc`]: Builder::proc
/// [`func`]: Builder::func
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    prioritized: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be. The name shows up in log lines and
    /// diagnostics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. Rounded up
    /// to a page; the reactor-wide default applies when unset.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Enqueues the fiber at the head of the ready queue instead of the
    /// tail.
    pub fn prioritized(mut self, prioritized: bool) -> Self {
        self.prioritized = prioritized;
        self
    }

    /// Spawns a detached fiber running `f`.
    pub fn proc<F>(self, f: F) -> Result<FiberHandle>
    where
        F: FnOnce() + 'static,
    {
        spawn_inner(
            self.name,
            self.stack_size,
            self.prioritized,
            FiberEntry::new(f),
        )
    }

    /// Spawns a fiber running `f` and returns a [`JoinHandle`] through which
    /// the closure's output can be awaited.
    pub fn func<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let result = Rc::new(RefCell::new(None));
        let cell = Rc::clone(&result);
        let handle = spawn_inner(
            self.name,
            self.stack_size,
            self.prioritized,
            FiberEntry::new(move || {
                let out = f();
                cell.borrow_mut().replace(out);
            }),
        )?;
        Ok(JoinHandle {
            handle,
            result,
            joined: false,
        })
    }
}

/// An owned permission to join on a fiber and take its output.
///
/// A `JoinHandle` detaches the fiber when [`detach`]ed and panics when
/// dropped without either joining or detaching, the same discipline a thread
/// join handle would want but cannot enforce.
///
/// [`detach`]: JoinHandle::detach
pub struct JoinHandle<T> {
    handle: FiberHandle,
    result: Rc<RefCell<Option<T>>>,
    joined: bool,
}

impl<T> JoinHandle<T> {
    /// The weak handle of the underlying fiber.
    #[inline(always)]
    pub fn handle(&self) -> FiberHandle {
        self.handle
    }

    /// Blocks until the fiber finishes and returns the closure's output.
    ///
    /// Returns [`Error::Interrupted`] if the fiber was killed before it
    /// could produce a result.
    pub fn join(mut self) -> Result<T> {
        self.joined = true;
        self::join(self.handle, Timeout::Infinite)?;
        let out = self.result.borrow_mut().take();
        out.ok_or(Error::Interrupted)
    }

    /// Lets the fiber run to completion on its own.
    pub fn detach(mut self) -> FiberHandle {
        self.joined = true;
        self.handle
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.joined && !std::thread::panicking() {
            panic!("a fiber's JoinHandle was dropped without being joined or detached");
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Spawns a detached fiber running `f`, enqueued at the tail of the ready
/// queue. The fiber starts executing once the scheduler reaches it.
#[inline]
pub fn spawn<F>(f: F) -> Result<FiberHandle>
where
    F: FnOnce() + 'static,
{
    Builder::new().proc(f)
}

/// Like [`spawn`] but enqueues the fiber at the head of the ready queue.
#[inline]
pub fn spawn_prioritized<F>(f: F) -> Result<FiberHandle>
where
    F: FnOnce() + 'static,
{
    Builder::new().prioritized(true).proc(f)
}

fn spawn_inner(
    name: Option<String>,
    stack_size: Option<usize>,
    prioritized: bool,
    entry: FiberEntry,
) -> Result<FiberHandle> {
    reactor::with(|r| {
        let id = r.fibers.allocate().ok_or(Error::PoolDepleted("fiber"))?;
        let stack_size = stack_size.unwrap_or(r.options.fiber_stack_size);

        let needs_stack = match &r.fibers.get(id).stack {
            Some(cached) => cached.usable() < stack_size,
            None => true,
        };
        if needs_stack {
            match FiberStack::new(stack_size) {
                Ok(stack) => {
                    let rec = r.fibers.get_mut(id);
                    rec.stack = Some(stack);
                    rec.seeded = false;
                }
                Err(e) => {
                    r.fibers.release(id);
                    return Err(e.into());
                }
            }
        }

        let rec = r.fibers.get_mut(id);
        if !rec.seeded {
            let top = rec.stack.as_ref().expect("stack was just ensured").top();
            // Safety: the stack top is 16-byte aligned and writable
            rec.sp = unsafe { context::init_frame(top, id.index()) };
            rec.seeded = true;
        }
        rec.entry = Some(entry);
        rec.name = name.unwrap_or_default();
        rec.state = FiberState::Ready;
        rec.prioritized = false;
        rec.killed = false;
        rec.backtrace_requested = false;
        rec.pending = None;
        rec.wake = Wake::Normal;
        rec.wake_timer = None;
        rec.csw = 0;
        debug_assert!(rec.joiners.is_empty());
        debug_assert!(rec.locals.is_empty());

        let handle = FiberHandle {
            raw: r.fibers.handle(id),
        };
        let Reactor { ready, fibers, .. } = r;
        if prioritized {
            ready.push_front(fibers, id);
        } else {
            ready.push_back(fibers, id);
        }
        log::debug!("spawned fiber #{}", id.0);
        Ok(handle)
    })?
}

////////////////////////////////////////////////////////////////////////////////
// Suspension points
////////////////////////////////////////////////////////////////////////////////

/// Blocks the current fiber until somebody [`resume`]s it or the timeout
/// fires, whichever happens first.
///
/// Returns `Ok(())` on a resume, [`Error::Timeout`] when the timeout won the
/// race, or the injected error if another fiber called [`throw_in`]. An
/// already-elapsed timeout fails immediately without yielding; this turns
/// any wait into a poll.
///
/// A timeout deadline beyond the time queue's total span (several weeks at
/// the default resolution) is rejected with [`Error::TooFarAhead`].
///
/// # Panics
///
/// Panics when called while a [critical section](crate::reactor::critical)
/// is entered: suspending there is a logic error.
pub fn suspend(timeout: Timeout) -> Result<()> {
    let me = reactor::with(|r| {
        assert!(
            r.critical == 0,
            "attempted to suspend inside a critical section"
        );
        match r.current {
            Some(id) => Ok(r.fibers.handle(id)),
            // The scheduler context cannot block cooperatively.
            None => Err(Error::ReactorClosed),
        }
    })??;

    // A cancellation that arrived since the last suspension point is
    // delivered before blocking.
    deliver_pending()?;

    if timeout.has_expired(Instant::now()) {
        return Err(Error::Timeout);
    }
    if let Some(deadline) = timeout.deadline() {
        let handle = FiberHandle { raw: me };
        let cookie = reactor::with(|r| {
            r.wheel.insert(
                deadline.as_cycles(),
                Repeat::No,
                TimerCallback::new(move || wake_on_timeout(handle)),
            )
        })??;
        reactor::with(|r| r.fibers.get_mut(me.id).wake_timer = Some(cookie))?;
    }

    reactor::with(|r| {
        let rec = r.fibers.get_mut(me.id);
        rec.state = FiberState::Blocked;
        rec.wake = Wake::Normal;
        let Reactor {
            blocked, fibers, ..
        } = r;
        blocked.push_back(fibers, me.id);
    })?;
    switch_to_scheduler();

    // Back on our stack: disarm the timeout timer before anything that may
    // unwind, then deliver the wake outcome.
    let wake = reactor::with(|r| {
        let timer = r.fibers.get_mut(me.id).wake_timer.take();
        if let Some(timer) = timer {
            r.wheel.cancel(timer);
        }
        r.fibers.get(me.id).wake
    })?;
    deliver_pending()?;
    match wake {
        Wake::Timeout => Err(Error::Timeout),
        Wake::Normal => Ok(()),
    }
}

/// Puts the current fiber to sleep for at least `duration`.
///
/// An early [`resume`] ends the sleep without error. `sleep(Duration::ZERO)`
/// is a plain [`reschedule`]. Returns the injected error if the fiber was
/// cancelled while sleeping.
pub fn sleep(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return reschedule();
    }
    match suspend(Timeout::in_(duration)) {
        Ok(()) | Err(Error::Timeout) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Yields control: moves the current fiber to the tail of the ready queue
/// (head if it is marked prioritized) and runs the scheduler. Returns the
/// injected error if the fiber was cancelled in the meantime; a no-op
/// outside fiber context.
///
/// # Panics
///
/// Panics when called inside a [critical section](crate::reactor::critical).
pub fn reschedule() -> Result<()> {
    let current = reactor::with(|r| {
        assert!(
            r.critical == 0,
            "attempted to suspend inside a critical section"
        );
        r.current
    })?;
    let id = match current {
        Some(id) => id,
        None => return Ok(()),
    };
    reactor::with(|r| {
        let rec = r.fibers.get_mut(id);
        rec.state = FiberState::Ready;
        let front = std::mem::take(&mut rec.prioritized);
        let Reactor { ready, fibers, .. } = r;
        if front {
            ready.push_front(fibers, id);
        } else {
            ready.push_back(fibers, id);
        }
    })?;
    switch_to_scheduler();
    deliver_pending()
}

/// Takes the cancellation state of the current fiber and turns it into the
/// corresponding control flow: a `kill` unwinds, an injected error returns
/// as `Err`, a backtrace request is served in place.
fn deliver_pending() -> Result<()> {
    let (pending, killed, backtrace) = reactor::with(|r| {
        let id = r.current.expect("must be called from fiber context");
        let rec = r.fibers.get_mut(id);
        (
            rec.pending.take(),
            rec.killed,
            std::mem::take(&mut rec.backtrace_requested),
        )
    })?;
    if backtrace {
        let bt = std::backtrace::Backtrace::force_capture();
        log::info!("fiber backtrace:\n{bt}");
    }
    if killed {
        panic::panic_any(FiberKill);
    }
    if let Some(err) = pending {
        return Err(err);
    }
    Ok(())
}

/// Timer callback armed by `suspend` for its timeout.
fn wake_on_timeout(h: FiberHandle) {
    let _ = reactor::with(|r| {
        if !r.fibers.is_valid(h.raw) {
            return;
        }
        let id = h.raw.id;
        let rec = r.fibers.get_mut(id);
        // This one-shot entry is firing right now, nothing left to cancel.
        rec.wake_timer = None;
        if rec.state == FiberState::Blocked {
            rec.wake = Wake::Timeout;
            make_ready(r, id, false);
        }
    });
}

/// Moves a blocked fiber to the ready queue. Caller has checked the state.
pub(crate) fn make_ready(r: &mut Reactor, id: SlotId, front: bool) {
    let Reactor {
        ready,
        blocked,
        fibers,
        ..
    } = r;
    blocked.remove(fibers, id);
    fibers.get_mut(id).state = FiberState::Ready;
    if front {
        ready.push_front(fibers, id);
    } else {
        ready.push_back(fibers, id);
    }
}

////////////////////////////////////////////////////////////////////////////////
// resume / throw_in / kill / join
////////////////////////////////////////////////////////////////////////////////

/// Wakes a blocked fiber.
///
/// Returns whether a state change occurred: `false` when the handle is stale
/// or the fiber is not currently blocked. A fiber marked prioritized goes to
/// the head of the ready queue and the mark clears.
pub fn resume(h: FiberHandle) -> bool {
    reactor::with(|r| {
        if !r.fibers.is_valid(h.raw) {
            return false;
        }
        let id = h.raw.id;
        if r.fibers.get(id).state != FiberState::Blocked {
            return false;
        }
        let rec = r.fibers.get_mut(id);
        rec.wake = Wake::Normal;
        let front = std::mem::take(&mut rec.prioritized);
        make_ready(r, id, front);
        true
    })
    .unwrap_or(false)
}

/// Injects `err` into the fiber behind `h`.
///
/// The target observes the error as an `Err` return from its current (or
/// next) suspension-capable call. The fiber is marked prioritized and woken
/// if blocked. Returns `false` on a stale handle.
pub fn throw_in(h: FiberHandle, err: Error) -> bool {
    reactor::with(|r| {
        if !r.fibers.is_valid(h.raw) {
            return false;
        }
        let id = h.raw.id;
        let rec = r.fibers.get_mut(id);
        rec.pending = Some(err);
        rec.prioritized = true;
        if rec.state == FiberState::Blocked {
            rec.wake = Wake::Normal;
            rec.prioritized = false;
            make_ready(r, id, true);
        }
        true
    })
    .unwrap_or(false)
}

/// Cancels the fiber behind `h`.
///
/// At its next suspension point the target unwinds: its stack is torn down
/// scope by scope, RAII guards run, and the fiber terminates without
/// producing a result. A fiber that never suspends again is not affected;
/// cancellation is cooperative. Returns `false` on a stale handle.
pub fn kill(h: FiberHandle) -> bool {
    reactor::with(|r| {
        if !r.fibers.is_valid(h.raw) {
            return false;
        }
        let id = h.raw.id;
        let rec = r.fibers.get_mut(id);
        rec.killed = true;
        rec.prioritized = true;
        if rec.state == FiberState::Blocked {
            rec.wake = Wake::Normal;
            rec.prioritized = false;
            make_ready(r, id, true);
        }
        true
    })
    .unwrap_or(false)
}

/// Blocks until the fiber behind `h` terminates or the timeout fires.
///
/// Returns `Ok(())` immediately on a stale handle: the fiber is already
/// gone, which is exactly what a joiner wants to know.
pub fn join(h: FiberHandle, timeout: Timeout) -> Result<()> {
    let me = current().ok_or(Error::ReactorClosed)?;
    if me == h {
        return Err(Error::other("a fiber cannot join itself"));
    }
    loop {
        let registered = reactor::with(|r| {
            if !r.fibers.is_valid(h.raw) {
                return false;
            }
            r.fibers.get_mut(h.raw.id).joiners.push(me);
            true
        })?;
        if !registered {
            return Ok(());
        }
        let res = suspend(timeout);
        // Deregister before inspecting the outcome; the target may still be
        // alive and must not wake us twice.
        let _ = reactor::with(|r| {
            if r.fibers.is_valid(h.raw) {
                r.fibers.get_mut(h.raw.id).joiners.retain(|j| *j != me);
            }
        });
        res?;
        // Woken: either the target finished (the handle went stale) or the
        // resume came from elsewhere. Loop and re-check.
    }
}

/// Asks the fiber behind `h` to capture and log a backtrace at its next
/// resume. Returns `false` on a stale handle.
pub fn request_backtrace(h: FiberHandle) -> bool {
    reactor::with(|r| {
        if !r.fibers.is_valid(h.raw) {
            return false;
        }
        r.fibers.get_mut(h.raw.id).backtrace_requested = true;
        true
    })
    .unwrap_or(false)
}

////////////////////////////////////////////////////////////////////////////////
// Fiber wrapper
////////////////////////////////////////////////////////////////////////////////

/// Entered from the context-switch trampoline the first time a seeded stack
/// runs. Never returns: after each tenant of the slot finishes, it parks in
/// the scheduler and resumes here for the next tenant.
pub(crate) extern "C" fn fiber_entry_raw(index: usize) -> ! {
    let id = SlotId(index as u32);
    loop {
        fiber_main(id);
    }
}

fn fiber_main(id: SlotId) {
    let (entry, killed) = reactor::with(|r| {
        let rec = r.fibers.get_mut(id);
        (rec.entry.take(), rec.killed)
    })
    .expect("reactor is open under a running fiber");

    let mut escaped: Option<Box<dyn Any + Send>> = None;
    match entry {
        Some(entry) if !killed => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry.call())) {
                if payload.is::<FiberKill>() {
                    log::debug!("fiber #{} was killed", id.0);
                } else {
                    escaped = Some(payload);
                }
            }
        }
        // Killed before the first run: the entry closure is dropped
        // uninvoked and the fiber terminates immediately.
        _ => {}
    }

    finish(id, escaped);
    // Park until this slot is spawned again; the next tenant resumes right
    // here and loops back around for its own entry.
    switch_to_scheduler();
}

/// Tears the finished fiber down: wakes its joiners, resets the record and
/// returns the slot (stack still attached) to the free list. A panic that
/// escaped the entry is parked on the reactor for the main loop to re-raise.
fn finish(id: SlotId, escaped: Option<Box<dyn Any + Send>>) {
    let _ = reactor::with(|r| {
        let rec = r.fibers.get_mut(id);
        rec.state = FiberState::Done;
        let joiners = std::mem::take(&mut rec.joiners);
        rec.locals.clear();
        rec.name.clear();
        rec.pending = None;
        rec.killed = false;
        rec.prioritized = false;
        rec.backtrace_requested = false;
        debug_assert!(rec.wake_timer.is_none(), "suspend left a timer armed");
        rec.state = FiberState::Free;
        r.fibers.release(id);
        for j in joiners {
            if r.fibers.is_valid(j.raw) && r.fibers.get(j.raw.id).state == FiberState::Blocked {
                r.fibers.get_mut(j.raw.id).wake = Wake::Normal;
                make_ready(r, j.raw.id, false);
            }
        }
        if let Some(p) = escaped {
            r.pending_panic = Some(p);
        }
    });
}

/// Saves the current fiber's stack pointer and switches to the scheduler
/// context. Returns when the scheduler switches back in.
pub(crate) fn switch_to_scheduler() {
    let (save, to) = reactor::with(|r| {
        let id = r.current.expect("switch attempted outside fiber context");
        let rec = r.fibers.get_mut(id);
        (&mut rec.sp as *mut usize, r.sched_sp)
    })
    .expect("reactor is open under a running fiber");
    // Safety: `save` points into the stable fiber pool, `to` was stored by
    // the scheduler on its way in, and no reactor borrow is live.
    unsafe { context::switch(save, to) };
}

////////////////////////////////////////////////////////////////////////////////
// Fiber-local storage
////////////////////////////////////////////////////////////////////////////////

/// A typed per-fiber storage slot.
///
/// Declared as a `static`; each fiber that touches the slot gets its own
/// lazily-initialized value, dropped when the fiber finishes.
///
/// ```no_run
/// use weft::fiber::FiberLocal;
///
/// static COUNTER: FiberLocal<u32> = FiberLocal::new(|| 0);
///
/// COUNTER.with(|c| *c += 1).unwrap();
/// ```
pub struct FiberLocal<T: 'static> {
    init: fn() -> T,
}

impl<T: 'static> FiberLocal<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self { init }
    }

    #[inline(always)]
    fn key(&'static self) -> usize {
        self as *const Self as usize
    }

    /// Runs `f` with the current fiber's value of this slot, initializing it
    /// on first touch. `f` may yield; the slot is detached from the record
    /// for the duration of the call.
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let key = self.key();
        let stored = reactor::with(|r| {
            let id = r.current.ok_or(Error::ReactorClosed)?;
            let rec = r.fibers.get_mut(id);
            match rec.locals.iter().position(|(k, _)| *k == key) {
                Some(i) => Ok::<_, Error>(Some(rec.locals.swap_remove(i).1)),
                None => Ok(None),
            }
        })??;
        let mut slot: Box<dyn Any> = match stored {
            Some(boxed) => boxed,
            None => Box::new((self.init)()),
        };
        let out = f(slot
            .downcast_mut::<T>()
            .expect("fiber-local slot holds a different type"));
        reactor::with(|r| {
            let id = r.current.expect("fiber vanished under its own local");
            r.fibers.get_mut(id).locals.push((key, slot));
        })?;
        Ok(out)
    }
}

impl<T: 'static> fmt::Debug for FiberLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberLocal").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{self, Options};
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn options() -> Options {
        Options {
            thread_pool_workers: 0,
            ..Options::default()
        }
    }

    #[test]
    fn join_handle_dropped_live_panics() {
        let observed = Rc::new(Cell::new(false));
        let seen = Rc::clone(&observed);

        reactor::run(options(), move || {
            let handle = Builder::new().func(|| 1).unwrap();
            let dropped = catch_unwind(AssertUnwindSafe(move || drop(handle)));
            let message = match dropped {
                Err(payload) => payload.downcast_ref::<&str>().copied().unwrap_or(""),
                Ok(()) => "",
            };
            seen.set(message.contains("joined or detached"));
        })
        .unwrap();

        assert!(
            observed.get(),
            "dropping a live JoinHandle must panic with the discipline message"
        );
    }

    #[test]
    fn join_handle_detach_releases_the_obligation() {
        reactor::run(options(), || {
            let handle = Builder::new().func(|| 7).unwrap();
            let weak = handle.detach();
            // The detached fiber still runs to completion on its own.
            join(weak, Timeout::Infinite).unwrap();
            assert!(!weak.is_valid());
        })
        .unwrap();
    }

    #[test]
    fn join_handle_joined_does_not_panic_on_drop() {
        reactor::run(options(), || {
            let handle = Builder::new().func(|| 41).unwrap();
            assert_eq!(handle.join().unwrap() + 1, 42);
        })
        .unwrap();
    }
}
