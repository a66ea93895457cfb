//! Cooperative input/output.
//!
//! The readiness bridge registers file descriptors with the kernel notifier
//! (epoll, edge-triggered) once, at [`register`] time. A fiber then parks on
//! a direction of a descriptor with [`wait_readable`] / [`wait_writable`];
//! when the reactor's idle phase returns from the kernel it translates each
//! event into a resume of the stored fiber, an invocation of an installed
//! callback, or a sticky readiness flag for whoever asks next.
//!
//! Each direction of a descriptor holds at most one fiber waiter; installing
//! a second one is a logic error and panics. Readiness callbacks installed
//! with [`set_callback`] run on the scheduler context and must not suspend.
//!
//! [`CoIoStream`] and [`CoIoListener`] wrap raw descriptors into the
//! familiar blocking `Read`/`Write`/`accept` shapes, suspending the calling
//! fiber instead of the thread whenever the kernel reports `EWOULDBLOCK`.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::mem::forget;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::closure::InlineCallback;
use crate::error::{Error, Result};
use crate::fiber::{self, FiberHandle};
use crate::pool::{Pool, RawHandle};
use crate::reactor;
use crate::time::Timeout;

bitflags::bitflags! {
    /// Readiness interest of a registered descriptor. Declared once at
    /// registration; waiting on an undeclared direction is refused.
    pub struct CoIoFlags: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

/// One direction of a descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Read,
    Write,
}

/// Inline capacity for readiness callbacks.
const CALLBACK_INLINE: usize = 64;

type CoIoCallback = InlineCallback<CALLBACK_INLINE>;

/// A registered descriptor. Weak like every pool handle: stale after
/// [`deregister`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FdHandle(RawHandle);

enum Waiter {
    None,
    Fiber(FiberHandle),
    Callback { cb: CoIoCallback, one_shot: bool },
}

struct DirState {
    waiter: Waiter,
    /// An edge arrived while nobody was waiting; consumed by the next wait.
    ready: bool,
}

impl DirState {
    fn new() -> Self {
        Self {
            waiter: Waiter::None,
            ready: false,
        }
    }
}

struct FdContext {
    fd: RawFd,
    flags: CoIoFlags,
    read: DirState,
    write: DirState,
}

impl FdContext {
    fn dir_mut(&mut self, dir: Direction) -> &mut DirState {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIo (the bridge)
////////////////////////////////////////////////////////////////////////////////

/// The reactor-owned epoll bridge: one epoll descriptor plus a fixed pool
/// of per-FD contexts.
pub(crate) struct CoIo {
    epfd: RawFd,
    contexts: Pool<FdContext>,
}

impl CoIo {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            epfd,
            contexts: Pool::new(capacity, |_| FdContext {
                fd: -1,
                flags: CoIoFlags::empty(),
                read: DirState::new(),
                write: DirState::new(),
            }),
        })
    }

    /// Number of currently registered descriptors.
    #[inline(always)]
    pub(crate) fn live(&self) -> usize {
        self.contexts.live()
    }
}

impl Drop for CoIo {
    fn drop(&mut self) {
        // Registered descriptors are not deleted individually; closing the
        // epoll fd discards them.
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn pack_cookie(h: RawHandle) -> u64 {
    (h.incarnation as u64) << 32 | h.id.0 as u64
}

fn unpack_cookie(cookie: u64) -> RawHandle {
    RawHandle {
        id: crate::pool::SlotId(cookie as u32),
        incarnation: (cookie >> 32) as u32,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Registration
////////////////////////////////////////////////////////////////////////////////

/// Registers `fd` with the readiness notifier, edge-triggered, for the
/// given directions.
///
/// The descriptor is switched to non-blocking mode unless the caller vouches
/// it already is. Registering the same descriptor twice fails with the
/// kernel's `EEXIST`.
pub fn register(fd: RawFd, flags: CoIoFlags, already_non_blocking: bool) -> Result<FdHandle> {
    assert!(!flags.is_empty(), "descriptor registered with no interest");
    if !already_non_blocking {
        unsafe {
            let current = libc::fcntl(fd, libc::F_GETFL, 0);
            if current < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if libc::fcntl(fd, libc::F_SETFL, current | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
    }
    reactor::with(|r| {
        let id = r
            .coio
            .contexts
            .allocate()
            .ok_or(Error::PoolDepleted("descriptor context"))?;
        {
            let ctx = r.coio.contexts.get_mut(id);
            ctx.fd = fd;
            ctx.flags = flags;
            ctx.read = DirState::new();
            ctx.write = DirState::new();
        }
        let handle = r.coio.contexts.handle(id);

        let mut events = libc::EPOLLET as u32;
        if flags.contains(CoIoFlags::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if flags.contains(CoIoFlags::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: pack_cookie(handle),
        };
        if unsafe { libc::epoll_ctl(r.coio.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            r.coio.contexts.release(id);
            return Err(err.into());
        }
        Ok(FdHandle(handle))
    })?
}

/// Removes the descriptor from the notifier and releases its context.
/// Fibers still parked on it are woken; their next syscall reports whatever
/// the descriptor's real state is.
pub fn deregister(h: FdHandle) -> Result<()> {
    let wake = reactor::with(|r| {
        if !r.coio.contexts.is_valid(h.0) {
            return Err(Error::other("descriptor is not registered"));
        }
        let id = h.0.id;
        let (fd, read, write) = {
            let ctx = r.coio.contexts.get_mut(id);
            let read = std::mem::replace(&mut ctx.read.waiter, Waiter::None);
            let write = std::mem::replace(&mut ctx.write.waiter, Waiter::None);
            (ctx.fd, read, write)
        };
        unsafe {
            // ENOENT here only means the kernel already forgot the fd.
            libc::epoll_ctl(
                r.coio.epfd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            );
        }
        r.coio.contexts.release(id);
        let mut wake = Vec::new();
        if let Waiter::Fiber(f) = read {
            wake.push(f);
        }
        if let Waiter::Fiber(f) = write {
            wake.push(f);
        }
        Ok(wake)
    })??;
    for f in wake {
        fiber::resume(f);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Waiting
////////////////////////////////////////////////////////////////////////////////

/// Parks the current fiber until `fd` becomes readable or the timeout
/// fires.
pub fn wait_readable(h: FdHandle, timeout: Timeout) -> Result<()> {
    wait(h, Direction::Read, timeout)
}

/// Parks the current fiber until `fd` becomes writable or the timeout
/// fires.
pub fn wait_writable(h: FdHandle, timeout: Timeout) -> Result<()> {
    wait(h, Direction::Write, timeout)
}

fn wait(h: FdHandle, dir: Direction, timeout: Timeout) -> Result<()> {
    let me = fiber::current().ok_or(Error::ReactorClosed)?;
    let fast = reactor::with(|r| {
        if !r.coio.contexts.is_valid(h.0) {
            return Err(Error::other("descriptor is not registered"));
        }
        let ctx = r.coio.contexts.get_mut(h.0.id);
        let declared = match dir {
            Direction::Read => ctx.flags.contains(CoIoFlags::READ),
            Direction::Write => ctx.flags.contains(CoIoFlags::WRITE),
        };
        if !declared {
            return Err(Error::other(
                "descriptor was not registered for this direction",
            ));
        }
        let state = ctx.dir_mut(dir);
        if state.ready {
            state.ready = false;
            return Ok(true);
        }
        match state.waiter {
            Waiter::None => {
                state.waiter = Waiter::Fiber(me);
                Ok(false)
            }
            Waiter::Fiber(_) => {
                panic!("two fibers waiting on the same descriptor direction")
            }
            Waiter::Callback { .. } => {
                panic!("descriptor direction already has a readiness callback")
            }
        }
    })??;
    if fast {
        return Ok(());
    }
    let res = fiber::suspend(timeout);
    // The event dispatcher clears the slot on a wake; on timeout or
    // cancellation it is still ours to clear.
    let _ = reactor::with(|r| {
        if r.coio.contexts.is_valid(h.0) {
            let state = r.coio.contexts.get_mut(h.0.id).dir_mut(dir);
            if matches!(state.waiter, Waiter::Fiber(f) if f == me) {
                state.waiter = Waiter::None;
            }
        }
    });
    res
}

/// Installs `f` as the readiness callback of one direction. It runs on the
/// scheduler context each time an edge arrives (once, if `one_shot`) and
/// must not suspend. An edge that already arrived is served immediately.
///
/// # Panics
///
/// Panics if a fiber is currently waiting on that direction.
pub fn set_callback<F>(h: FdHandle, dir: Direction, f: F, one_shot: bool) -> Result<()>
where
    F: FnMut() + 'static,
{
    // The callback must not run under the reactor borrow, so a pending
    // edge hands it back out for immediate dispatch.
    let pending = reactor::with(|r| {
        if !r.coio.contexts.is_valid(h.0) {
            return Err(Error::other("descriptor is not registered"));
        }
        let state = r.coio.contexts.get_mut(h.0.id).dir_mut(dir);
        if matches!(state.waiter, Waiter::Fiber(_)) {
            panic!("a fiber is already waiting on this descriptor direction");
        }
        let cb = CoIoCallback::new(f);
        if state.ready {
            state.ready = false;
            Ok(Some(cb))
        } else {
            state.waiter = Waiter::Callback { cb, one_shot };
            Ok(None)
        }
    })??;
    if let Some(mut cb) = pending {
        cb.call();
        if !one_shot {
            let _ = reactor::with(|r| {
                if r.coio.contexts.is_valid(h.0) {
                    let state = r.coio.contexts.get_mut(h.0.id).dir_mut(dir);
                    if matches!(state.waiter, Waiter::None) {
                        state.waiter = Waiter::Callback { cb, one_shot: false };
                    }
                }
            });
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Event dispatch
////////////////////////////////////////////////////////////////////////////////

enum Wakeup {
    Fiber(FiberHandle),
    Callback {
        h: FdHandle,
        dir: Direction,
        cb: CoIoCallback,
        reinstall: bool,
    },
}

/// The idle role of the scheduler: blocks in `epoll_wait` for up to
/// `timeout_cycles` (forever when `None`) and dispatches the events.
/// `EINTR` counts as a wake with zero events.
pub(crate) fn poll_and_dispatch(timeout_cycles: Option<u64>) -> Result<()> {
    let epfd = reactor::with(|r| r.coio.epfd)?;
    let timeout_ms = match timeout_cycles {
        None => -1,
        Some(0) => 0,
        // Round up so the kernel never wakes us before the deadline.
        Some(cycles) => ((cycles + 999_999) / 1_000_000).min(i32::MAX as u64) as i32,
    };

    let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
    let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
    let n = if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            0
        } else {
            return Err(err.into());
        }
    } else {
        n as usize
    };

    let mut wakeups = Vec::new();
    reactor::with(|r| {
        for ev in &events[..n] {
            let handle = unpack_cookie(ev.u64);
            if !r.coio.contexts.is_valid(handle) {
                // The context was recycled while the event sat in the
                // kernel queue.
                continue;
            }
            let flags = ev.events;
            let error = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if error || flags & libc::EPOLLIN as u32 != 0 {
                fire(r, handle, Direction::Read, &mut wakeups);
            }
            if error || flags & libc::EPOLLOUT as u32 != 0 {
                fire(r, handle, Direction::Write, &mut wakeups);
            }
        }
    })?;

    for wakeup in wakeups {
        match wakeup {
            Wakeup::Fiber(f) => {
                fiber::resume(f);
            }
            Wakeup::Callback {
                h,
                dir,
                mut cb,
                reinstall,
            } => {
                cb.call();
                if reinstall {
                    // Put the callback back unless the slot changed hands
                    // while it ran.
                    let _ = reactor::with(|r| {
                        if r.coio.contexts.is_valid(h.0) {
                            let state = r.coio.contexts.get_mut(h.0.id).dir_mut(dir);
                            if matches!(state.waiter, Waiter::None) {
                                state.waiter = Waiter::Callback { cb, one_shot: false };
                            }
                        }
                    });
                }
            }
        }
    }
    Ok(())
}

fn fire(
    r: &mut crate::reactor::Reactor,
    handle: RawHandle,
    dir: Direction,
    out: &mut Vec<Wakeup>,
) {
    let state = r.coio.contexts.get_mut(handle.id).dir_mut(dir);
    match std::mem::replace(&mut state.waiter, Waiter::None) {
        Waiter::None => state.ready = true,
        Waiter::Fiber(f) => out.push(Wakeup::Fiber(f)),
        Waiter::Callback { cb, one_shot } => out.push(Wakeup::Callback {
            h: FdHandle(handle),
            dir,
            cb,
            reinstall: !one_shot,
        }),
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIoStream
////////////////////////////////////////////////////////////////////////////////

/// A byte stream over a registered non-blocking descriptor. Reads and
/// writes suspend the calling fiber instead of blocking the thread.
pub struct CoIoStream {
    fd: RawFd,
    handle: FdHandle,
}

impl CoIoStream {
    /// Wraps an fd-like object, registering it for both directions.
    pub fn new<T>(inner: T) -> Result<CoIoStream>
    where
        T: IntoRawFd,
    {
        Self::from_raw_fd(inner.into_raw_fd(), false)
    }

    /// Wraps a raw descriptor. The caller may vouch it is already
    /// non-blocking.
    pub fn from_raw_fd(fd: RawFd, already_non_blocking: bool) -> Result<CoIoStream> {
        let handle = register(fd, CoIoFlags::READ | CoIoFlags::WRITE, already_non_blocking)?;
        Ok(CoIoStream { fd, handle })
    }

    /// Connects to a remote TCP socket.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<CoIoStream> {
        let stream = TcpStream::connect(addr).map_err(Error::from)?;
        stream.set_nonblocking(true).map_err(Error::from)?;
        Self::from_raw_fd(stream.into_raw_fd(), true)
    }

    /// Pulls some bytes from the stream. Suspends through `EWOULDBLOCK`
    /// until data arrives or the timeout fires (`ErrorKind::TimedOut`).
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let deadline = Timeout::from(timeout);
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            wait_readable(self.handle, deadline).map_err(to_io)?;
        }
    }

    /// Pushes some bytes into the stream, suspending like
    /// [`read_with_timeout`](Self::read_with_timeout).
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = Timeout::from(timeout);
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            wait_writable(self.handle, deadline).map_err(to_io)?;
        }
    }
}

fn to_io(e: Error) -> io::Error {
    match e {
        Error::Timeout => io::ErrorKind::TimedOut.into(),
        Error::IO(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl Read for CoIoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl Write for CoIoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoIoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoIoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        let _ = deregister(self.handle);
        forget(self);
        fd
    }
}

impl Drop for CoIoStream {
    fn drop(&mut self) {
        let _ = deregister(self.handle);
        unsafe {
            libc::close(self.fd);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIoListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP listener whose `accept` suspends the calling fiber.
pub struct CoIoListener {
    inner: TcpListener,
    handle: FdHandle,
}

impl CoIoListener {
    /// Binds a listener to `addr`.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<CoIoListener> {
        Self::try_from(TcpListener::bind(addr).map_err(Error::from)?)
    }

    /// Accepts a new incoming connection, suspending until one arrives.
    pub fn accept(&self) -> Result<CoIoStream> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).map_err(Error::from)?;
                    return CoIoStream::from_raw_fd(stream.into_raw_fd(), true);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_readable(self.handle, Timeout::Infinite)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl TryFrom<TcpListener> for CoIoListener {
    type Error = Error;

    fn try_from(value: TcpListener) -> Result<Self> {
        value.set_nonblocking(true).map_err(Error::from)?;
        let handle = register(value.as_raw_fd(), CoIoFlags::READ, true)?;
        Ok(Self {
            inner: value,
            handle,
        })
    }
}

impl Drop for CoIoListener {
    fn drop(&mut self) {
        let _ = deregister(self.handle);
    }
}
