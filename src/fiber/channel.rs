//! A bounded channel between fibers.
//!
//! Capacity zero makes the channel a rendezvous point: a send completes only
//! once a receiver has taken the value, either because one was already
//! parked or by parking the sender alongside its value until one arrives.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::fiber::{self, FiberHandle, WaitQueue};
use crate::time::Timeout;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

/// A bounded multi-producer multi-consumer channel. Cheap to clone; all
/// clones talk to the same queue.
pub struct Channel<T> {
    inner: Rc<Inner<T>>,
}

struct Inner<T> {
    capacity: usize,
    buffer: RefCell<VecDeque<T>>,
    /// Senders parked with their value on a rendezvous channel.
    handoff: RefCell<VecDeque<(FiberHandle, T)>>,
    tx_waiters: WaitQueue,
    rx_waiters: WaitQueue,
    closed: Cell<bool>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Channel<T> {
    /// Creates a channel buffering up to `capacity` values. Capacity zero
    /// yields a rendezvous channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(Inner {
                capacity,
                buffer: RefCell::new(VecDeque::new()),
                handoff: RefCell::new(VecDeque::new()),
                tx_waiters: WaitQueue::new(),
                rx_waiters: WaitQueue::new(),
                closed: Cell::new(false),
            }),
        }
    }

    /// Closes the channel and wakes everybody. Values already buffered stay
    /// receivable; further sends are refused.
    pub fn close(&self) {
        self.inner.closed.set(true);
        self.inner.tx_waiters.wake_all();
        self.inner.rx_waiters.wake_all();
        // Rendezvous senders learn about the close on their own wake.
        let parked: Vec<FiberHandle> = self
            .inner
            .handoff
            .borrow()
            .iter()
            .map(|(h, _)| *h)
            .collect();
        for h in parked {
            fiber::resume(h);
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.buffer.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.buffer.borrow().is_empty()
    }

    /// Sends a value, parking the current fiber while the buffer is full
    /// (or, on a rendezvous channel, until a receiver takes it).
    pub fn send(&self, t: T) -> StdResult<(), SendError<T>> {
        self.send_inner(t, Timeout::Infinite)
    }

    pub fn send_timeout(&self, t: T, timeout: Duration) -> StdResult<(), SendError<T>> {
        self.send_inner(t, Timeout::in_(timeout))
    }

    pub fn try_send(&self, t: T) -> StdResult<(), TrySendError<T>> {
        self.send_inner(t, Timeout::Elapsed).map_err(From::from)
    }

    fn send_inner(&self, t: T, timeout: Timeout) -> StdResult<(), SendError<T>> {
        let inner = &*self.inner;
        if inner.capacity == 0 {
            return self.send_rendezvous(t, timeout);
        }
        let mut value = t;
        loop {
            if inner.closed.get() {
                return Err(SendError::Disconnected(value));
            }
            if inner.buffer.borrow().len() < inner.capacity {
                inner.buffer.borrow_mut().push_back(value);
                inner.rx_waiters.wake_one();
                return Ok(());
            }
            match inner.tx_waiters.wait(timeout) {
                Ok(()) => continue,
                Err(Error::Timeout) => return Err(SendError::Timeout(value)),
                Err(_) => return Err(SendError::Disconnected(value)),
            }
        }
    }

    fn send_rendezvous(&self, t: T, timeout: Timeout) -> StdResult<(), SendError<T>> {
        let inner = &*self.inner;
        if inner.closed.get() {
            return Err(SendError::Disconnected(t));
        }
        // A parked receiver takes the value right away; the wake below is
        // guaranteed to reach it because nothing else pops the buffer first.
        if !inner.rx_waiters.is_empty() {
            inner.buffer.borrow_mut().push_back(t);
            inner.rx_waiters.wake_one();
            return Ok(());
        }
        let me = match fiber::current() {
            Some(me) => me,
            None => return Err(SendError::Disconnected(t)),
        };
        inner.handoff.borrow_mut().push_back((me, t));
        let res = fiber::suspend(timeout);
        // Our entry gone means a receiver took the value, whatever the
        // suspend outcome was.
        let mine = {
            let mut handoff = inner.handoff.borrow_mut();
            match handoff.iter().position(|(h, _)| *h == me) {
                Some(i) => handoff.remove(i).map(|(_, v)| v),
                None => None,
            }
        };
        match mine {
            None => Ok(()),
            Some(value) => match res {
                Err(Error::Timeout) => Err(SendError::Timeout(value)),
                // Closed, cancelled or spuriously woken with no taker.
                _ => Err(SendError::Disconnected(value)),
            },
        }
    }

    /// Receives a value, parking the current fiber while the channel is
    /// empty.
    pub fn recv(&self) -> StdResult<T, RecvError> {
        self.recv_inner(Timeout::Infinite)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> StdResult<T, RecvError> {
        self.recv_inner(Timeout::in_(timeout))
    }

    pub fn try_recv(&self) -> StdResult<T, TryRecvError> {
        self.recv_inner(Timeout::Elapsed).map_err(From::from)
    }

    fn recv_inner(&self, timeout: Timeout) -> StdResult<T, RecvError> {
        let inner = &*self.inner;
        loop {
            if let Some(v) = inner.buffer.borrow_mut().pop_front() {
                inner.tx_waiters.wake_one();
                return Ok(v);
            }
            // Rendezvous: take straight from a parked sender.
            let handed = inner.handoff.borrow_mut().pop_front();
            if let Some((sender, v)) = handed {
                fiber::resume(sender);
                return Ok(v);
            }
            if inner.closed.get() {
                return Err(RecvError::Disconnected);
            }
            match inner.rx_waiters.wait(timeout) {
                Ok(()) => continue,
                Err(Error::Timeout) => return Err(RecvError::Timeout),
                Err(_) => return Err(RecvError::Disconnected),
            }
        }
    }

    /// A blocking iterator over received values, ending when the channel is
    /// closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }

    /// A non-blocking iterator, ending at the first would-block.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { chan: self }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

pub struct Iter<'a, T: 'a> {
    chan: &'a Channel<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.recv().ok()
    }
}

pub struct TryIter<'a, T: 'a> {
    chan: &'a Channel<T>,
}

impl<'a, T> Iterator for TryIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.try_recv().ok()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Timeout(T),
    Disconnected(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(t) | Self::Disconnected(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Disconnected(t) => t,
        }
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Disconnected(t) => Self::Disconnected(t),
            SendError::Timeout(t) => Self::Full(t),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Disconnected => Self::Disconnected,
            RecvError::Timeout => Self::Empty,
        }
    }
}
