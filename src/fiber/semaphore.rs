//! A counting semaphore for fibers.

use std::cell::Cell;
use std::fmt;

use crate::error::Result;
use crate::fiber::WaitQueue;
use crate::time::Timeout;

/// A counter fibers can block on.
///
/// [`acquire`] takes one permit, parking the fiber while the counter is
/// zero; [`release`] puts permits back and wakes as many waiters.
///
/// [`acquire`]: Semaphore::acquire
/// [`release`]: Semaphore::release
pub struct Semaphore {
    permits: Cell<usize>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Cell::new(permits),
            waiters: WaitQueue::new(),
        }
    }

    #[inline]
    pub fn permits(&self) -> usize {
        self.permits.get()
    }

    /// Takes one permit, blocking until one is available or the timeout
    /// fires.
    pub fn acquire(&self, timeout: Timeout) -> Result<()> {
        // Loop: a permit released to us may be snatched by a fiber that ran
        // in between without queueing.
        while self.permits.get() == 0 {
            self.waiters.wait(timeout)?;
        }
        self.permits.set(self.permits.get() - 1);
        Ok(())
    }

    /// Takes one permit without blocking. Returns whether one was taken.
    pub fn try_acquire(&self) -> bool {
        let available = self.permits.get();
        if available == 0 {
            return false;
        }
        self.permits.set(available - 1);
        true
    }

    /// Puts `n` permits back and wakes up to `n` waiters.
    pub fn release(&self, n: usize) {
        self.permits.set(self.permits.get() + n);
        for _ in 0..n {
            if !self.waiters.wake_one() {
                break;
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.permits.get())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
