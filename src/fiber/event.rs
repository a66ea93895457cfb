//! A level-triggered fiber event.

use std::cell::Cell;
use std::fmt;

use crate::error::Result;
use crate::fiber::WaitQueue;
use crate::time::Timeout;

/// A boolean flag fibers can wait on.
///
/// [`set`] wakes every waiter and leaves the flag raised, so late arrivals
/// pass through without blocking until somebody calls [`reset`].
///
/// [`set`]: Event::set
/// [`reset`]: Event::reset
pub struct Event {
    set: Cell<bool>,
    waiters: WaitQueue,
}

impl Event {
    pub fn new() -> Self {
        Self {
            set: Cell::new(false),
            waiters: WaitQueue::new(),
        }
    }

    /// Raises the flag and wakes all waiters.
    pub fn set(&self) {
        self.set.set(true);
        self.waiters.wake_all();
    }

    /// Clears the flag. Fibers already woken by a previous [`set`] are not
    /// re-parked.
    ///
    /// [`set`]: Event::set
    pub fn reset(&self) {
        self.set.set(false);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.get()
    }

    /// Returns immediately if the flag is raised, otherwise parks the
    /// current fiber until [`set`] or the timeout.
    ///
    /// [`set`]: Event::set
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        // Loop: the flag may be reset again between the wake and our turn to
        // run.
        while !self.set.get() {
            self.waiters.wait(timeout)?;
        }
        Ok(())
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.set.get())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
