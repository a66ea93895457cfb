//! A one-shot rendezvous point for a fixed group of fibers.

use std::cell::Cell;
use std::fmt;

use crate::error::Result;
use crate::fiber::Event;
use crate::time::Timeout;

/// A count-down barrier.
///
/// Each of `n` fibers calls [`wait`]; the first `n - 1` park, the last one
/// trips the barrier and wakes everybody. Further calls pass through
/// immediately.
///
/// [`wait`]: Barrier::wait
pub struct Barrier {
    remaining: Cell<usize>,
    tripped: Event,
}

impl Barrier {
    pub fn new(n: usize) -> Self {
        let barrier = Self {
            remaining: Cell::new(n),
            tripped: Event::new(),
        };
        if n == 0 {
            barrier.tripped.set();
        }
        barrier
    }

    /// Blocks until the barrier trips. Returns `Ok(true)` for the one fiber
    /// whose arrival tripped it.
    pub fn wait(&self, timeout: Timeout) -> Result<bool> {
        let left = self.remaining.get();
        if left <= 1 {
            self.remaining.set(0);
            let leader = left == 1;
            self.tripped.set();
            return Ok(leader);
        }
        self.remaining.set(left - 1);
        self.tripped.wait(timeout)?;
        Ok(false)
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("remaining", &self.remaining.get())
            .finish()
    }
}
