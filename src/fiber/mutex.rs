//! A mutual exclusion primitive for fibers, carrying the protected data
//! like `std::sync::Mutex`.
//!
//! Release hands ownership directly to the head waiter: between the unlock
//! and the waiter's next run no third fiber can steal the lock, so FIFO
//! acquisition order is guaranteed.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::fiber::{self, FiberHandle, WaitQueue};
use crate::time::Timeout;

#[cfg(debug_assertions)]
use std::panic::Location;

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

pub struct Mutex<T: ?Sized> {
    owner: Cell<Option<FiberHandle>>,
    waiters: WaitQueue,
    #[cfg(debug_assertions)]
    lock_location: Cell<Option<&'static Location<'static>>>,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            owner: Cell::new(None),
            waiters: WaitQueue::new(),
            #[cfg(debug_assertions)]
            lock_location: Cell::default(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, yielding the current fiber until it is able to
    /// do so. A RAII guard is returned; dropping it unlocks.
    ///
    /// # Panics
    ///
    /// Panics when the calling fiber already holds the lock (the deadlock
    /// would otherwise be permanent — nobody can release for us), when
    /// called outside fiber context, or when the fiber is cancelled while
    /// waiting. Use [`try_lock`] for a non-blocking attempt.
    ///
    /// [`try_lock`]: Mutex::try_lock
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = fiber::current().expect("a mutex can only be locked from a fiber");
        loop {
            match self.owner.get() {
                None => {
                    self.owner.set(Some(me));
                    break;
                }
                // Ownership was handed to us by the releasing fiber while we
                // were queued.
                Some(h) if h == me => break,
                // The owner died without unlocking (stack discarded at
                // reactor close never runs guards); treat the lock as free.
                Some(h) if !h.is_valid() => {
                    self.owner.set(Some(me));
                    break;
                }
                Some(_) => {
                    #[cfg(debug_assertions)]
                    self.log_lock_location();
                    self.waiters
                        .wait(Timeout::Infinite)
                        .expect("fiber was cancelled while waiting on a mutex");
                }
            }
        }
        unsafe { MutexGuard::new(self) }
    }

    /// Attempts to acquire this lock without yielding. Returns `None` when
    /// the lock is held by another live fiber.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = fiber::current()?;
        match self.owner.get() {
            Some(h) if h != me && h.is_valid() => {
                #[cfg(debug_assertions)]
                self.log_lock_location();
                None
            }
            Some(h) if h == me => None,
            _ => {
                self.owner.set(Some(me));
                Some(unsafe { MutexGuard::new(self) })
            }
        }
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    ///
    /// This function is equivalent to calling [`drop`] on the guard but is
    /// more self-documenting.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs
    /// to take place -- the mutable borrow statically guarantees no locks
    /// exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn release(&self) {
        // Hand ownership to the head waiter before waking it; nobody can
        // sneak in between because no switch happens here.
        match self.waiters.pop_live() {
            Some(next) => {
                self.owner.set(Some(next));
                fiber::resume(next);
            }
            None => self.owner.set(None),
        }
    }

    #[cfg(debug_assertions)]
    #[inline]
    fn log_lock_location(&self) {
        if let Some(loc) = self.lock_location.get() {
            log::debug!("mutex is held, was locked at {loc}");
        }
    }
}

impl<T> From<T> for Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    /// This is equivalent to [`Mutex::new`].
    fn from(t: T) -> Self {
        Mutex::new(t)
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            #[cfg(debug_assertions)]
            None => {
                struct LockedPlaceholder(Option<&'static Location<'static>>);
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        if let Some(loc) = self.0 {
                            write!(f, "<locked at {loc}>")
                        } else {
                            f.write_str("<locked>")
                        }
                    }
                }
                d.field("data", &LockedPlaceholder(self.lock_location.get()));
            }
            #[cfg(not(debug_assertions))]
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
}

impl<'mutex, T: ?Sized> MutexGuard<'mutex, T> {
    #[track_caller]
    unsafe fn new(lock: &'mutex Mutex<T>) -> Self {
        #[cfg(debug_assertions)]
        lock.lock_location.set(Some(Location::caller()));
        Self { lock }
    }
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.lock_location.set(None);
        self.lock.release();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
