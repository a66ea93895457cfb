//! Fiber stacks.
//!
//! Each fiber owns a private mmap'd stack region whose lowest page is left
//! inaccessible: the stack grows downward into the guard page, so an
//! overflow faults deterministically with SIGSEGV instead of silently
//! corrupting a neighbour allocation. The region above the guard is made
//! readable and writable in one `mprotect` after the initial `PROT_NONE`
//! reservation.

use std::io;
use std::ptr;

/// The smallest usable stack. Requests below this are rounded up.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// A contiguous fiber stack with a low guard page.
pub(crate) struct FiberStack {
    /// Highest address of the region; the stack top. Page aligned.
    top: usize,
    /// Total mapped length including the guard page.
    mmap_len: usize,
    /// Usable bytes above the guard page.
    usable: usize,
}

impl FiberStack {
    /// Creates a stack with at least `size` usable bytes plus one guard
    /// page.
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        // Round the usable part up to a page boundary and apply the
        // minimum.
        let usable = round_up(size.max(MIN_STACK_SIZE), page_size);
        let mmap_len = usable
            .checked_add(page_size)
            .expect("integer overflow while calculating stack size");

        unsafe {
            // Reserve the whole region inaccessible, then open up everything
            // above the guard page.
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Construct the value first so the mapping is released if
            // mprotect fails.
            let out = Self {
                top: mmap as usize + mmap_len,
                mmap_len,
                usable,
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Highest address of the stack. 16-byte aligned because mappings are
    /// page aligned.
    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    /// Usable bytes between the top and the guard page.
    #[inline(always)]
    pub fn usable(&self) -> usize {
        self.usable
    }

    /// First address of the guard page.
    #[inline(always)]
    pub fn guard(&self) -> usize {
        self.top - self.mmap_len
    }

    /// Tells the kernel the stack contents are no longer needed, releasing
    /// the backing pages while keeping the mapping. Used when the owning
    /// fiber record is parked on the free list.
    pub fn reclaim(&self) {
        let base = self.top - self.usable;
        // Safety: [base, top) is a live private anonymous mapping
        unsafe {
            libc::madvise(base as *mut libc::c_void, self.usable, libc::MADV_DONTNEED);
        }
    }

    /// Whether `addr` falls inside the guard page. Used by the SIGSEGV
    /// diagnostic to tell a stack overflow from an ordinary crash.
    #[inline]
    pub fn is_guard_hit(&self, addr: usize) -> bool {
        addr >= self.guard() && addr < self.guard() + page_size()
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let mmap = self.top - self.mmap_len;
        // Safety: unmapping the exact region mapped in `new`
        let ret = unsafe { libc::munmap(mmap as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

pub(crate) fn page_size() -> usize {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    debug_assert!(page_size.is_power_of_two());
    page_size
}

#[inline]
fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_page_rounded() {
        let stack = FiberStack::new(1).unwrap();
        let page = page_size();
        assert_eq!(stack.usable() % page, 0);
        assert!(stack.usable() >= MIN_STACK_SIZE);
        assert_eq!(stack.top() % 16, 0);
        assert_eq!(stack.top() - stack.guard(), stack.usable() + page);
    }

    #[test]
    fn stack_is_writable_to_the_brink() {
        let stack = FiberStack::new(MIN_STACK_SIZE).unwrap();
        let base = (stack.top() - stack.usable()) as *mut u8;
        // touch the first and last usable bytes
        unsafe {
            *base = 0xAA;
            *(stack.top() as *mut u8).offset(-1) = 0xBB;
            assert_eq!(*base, 0xAA);
        }
    }

    #[test]
    fn guard_hit_detection() {
        let stack = FiberStack::new(MIN_STACK_SIZE).unwrap();
        assert!(stack.is_guard_hit(stack.guard()));
        assert!(stack.is_guard_hit(stack.guard() + page_size() - 1));
        assert!(!stack.is_guard_hit(stack.guard() + page_size()));
        assert!(!stack.is_guard_hit(stack.top()));
    }

    #[test]
    fn reclaim_keeps_mapping_usable() {
        let stack = FiberStack::new(MIN_STACK_SIZE).unwrap();
        let probe = (stack.top() - 8) as *mut u64;
        unsafe {
            *probe = 0xDEAD_BEEF;
            stack.reclaim();
            // after MADV_DONTNEED the page reads back zeroed but stays mapped
            assert_eq!(*probe, 0);
            *probe = 1;
        }
    }
}
