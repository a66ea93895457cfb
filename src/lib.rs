//! Single-threaded cooperative multitasking runtime.
//!
//! `weft` multiplexes many lightweight fibers over one OS thread. A
//! [reactor](reactor) owns the thread: it schedules ready fibers
//! round-robin, drives wall-clock [timers](timer) through a hierarchical
//! time queue, parks in the kernel readiness notifier when idle so fibers
//! can [block on descriptors](coio) without blocking the thread, and hands
//! genuinely blocking work to a small [worker thread pool](cbus).
//!
//! The library contains:
//!
//! - [Fibers: spawn, suspend/resume, cancellation, synchronization](fiber)
//! - [Reactor lifecycle and the scheduler](reactor)
//! - [Timers](timer)
//! - [Cooperative I/O](coio)
//! - [The worker thread pool](cbus)
//! - [Clocks](clock) and [instants/timeouts](time)
//! - [Logging](log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! A minimal program:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! weft::run(weft::Options::default(), || {
//!     let pong = weft::fiber::spawn(|| {
//!         weft::fiber::sleep(Duration::from_millis(10)).unwrap();
//!         println!("pong");
//!     })
//!     .unwrap();
//!     println!("ping");
//!     weft::fiber::join(pong, weft::time::Timeout::Infinite).unwrap();
//! })
//! .unwrap();
//! ```
//!
//! Everything here is single-threaded by design: fibers, timers and
//! descriptor waits all live on the thread that called
//! [`reactor::open`]. The only concurrency is the worker pool behind
//! [`cbus::defer_to_thread`], reached through a pair of lock-free rings.
//!
//! POSIX + x86-64 only (epoll, mmap guard pages, SysV context switch).

pub mod cbus;
pub mod clock;
mod closure;
pub mod coio;
pub mod error;
pub mod fiber;
mod list;
pub mod log;
mod pool;
pub mod reactor;
pub mod time;
pub mod timer;

pub use error::{Error, Result};
pub use reactor::{close, critical, is_open, mainloop, open, run, stop, Options};
