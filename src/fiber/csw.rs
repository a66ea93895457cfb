//! Context switches tracking utilities.
//!
//! Those are mostly used for testing.

/// Returns the number of context switches of the calling fiber, 0 outside
/// fiber context. The counter increments every time the scheduler switches
/// the fiber in.
#[inline]
pub fn csw() -> u64 {
    crate::fiber::current_csw()
}

/// Calls a function and checks whether it yielded.
///
/// It's mostly useful in tests.
///
/// # Example
///
/// ```no_run
/// # use weft::fiber;
/// # use weft::fiber::check_yield;
/// # use weft::fiber::YieldResult::*;
/// # use std::time::Duration;
/// assert_eq!(
///     check_yield(|| fiber::sleep(Duration::from_millis(1)).unwrap()),
///     Yielded(())
/// );
/// ```
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let csw_before = csw();
    let res = f();
    if csw() == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}
