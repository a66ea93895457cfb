//! Provides a cycle-based [`Instant`] implementation and the [`Timeout`]
//! accepted by every blocking call of the runtime.

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

use crate::clock;

pub use crate::clock::INFINITY;

////////////////////////////////////////////////////////////////////////////////
// Instant
////////////////////////////////////////////////////////////////////////////////

/// A measurement of a monotonically nondecreasing clock.
/// Opaque and useful only with [`Duration`].
///
/// Instants are guaranteed to be no less than any previously measured
/// instant when created. Internally an instant is a cycle count (see
/// [`clock::cycles`]); all timer and timeout arithmetic of the runtime is
/// carried out on this representation and only converted to [`Duration`] at
/// the API boundary.
///
/// Instants should generally be considered as opaque types that can only be
/// compared to one another. Prefer measuring the duration between two
/// instants, comparing two instants, and adding or subtracting a `Duration`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Instant(pub(crate) u64);

impl Instant {
    /// Returns an instant corresponding to "now". Uses the monotonic clock.
    #[must_use]
    #[inline(always)]
    pub fn now() -> Self {
        Self(clock::cycles())
    }

    /// Returns the amount of time elapsed since this instant was created.
    #[must_use]
    #[inline]
    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }

    /// Returns `Some(t)` where `t` is the time `self + duration` if `t` can
    /// be represented as `Instant`, `None` otherwise.
    #[must_use]
    #[inline]
    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        self.0
            .checked_add(clock::duration_to_cycles(duration))
            .map(Instant)
    }

    /// Returns `Some(t)` where `t` is the time `self - duration` if `t` can
    /// be represented as `Instant`, `None` otherwise.
    #[must_use]
    #[inline]
    pub fn checked_sub(&self, duration: Duration) -> Option<Instant> {
        self.0
            .checked_sub(clock::duration_to_cycles(duration))
            .map(Instant)
    }

    /// Saturating addition. Computes `self + duration`, returning the
    /// maximal possible instant if overflow occurred.
    #[must_use]
    #[inline]
    pub fn saturating_add(&self, duration: Duration) -> Instant {
        Self(self.0.saturating_add(clock::duration_to_cycles(duration)))
    }

    /// Saturating subtraction. Computes `self - duration`, returning the
    /// minimal possible instant if overflow occurred.
    #[must_use]
    #[inline]
    pub fn saturating_sub(&self, duration: Duration) -> Instant {
        Self(self.0.saturating_sub(clock::duration_to_cycles(duration)))
    }

    /// Returns the amount of time elapsed from another instant to this one,
    /// or `None` if that instant is later than this one.
    #[must_use]
    #[inline]
    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0
            .checked_sub(earlier.0)
            .map(clock::cycles_to_duration)
    }

    /// Returns the amount of time elapsed from another instant to this one,
    /// or zero duration if that instant is later than this one.
    #[must_use]
    #[inline]
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        clock::cycles_to_duration(self.0.saturating_sub(earlier.0))
    }

    /// Get the inner representation of an `Instant` in cycles.
    ///
    /// # Warning
    /// The inner representation of an instant is implementation dependent.
    /// If possible prefer working with `Instant` and `Duration` directly.
    #[inline(always)]
    pub fn as_cycles(&self) -> u64 {
        self.0
    }

    /// Reconstruct an `Instant` from a cycle count previously obtained with
    /// [`Self::as_cycles`].
    #[inline(always)]
    pub fn from_cycles(cycles: u64) -> Self {
        Self(cycles)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// This function may panic if the resulting point in time cannot be
    /// represented. See [`Instant::checked_add`] for a version without panic.
    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, other: Duration) -> Instant {
        self.checked_sub(other)
            .expect("overflow when subtracting duration from instant")
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, other: Duration) {
        *self = *self - other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Returns the amount of time elapsed from another instant to this one,
    /// or zero duration if that instant is later than this one.
    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Timeout
////////////////////////////////////////////////////////////////////////////////

/// A time bound accepted by every blocking call of the runtime.
///
/// A timeout is either an absolute deadline, infinite, or already elapsed.
/// [`Timeout::Elapsed`] makes the blocking call fail immediately with
/// [`Error::Timeout`](crate::error::Error::Timeout), which turns any wait
/// into a non-blocking poll.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Timeout {
    /// Never expires.
    Infinite,
    /// Expires when the monotonic clock reaches the deadline.
    At(Instant),
    /// Already expired, fail the wait immediately.
    Elapsed,
}

impl Timeout {
    /// A timeout expiring `duration` from now.
    #[inline]
    pub fn in_(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::Elapsed
        } else {
            Self::At(Instant::now().saturating_add(duration))
        }
    }

    /// A timeout expiring at the given instant.
    #[inline(always)]
    pub fn at(deadline: Instant) -> Self {
        Self::At(deadline)
    }

    /// The absolute deadline, if any. `None` for [`Timeout::Infinite`] and
    /// [`Timeout::Elapsed`].
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::At(deadline) => Some(*deadline),
            Self::Infinite | Self::Elapsed => None,
        }
    }

    /// Whether a wait with this timeout must fail without blocking.
    #[inline]
    pub fn has_expired(&self, now: Instant) -> bool {
        match self {
            Self::Infinite => false,
            Self::At(deadline) => *deadline <= now,
            Self::Elapsed => true,
        }
    }
}

impl From<Duration> for Timeout {
    #[inline(always)]
    fn from(duration: Duration) -> Self {
        Self::in_(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    /// `None` maps to [`Timeout::Infinite`].
    #[inline]
    fn from(duration: Option<Duration>) -> Self {
        match duration {
            Some(duration) => Self::in_(duration),
            None => Self::Infinite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition() {
        let now = Instant::now();

        assert_eq!(now.checked_add(Duration::MAX), None);
        assert_eq!(now.saturating_add(Duration::MAX), Instant(u64::MAX));

        let plus_second = now.checked_add(Duration::from_secs(1)).unwrap();
        assert_eq!(plus_second, now.saturating_add(Duration::from_secs(1)));
        assert_eq!(plus_second, now + Duration::from_secs(1));
        assert!(plus_second > now);
    }

    #[test]
    fn subtraction() {
        let now = Instant::now();

        assert_eq!(now.checked_sub(Duration::MAX), None);
        assert_eq!(now.saturating_sub(Duration::MAX), Instant(0));

        let minus_second = now.checked_sub(Duration::from_secs(1)).unwrap();
        assert_eq!(minus_second, now.saturating_sub(Duration::from_secs(1)));
        assert_eq!(minus_second, now - Duration::from_secs(1));
        assert!(minus_second < now);
    }

    #[test]
    fn duration_since() {
        let now = Instant::now();
        let plus_second = now + Duration::from_secs(1);
        let minus_second = now - Duration::from_secs(1);

        assert_eq!(
            plus_second.duration_since(minus_second),
            Duration::from_secs(2)
        );
        assert_eq!(
            plus_second.checked_duration_since(minus_second),
            Some(Duration::from_secs(2))
        );

        assert_eq!(minus_second.duration_since(plus_second), Duration::ZERO);
        assert_eq!(minus_second.checked_duration_since(plus_second), None);
    }

    #[test]
    fn timeout_expiry() {
        let now = Instant::now();
        assert!(!Timeout::Infinite.has_expired(now));
        assert!(Timeout::Elapsed.has_expired(now));
        assert!(Timeout::at(now).has_expired(now));
        assert!(!Timeout::at(now + Duration::from_secs(1)).has_expired(now));
        assert_eq!(Timeout::in_(Duration::ZERO), Timeout::Elapsed);
        assert_eq!(Timeout::from(None), Timeout::Infinite);
    }
}
