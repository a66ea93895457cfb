//! The cascading time queue.
//!
//! A hierarchy of `LEVELS` rings of `BINS` intrusive lists. Level 0 bins
//! span one resolution unit each; a bin of level *k* spans `BINS^k` units.
//! Insertion picks the lowest level whose window still covers the deadline,
//! so both insert and cancel are O(1). As the phase counter advances past a
//! level boundary, the level's newly-current bin is *cascaded*: every entry
//! in it is re-placed and lands on a lower level, until it eventually
//! surfaces in the current level-0 bin and is popped.
//!
//! Entries beyond the deepest level's direct reach are parked in its
//! farthest bin and re-placed on every cascade until a level can hold them;
//! only deadlines beyond the total span are rejected with `TooFarAhead`.
//!
//! All deadline arithmetic is in resolution units relative to the queue's
//! origin; cycles appear only at the public boundary.

use crate::closure::InlineCallback;
use crate::error::{Error, Result};
use crate::list::{Linked, List, ListLink};
use crate::pool::{Pool, RawHandle, SlotId};

/// Inline payload bound for timer callbacks.
pub(crate) const TIMER_CALLBACK_INLINE: usize = 64;

pub(crate) type TimerCallback = InlineCallback<TIMER_CALLBACK_INLINE>;

/// How a timer entry re-arms after firing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Repeat {
    /// Fire once, then release the entry.
    No,
    /// Periodic with the next deadline snapped to the `deadline + k*interval`
    /// grid, so dispatch jitter does not accumulate.
    Aligned(u64),
    /// Periodic with the next deadline at `now + interval`.
    Unaligned(u64),
}

pub(crate) struct TimerEntry {
    link: ListLink,
    /// Flat bin index (`level * BINS + bin`) while the entry is linked.
    bin: u32,
    deadline_units: u64,
    repeat: Repeat,
    callback: Option<TimerCallback>,
    /// Set by `cancel` while the entry is unlinked for dispatch.
    cancelled: bool,
}

impl Linked for TimerEntry {
    fn link(&self) -> &ListLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink {
        &mut self.link
    }
}

impl TimerEntry {
    fn empty() -> Self {
        Self {
            link: ListLink::default(),
            bin: 0,
            deadline_units: 0,
            repeat: Repeat::No,
            callback: None,
            cancelled: false,
        }
    }
}

/// The wheel proper. `BINS` must be a power of two, `LEVELS` at least 2.
pub(crate) struct Wheel<const BINS: usize, const LEVELS: usize> {
    /// Cycles per resolution unit.
    resolution: u64,
    /// Cycle timestamp of unit zero.
    origin: u64,
    /// Total resolution units popped since open.
    phase: u64,
    /// `LEVELS * BINS` intrusive lists, indexed `level * BINS + bin`.
    bins: Vec<List>,
    entries: Pool<TimerEntry>,
    /// Entries currently linked into a bin (excludes in-dispatch entries).
    armed: usize,
}

impl<const BINS: usize, const LEVELS: usize> Wheel<BINS, LEVELS> {
    /// Granularity of a level in resolution units.
    const fn granularity(level: usize) -> u64 {
        let mut g = 1u64;
        let mut i = 0;
        while i < level {
            g *= BINS as u64;
            i += 1;
        }
        g
    }

    /// Total accepted span in resolution units: the direct reach of the
    /// deepest level plus the laps its farthest bin can defer.
    pub fn span_units() -> u64 {
        (BINS as u64 - 1) * Self::granularity(LEVELS) + 1
    }

    pub fn new(capacity: usize, resolution_cycles: u64, origin_cycles: u64) -> Self {
        assert!(BINS.is_power_of_two() && BINS >= 2);
        assert!(LEVELS >= 2);
        assert!(resolution_cycles >= 1);
        Self {
            resolution: resolution_cycles,
            origin: origin_cycles,
            phase: 0,
            bins: vec![List::new(); BINS * LEVELS],
            entries: Pool::new(capacity, |_| TimerEntry::empty()),
            armed: 0,
        }
    }

    #[inline(always)]
    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.armed == 0
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.armed
    }

    /// Deadline cycles → absolute unit, rounding up so an entry never fires
    /// before its deadline.
    #[inline]
    fn unit_ceil(&self, cycles: u64) -> u64 {
        let rel = cycles.saturating_sub(self.origin);
        (rel + self.resolution - 1) / self.resolution
    }

    /// Now cycles → the last fully elapsed unit.
    #[inline]
    fn unit_floor(&self, cycles: u64) -> u64 {
        cycles.saturating_sub(self.origin) / self.resolution
    }

    /// Interval cycles → units, at least one.
    #[inline]
    fn interval_units(&self, cycles: u64) -> u64 {
        ((cycles + self.resolution - 1) / self.resolution).max(1)
    }

    ////////////////////////////////////////////////////////////////////////
    // insert / cancel
    ////////////////////////////////////////////////////////////////////////

    pub fn insert(
        &mut self,
        deadline_cycles: u64,
        repeat_cycles: Repeat,
        callback: TimerCallback,
    ) -> Result<RawHandle> {
        let deadline_units = self.unit_ceil(deadline_cycles);
        if deadline_units.saturating_sub(self.phase) >= Self::span_units() {
            return Err(Error::TooFarAhead);
        }
        let repeat = match repeat_cycles {
            Repeat::No => Repeat::No,
            Repeat::Aligned(iv) => Repeat::Aligned(self.interval_units(iv)),
            Repeat::Unaligned(iv) => Repeat::Unaligned(self.interval_units(iv)),
        };
        let id = self
            .entries
            .allocate()
            .ok_or(Error::PoolDepleted("timer entry"))?;
        {
            let entry = self.entries.get_mut(id);
            entry.deadline_units = deadline_units;
            entry.repeat = repeat;
            entry.callback = Some(callback);
            entry.cancelled = false;
        }
        self.place(id);
        Ok(self.entries.handle(id))
    }

    /// Unlinks and releases the entry behind the handle. Returns whether a
    /// live entry was cancelled. An entry currently out for dispatch is
    /// marked and released after its callback returns.
    pub fn cancel(&mut self, h: RawHandle) -> bool {
        if !self.entries.is_valid(h) {
            return false;
        }
        let id = h.id;
        if self.entries.get(id).link().is_linked() {
            self.unlink(id);
            self.entries.get_mut(id).callback = None;
            self.entries.release(id);
        } else {
            self.entries.get_mut(id).cancelled = true;
        }
        true
    }

    /// Places an allocated entry into the bin dictated by its deadline.
    fn place(&mut self, id: SlotId) {
        let d = self.entries.get(id).deadline_units;
        let (level, bin) = if d <= self.phase {
            // Already expired entries live in the current level-0 bin.
            (0, (self.phase % BINS as u64) as usize)
        } else {
            let mut placed = None;
            for level in 0..LEVELS {
                let g = Self::granularity(level);
                let end = (self.phase / g + BINS as u64) * g;
                if d < end {
                    placed = Some((level, ((d / g) % BINS as u64) as usize));
                    break;
                }
            }
            // Beyond direct reach: park in the deepest level's farthest bin
            // and refine on cascade.
            placed.unwrap_or_else(|| {
                let g = Self::granularity(LEVELS - 1);
                let bin = ((self.phase / g + BINS as u64 - 1) % BINS as u64) as usize;
                (LEVELS - 1, bin)
            })
        };
        let flat = level * BINS + bin;
        self.entries.get_mut(id).bin = flat as u32;
        let mut list = self.bins[flat];
        list.push_back(&mut self.entries, id);
        self.bins[flat] = list;
        self.armed += 1;
    }

    fn unlink(&mut self, id: SlotId) {
        let flat = self.entries.get(id).bin as usize;
        let mut list = self.bins[flat];
        list.remove(&mut self.entries, id);
        self.bins[flat] = list;
        self.armed -= 1;
    }

    ////////////////////////////////////////////////////////////////////////
    // advance / pop
    ////////////////////////////////////////////////////////////////////////

    /// Units until the nearest non-empty bin would become current, across
    /// all levels. `None` when no entry is armed. Zero means the current
    /// level-0 bin has due entries.
    fn ticks_to_next(&self) -> Option<u64> {
        let mut best: Option<u64> = None;
        for level in 0..LEVELS {
            let g = Self::granularity(level);
            let current = ((self.phase / g) % BINS as u64) as usize;
            for offset in 0..BINS {
                let bin = (current + offset) % BINS;
                if self.bins[level * BINS + bin].is_empty() {
                    continue;
                }
                debug_assert!(
                    level == 0 || offset != 0,
                    "current bins above level 0 must be empty after cascade"
                );
                let dist = if offset == 0 {
                    0
                } else {
                    (self.phase / g + offset as u64) * g - self.phase
                };
                if best.map_or(true, |b| dist < b) {
                    best = Some(dist);
                }
                break;
            }
        }
        best
    }

    /// Rotates the levels whose bin boundary was crossed by the last phase
    /// jump, re-placing every entry of each newly-current bin.
    fn cascade_crossings(&mut self, old_phase: u64) {
        for level in (1..LEVELS).rev() {
            let g = Self::granularity(level);
            if self.phase / g == old_phase / g {
                continue;
            }
            let bin = ((self.phase / g) % BINS as u64) as usize;
            let flat = level * BINS + bin;
            loop {
                let mut list = self.bins[flat];
                let id = list.pop_front(&mut self.entries);
                self.bins[flat] = list;
                match id {
                    Some(id) => {
                        self.armed -= 1;
                        self.place(id);
                    }
                    None => break,
                }
            }
        }
    }

    /// Advances the phase up to `now_units`, stopping early when the
    /// current level-0 bin holds due work.
    fn advance(&mut self, now_units: u64) {
        loop {
            let bin0 = (self.phase % BINS as u64) as usize;
            if !self.bins[bin0].is_empty() {
                return;
            }
            if self.phase >= now_units {
                return;
            }
            let step = match self.ticks_to_next() {
                // Nothing armed anywhere, snap to now.
                None => {
                    self.phase = now_units;
                    return;
                }
                Some(hint) => hint.min(now_units - self.phase),
            };
            debug_assert!(step > 0);
            let old_phase = self.phase;
            self.phase += step;
            self.cascade_crossings(old_phase);
        }
    }

    /// Whether any entry is due at `now`.
    pub fn has_due(&mut self, now_cycles: u64) -> bool {
        let now_units = self.unit_floor(now_cycles);
        self.advance(now_units);
        !self.bins[(self.phase % BINS as u64) as usize].is_empty()
    }

    /// Pops the next due entry, advancing the phase as far as `now` allows.
    /// The entry stays allocated (its callback is out for dispatch); finish
    /// with [`Self::finish_dispatch`] or [`Self::release`].
    pub fn pop_due(&mut self, now_cycles: u64) -> Option<SlotId> {
        let now_units = self.unit_floor(now_cycles);
        self.advance(now_units);
        let bin0 = (self.phase % BINS as u64) as usize;
        let mut list = self.bins[bin0];
        let id = list.pop_front(&mut self.entries);
        self.bins[bin0] = list;
        if id.is_some() {
            self.armed -= 1;
        }
        id
    }

    /// Moves the callback out of a popped entry for dispatch outside any
    /// reactor borrow.
    pub fn take_callback(&mut self, id: SlotId) -> TimerCallback {
        self.entries
            .get_mut(id)
            .callback
            .take()
            .expect("popped timer entry has no callback")
    }

    /// Puts a dispatched entry to rest: releases one-shots and cancelled
    /// entries, re-arms periodic ones with the next deadline.
    pub fn finish_dispatch(&mut self, id: SlotId, callback: TimerCallback, now_cycles: u64) {
        let now_units = self.unit_floor(now_cycles);
        let entry = self.entries.get_mut(id);
        if entry.cancelled {
            self.entries.release(id);
            return;
        }
        match entry.repeat {
            Repeat::No => {
                self.entries.release(id);
            }
            Repeat::Aligned(interval) => {
                let deadline = entry.deadline_units;
                let missed = now_units.saturating_sub(deadline) / interval + 1;
                entry.deadline_units = deadline + missed * interval;
                entry.callback = Some(callback);
                self.place(id);
            }
            Repeat::Unaligned(interval) => {
                entry.deadline_units = now_units + interval;
                entry.callback = Some(callback);
                self.place(id);
            }
        }
    }

    /// Releases a popped entry without re-arming, whatever its repeat mode.
    pub fn release(&mut self, id: SlotId) {
        self.entries.get_mut(id).callback = None;
        self.entries.release(id);
    }

    /// Cycles until the next entry can fire, `None` when nothing is armed.
    pub fn time_to_next(&mut self, now_cycles: u64) -> Option<u64> {
        let now_units = self.unit_floor(now_cycles);
        self.advance(now_units);
        let hint = self.ticks_to_next()?;
        if hint == 0 {
            return Some(0);
        }
        let due_cycles = self
            .origin
            .saturating_add((self.phase + hint).saturating_mul(self.resolution));
        Some(due_cycles.saturating_sub(now_cycles))
    }

    /// Deadline of a popped entry in cycles, for dispatch diagnostics.
    pub fn deadline_cycles(&self, id: SlotId) -> u64 {
        self.origin + self.entries.get(id).deadline_units * self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn noop() -> TimerCallback {
        TimerCallback::new(|| {})
    }

    type SmallWheel = Wheel<4, 3>;

    /// Drains the wheel by repeatedly advancing `now` by `time_to_next`,
    /// returning `(pop_time, deadline)` pairs in pop order.
    fn drain<const BINS: usize, const LEVELS: usize>(
        wheel: &mut Wheel<BINS, LEVELS>,
        mut now: u64,
    ) -> Vec<(u64, u64)> {
        let mut popped = vec![];
        loop {
            while let Some(id) = wheel.pop_due(now) {
                popped.push((now, wheel.deadline_cycles(id)));
                wheel.release(id);
            }
            match wheel.time_to_next(now) {
                Some(dt) => now += dt.max(1),
                None => break,
            }
        }
        popped
    }

    #[test]
    fn scrambled_deadlines_pop_in_order() {
        let deadlines = [
            0u64, 30, 41, 70, 71, 110, 111, 150, 151, 190, 191, 350, 351, 510, 511, 643, 670,
            671, 830,
        ];
        // insert in a scrambled order
        let mut scrambled = deadlines.to_vec();
        scrambled.reverse();
        scrambled.swap(0, 7);
        scrambled.swap(3, 11);

        let mut wheel = SmallWheel::new(32, 10, 0);
        for &d in &scrambled {
            wheel.insert(d, Repeat::No, noop()).unwrap();
        }
        assert_eq!(wheel.len(), deadlines.len());

        let popped = drain(&mut wheel, 0);
        assert_eq!(popped.len(), deadlines.len());
        assert!(wheel.is_empty());

        // popped in deadline order, within one resolution unit
        let mut expected: Vec<u64> = deadlines.iter().map(|d| (d + 9) / 10 * 10).collect();
        expected.sort_unstable();
        let got: Vec<u64> = popped.iter().map(|(_, d)| *d).collect();
        assert_eq!(got, expected);
        for (popped_at, deadline) in popped {
            assert!(popped_at + 10 >= deadline, "{} fired early", deadline);
            assert!(popped_at <= deadline + 10, "{} fired late", deadline);
        }
    }

    #[test]
    fn insert_pop_round_trip() {
        let mut wheel = SmallWheel::new(16, 1, 0);
        for d in [5u64, 1, 9, 3, 3, 7] {
            wheel.insert(d, Repeat::No, noop()).unwrap();
        }
        let popped = drain(&mut wheel, 0);
        let got: Vec<u64> = popped.iter().map(|(_, d)| *d).collect();
        assert_eq!(got, vec![1, 3, 3, 5, 7, 9]);
    }

    #[test]
    fn span_boundary() {
        let mut wheel = SmallWheel::new(4, 1, 0);
        let span = SmallWheel::span_units();
        assert_eq!(span, 3 * 64 + 1);
        assert!(wheel.insert(span - 1, Repeat::No, noop()).is_ok());
        match wheel.insert(span, Repeat::No, noop()) {
            Err(Error::TooFarAhead) => {}
            other => panic!("expected TooFarAhead, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unit_resolution_still_cascades() {
        // resolution of a single cycle exercises the deepest folds
        let mut wheel = Wheel::<4, 2>::new(8, 1, 0);
        for d in [15u64, 2, 9, 12] {
            wheel.insert(d, Repeat::No, noop()).unwrap();
        }
        let got: Vec<u64> = drain(&mut wheel, 0).iter().map(|(_, d)| *d).collect();
        assert_eq!(got, vec![2, 9, 12, 15]);
    }

    #[test]
    fn cancel_unlinks_in_constant_time() {
        let mut wheel = SmallWheel::new(8, 10, 0);
        let keep = wheel.insert(50, Repeat::No, noop()).unwrap();
        let gone = wheel.insert(70, Repeat::No, noop()).unwrap();
        assert!(wheel.cancel(gone));
        assert!(!wheel.cancel(gone), "cancel must be idempotent");
        let got: Vec<u64> = drain(&mut wheel, 0).iter().map(|(_, d)| *d).collect();
        assert_eq!(got, vec![50]);
        assert!(wheel.cancel(keep) == false);
    }

    #[test]
    fn expired_deadline_pops_immediately() {
        let mut wheel = SmallWheel::new(4, 10, 0);
        // move the phase forward first
        assert!(wheel.pop_due(200).is_none());
        wheel.insert(40, Repeat::No, noop()).unwrap();
        let id = wheel.pop_due(200).expect("expired entry must be due");
        wheel.release(id);
    }

    #[test]
    fn aligned_rearm_snaps_to_grid() {
        let mut wheel = SmallWheel::new(4, 10, 0);
        let h = wheel.insert(100, Repeat::Aligned(100), noop()).unwrap();
        let id = wheel.pop_due(100).unwrap();
        let cb = wheel.take_callback(id);
        // the callback ran long: re-arm at 250 must snap to 300, not 350
        wheel.finish_dispatch(id, cb, 250);
        let id = wheel.pop_due(300).unwrap();
        assert_eq!(wheel.deadline_cycles(id), 300);
        let cb = wheel.take_callback(id);
        wheel.finish_dispatch(id, cb, 300);
        assert!(wheel.cancel(h));
    }

    #[test]
    fn unaligned_rearm_floats() {
        let mut wheel = SmallWheel::new(4, 10, 0);
        let h = wheel.insert(100, Repeat::Unaligned(100), noop()).unwrap();
        let id = wheel.pop_due(100).unwrap();
        let cb = wheel.take_callback(id);
        wheel.finish_dispatch(id, cb, 250);
        let id = wheel.pop_due(350).unwrap();
        assert_eq!(wheel.deadline_cycles(id), 350);
        wheel.release(id);
        assert!(wheel.cancel(h));
    }

    #[test]
    fn cancel_during_dispatch_releases_after() {
        let mut wheel = SmallWheel::new(4, 10, 0);
        let h = wheel.insert(10, Repeat::Unaligned(10), noop()).unwrap();
        let id = wheel.pop_due(10).unwrap();
        let cb = wheel.take_callback(id);
        assert!(wheel.cancel(h), "in-dispatch cancel is accepted");
        wheel.finish_dispatch(id, cb, 10);
        assert!(wheel.is_empty());
        assert!(wheel.time_to_next(20).is_none());
    }

    #[test]
    fn time_to_next_skips_empty_bins() {
        let mut wheel = SmallWheel::new(4, 10, 0);
        wheel.insert(400, Repeat::No, noop()).unwrap();
        let dt = wheel.time_to_next(0).unwrap();
        assert!(dt > 0 && dt <= 400);
        assert_eq!(wheel.time_to_next(400), Some(0));
    }

    #[test]
    fn depleted_entry_pool() {
        let mut wheel = SmallWheel::new(1, 10, 0);
        wheel.insert(10, Repeat::No, noop()).unwrap();
        match wheel.insert(20, Repeat::No, noop()) {
            Err(Error::PoolDepleted(_)) => {}
            other => panic!("expected PoolDepleted, got {:?}", other.map(|_| ())),
        }
    }
}
