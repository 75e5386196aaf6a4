//! Cascading (hierarchical) timer wheel with intrusive entries.
//!
//! Time is partitioned into bins of `resolution` cycles. Level 0 covers the
//! next `num_bins` bins; each higher level's bins are `num_bins` times wider
//! than the level below, so `num_levels` levels span
//! `num_bins·(num_bins^num_levels − 1)/(num_bins − 1)` level-0 bins in total.
//! Entries beyond that span are rejected rather than silently parked.
//!
//! # Data model
//!
//! ```text
//!                    TimerWheel<T>
//!   +--------------------------------------------------------+
//!   |  level 0:  [b0][b1][b2] ... [bN-1]   width = R cycles  |
//!   |  level 1:  [b0][b1][b2] ... [bN-1]   width = N·R       |
//!   |  level 2:  [b0][b1][b2] ... [bN-1]   width = N²·R      |
//!   |                                                        |
//!   |  base_time   cycle at which the current level-0        |
//!   |              window started (rebased on wrap)          |
//!   |  popped_time base_time + bins advanced since rebase    |
//!   |  offset      cumulative level-0 bins advanced;         |
//!   |              offset % N is the current bin,            |
//!   |              offset / N^i is level i's cursor          |
//!   +--------------------------------------------------------+
//! ```
//!
//! Each bin is an intrusive FIFO list; entries supply their own links
//! ([`TimerEntry`]), so the wheel allocates nothing and cancellation is an
//! O(1) unlink.
//!
//! # Algorithm
//!
//! - **Insert**: `idx = ⌈(tp − base_time)/resolution⌉` counts level-0 bins
//!   from the window start. While `idx` does not fit a level (`idx >=
//!   num_bins`), divide-and-subtract (`idx = idx/num_bins − 1`) and move one
//!   level up. Entries already due (`tp <= popped_time`) go straight into
//!   the current bin and surface on the next pop.
//! - **Pop**: return the head of the current bin while it is due; otherwise
//!   advance one bin (`offset += 1`, `popped_time += resolution`) until `now
//!   < popped_time`. Whenever `offset` wraps a multiple of `num_bins`, the
//!   window rebases (`base_time = popped_time`) and level 1 cascades.
//! - **Cascade**: drain the level's just-passed bin and re-insert every
//!   entry through the normal path; with the rebased window each lands
//!   strictly below. A level whose own cursor wrapped cascades the level
//!   above, recursively.
//!
//! # Invariants
//!
//! - An entry in `bins[i][j]` has its `time_point` inside that bin's
//!   currently-mapped window; within a bin, entries pop in insertion order.
//! - `base_time <= popped_time` and
//!   `popped_time − base_time <= num_bins·resolution` at all times.
//! - A cascade leaves the drained bin empty and never changes the number of
//!   entries in the wheel.
//!
//! Expiry is bin-granular: an entry never pops before its `time_point`, but
//! may pop up to one bin late relative to it.
//!
//! # Complexity
//!
//! Insert and cancel are O(num_levels) worst case, O(1) typical. Pops are
//! O(1) amortized; a cascade touches each entry of one bin and runs once per
//! `num_bins^level` pops.

use crate::stdx::list::{List, ListNode};
use crate::tsc::TscTimePoint;
use core::fmt;
use core::ptr::NonNull;

/// Upper bound on `num_levels`, so stats can stay `Copy`.
pub const MAX_WHEEL_LEVELS: usize = 8;

/// Link tag for timer membership; lets entry types carry other intrusive
/// links alongside.
pub enum WheelTag {}

/// Entries the wheel can schedule: an intrusive link plus a deadline.
///
/// Entry lifetime is the caller's problem; the wheel only links entries it
/// was handed and forgets them on pop/remove.
pub trait TimerEntry: ListNode<WheelTag> {
    /// The cycle instant at which the entry becomes due. Must not change
    /// while the entry is linked into a wheel.
    fn time_point(&self) -> TscTimePoint;
}

/// Insertion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The entry's deadline lies beyond the wheel's span. Carries the wheel
    /// state needed to diagnose the overshoot.
    TooFarAhead {
        time_point: u64,
        base_time: u64,
        popped_time: u64,
        offset: u64,
        resolution_cycles: u64,
    },
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            InsertError::TooFarAhead {
                time_point,
                base_time,
                popped_time,
                offset,
                resolution_cycles,
            } => write!(
                f,
                "timer too far ahead: time_point={} base_time={} popped_time={} \
                 offset={} resolution={}",
                time_point, base_time, popped_time, offset, resolution_cycles
            ),
        }
    }
}

impl std::error::Error for InsertError {}

/// Operation counters. Always recorded; snapshot by value.
///
/// `cascades[i]` counts cascades that drained a level-`i` bin, `1 <= i <
/// num_levels`; index 0 is unused (level 0 never cascades).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelStats {
    pub inserted: u64,
    pub popped: u64,
    pub cancelled: u64,
    pub cascades: [u64; MAX_WHEEL_LEVELS],
}

/// Hierarchical timer wheel over caller-owned intrusive entries.
pub struct TimerWheel<T: TimerEntry> {
    num_bins: usize,
    num_levels: usize,
    resolution: u64,
    base_time: u64,
    popped_time: u64,
    offset: u64,
    /// `num_levels * num_bins` lists, row-major by level. Boxed so bin
    /// addresses stay stable while entries hold owner pointers, even if the
    /// wheel struct itself moves.
    bins: Box<[List<T, WheelTag>]>,
    len: usize,
    stats: WheelStats,
}

impl<T: TimerEntry> TimerWheel<T> {
    /// Creates a wheel starting its window at `start`.
    ///
    /// # Panics
    /// If `num_bins` is not a power of two, `num_levels` is 0 or exceeds
    /// [`MAX_WHEEL_LEVELS`], or `resolution_cycles` is 0.
    pub fn new(
        num_bins: usize,
        num_levels: usize,
        resolution_cycles: u64,
        start: TscTimePoint,
    ) -> Self {
        assert!(num_bins.is_power_of_two(), "num_bins must be a power of two");
        assert!(num_bins >= 2, "num_bins must be at least 2");
        assert!(
            num_levels >= 1 && num_levels <= MAX_WHEEL_LEVELS,
            "num_levels out of range"
        );
        assert!(resolution_cycles > 0, "resolution must be positive");
        // The full span in level-0 bins must be addressable in u64 math.
        let mut width = 1u64;
        for _ in 0..num_levels {
            width = width
                .checked_mul(num_bins as u64)
                .expect("wheel span overflows u64");
        }

        let bins = (0..num_bins * num_levels)
            .map(|_| List::init())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            num_bins,
            num_levels,
            resolution: resolution_cycles,
            base_time: start.as_cycles(),
            popped_time: start.as_cycles(),
            offset: 0,
            bins,
            len: 0,
            stats: WheelStats::default(),
        }
    }

    /// Total forward span, in level-0 bins:
    /// `num_bins·(num_bins^num_levels − 1)/(num_bins − 1)`.
    pub fn span_in_bins(&self) -> u64 {
        let nb = self.num_bins as u64;
        let mut span = 0u64;
        let mut width = nb;
        for _ in 0..self.num_levels {
            span += width;
            width *= nb;
        }
        span
    }

    /// Number of scheduled entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Width of a level-0 bin in cycles.
    #[inline]
    pub fn resolution_cycles(&self) -> u64 {
        self.resolution
    }

    /// Start of the current level-0 window.
    #[inline]
    pub fn base_time(&self) -> TscTimePoint {
        TscTimePoint::from_cycles(self.base_time)
    }

    /// Instant up to which expiry has advanced.
    #[inline]
    pub fn popped_time(&self) -> TscTimePoint {
        TscTimePoint::from_cycles(self.popped_time)
    }

    /// Counter snapshot.
    #[inline]
    pub fn stats(&self) -> WheelStats {
        self.stats
    }

    /// Schedules `entry` at its `time_point`.
    ///
    /// Entries at or before `popped_time` land in the current bin and pop on
    /// the next [`pop`](Self::pop). Entries beyond the span fail with
    /// [`InsertError::TooFarAhead`].
    ///
    /// # Panics
    /// If the entry is already linked (into this or any other list).
    pub fn insert(&mut self, entry: &mut T) -> Result<(), InsertError> {
        self.place(entry)?;
        self.len += 1;
        self.stats.inserted += 1;
        Ok(())
    }

    /// Cancels a pending entry in O(1).
    ///
    /// # Panics
    /// If the entry is not linked into this wheel.
    pub fn remove(&mut self, entry: &mut T) {
        let owner = entry
            .list_link_ref()
            .owner()
            .expect("removing an entry that is not scheduled");

        let base = self.bins.as_ptr() as usize;
        let addr = owner.as_ptr() as usize;
        let size = core::mem::size_of::<List<T, WheelTag>>();
        assert!(
            addr >= base && addr < base + size * self.bins.len(),
            "entry scheduled on a different wheel"
        );

        // SAFETY: owner points into our boxed bin slice, checked above; we
        // hold &mut self, so no other bin access is live.
        unsafe { (*owner.as_ptr()).unlink(entry) };
        self.len -= 1;
        self.stats.cancelled += 1;
    }

    /// Pops the next due entry, or `None` once everything due by `now` has
    /// been delivered. Advances the wheel (and cascades) as a side effect.
    ///
    /// Call repeatedly with the same `now` until `None` to drain everything
    /// due. Entries pop in bin order, FIFO within a bin.
    pub fn pop(&mut self, now: TscTimePoint) -> Option<NonNull<T>> {
        let now = now.as_cycles();
        let nb = self.num_bins as u64;

        loop {
            let bin = (self.offset % nb) as usize;
            if let Some(head) = self.bins[bin].front() {
                // SAFETY: linked entries are alive by the caller contract.
                let due = unsafe { head.as_ref().time_point().as_cycles() };
                if due <= now {
                    let popped = self.bins[bin].pop_front();
                    debug_assert!(popped == Some(head));
                    self.len -= 1;
                    self.stats.popped += 1;
                    return popped;
                }
                // Entries in the current bin are never later than the bin
                // window, so a non-due head implies now is inside the bin.
                debug_assert!(now < self.popped_time);
                return None;
            }

            if now < self.popped_time {
                return None;
            }

            if self.len == 0 {
                self.fast_forward(now);
                return None;
            }

            self.offset += 1;
            self.popped_time += self.resolution;
            if self.offset % nb == 0 {
                self.base_time = self.popped_time;
                self.cascade(1);
            }
        }
    }

    /// Jumps the cursor straight past `now`. Only legal while the wheel is
    /// empty: there is nothing to cascade, so rebasing is pure arithmetic.
    fn fast_forward(&mut self, now: u64) {
        debug_assert!(self.len == 0);
        debug_assert!(now >= self.popped_time);

        let nb = self.num_bins as u64;
        // The construction start anchors the bin grid.
        let start = self.popped_time - self.offset * self.resolution;
        self.offset = (now - start) / self.resolution + 1;
        self.popped_time = start + self.offset * self.resolution;
        self.base_time = start + (self.offset - self.offset % nb) * self.resolution;

        debug_assert!(self.popped_time > now);
        debug_assert!(self.base_time <= self.popped_time);
    }

    /// Cycle delta from `base_time` to the start of the first non-empty
    /// bin, scanning levels in wall-time order. `None` when the wheel is
    /// empty. A result of zero means something is already due.
    pub fn cycles_till_next_entry(&self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }

        let nb = self.num_bins as u64;
        let mut best: Option<u64> = None;

        // Level 0: logical bins from the cursor to the end of the window.
        let window_base = self.offset - self.offset % nb;
        for logical in self.offset..window_base + nb {
            let bin = (logical % nb) as usize;
            if !self.bins[bin].is_empty() {
                // The current bin holds entries that are already due.
                let delta = if logical == self.offset {
                    0
                } else {
                    (logical - window_base - 1) * self.resolution
                };
                best = Some(delta);
                break;
            }
        }

        // Upper levels: bin X drains when the level cursor passes it, i.e.
        // at level-0 offset (X+1)·nb^level.
        let mut width = 1u64;
        for level in 1..self.num_levels {
            width *= nb;
            let cursor = self.offset / width;
            for logical in cursor..cursor + nb {
                let bin = (logical % nb) as usize;
                if !self.bins[level * self.num_bins + bin].is_empty() {
                    let drain_offset = (logical + 1) * width;
                    let window_start = self.offset - self.offset % nb;
                    let delta = drain_offset.saturating_sub(window_start) * self.resolution;
                    best = Some(match best {
                        Some(b) => b.min(delta),
                        None => delta,
                    });
                    break;
                }
            }
        }

        best
    }

    /// Files `entry` into the level/bin its deadline maps to, without
    /// touching `len` or the insert counter (shared by insert and cascade).
    fn place(&mut self, entry: &mut T) -> Result<(), InsertError> {
        let tp = entry.time_point().as_cycles();
        let nb = self.num_bins as u64;

        // Already due: current bin, pops on the next pop.
        if tp <= self.popped_time {
            let bin = (self.offset % nb) as usize;
            self.bins[bin].push_back(entry);
            return Ok(());
        }

        // Level-0 bins from the window start.
        let mut idx = div_ceil_u64(tp - self.base_time, self.resolution);

        if idx < nb {
            // Anchored to the window start, which is a multiple of num_bins
            // bins, so the bin index is just idx modulo the ring.
            let bin = (idx % nb) as usize;
            self.bins[bin].push_back(entry);
            return Ok(());
        }

        let mut width = 1u64;
        for level in 1..self.num_levels {
            width *= nb;
            idx = idx / nb - 1;
            if idx < nb {
                let cursor = self.offset / width;
                let bin = ((cursor + idx) % nb) as usize;
                self.bins[level * self.num_bins + bin].push_back(entry);
                return Ok(());
            }
        }

        Err(InsertError::TooFarAhead {
            time_point: tp,
            base_time: self.base_time,
            popped_time: self.popped_time,
            offset: self.offset,
            resolution_cycles: self.resolution,
        })
    }

    /// Drains the level's just-passed bin back through `place`, recursing
    /// upward when this level's own cursor wrapped.
    fn cascade(&mut self, level: usize) {
        if level >= self.num_levels {
            return;
        }

        let nb = self.num_bins as u64;
        let mut width = 1u64;
        for _ in 0..level {
            width *= nb;
        }
        let cursor = self.offset / width;
        debug_assert!(cursor >= 1, "cascade before the level cursor moved");
        let bin = level * self.num_bins + ((cursor - 1) % nb) as usize;

        self.stats.cascades[level] += 1;

        while let Some(mut entry) = self.bins[bin].pop_front() {
            // SAFETY: linked entries are alive by the caller contract; the
            // entry was just unlinked so place() can relink it.
            let entry = unsafe { entry.as_mut() };
            let placed = self.place(entry);
            debug_assert!(
                placed.is_ok(),
                "cascaded entry fell outside the span: {:?}",
                placed
            );
        }

        debug_assert!(self.bins[bin].is_empty());

        if cursor % nb == 0 {
            self.cascade(level + 1);
        }
    }
}

#[inline]
fn div_ceil_u64(x: u64, d: u64) -> u64 {
    debug_assert!(d != 0);
    let q = x / d;
    let r = x % d;
    q + (r != 0) as u64
}

#[cfg(test)]
impl<T: TimerEntry> TimerWheel<T> {
    /// Walks every bin and cross-checks counts. Test builds only.
    pub(crate) fn debug_validate(&self) {
        let mut counted = 0usize;
        for list in self.bins.iter() {
            #[cfg(debug_assertions)]
            list.check_invariants();
            counted += list.len() as usize;
        }
        assert_eq!(counted, self.len, "len must match entries across bins");

        assert!(self.base_time <= self.popped_time);
        assert!(
            self.popped_time - self.base_time <= self.num_bins as u64 * self.resolution,
            "popped_time ran past the level-0 window"
        );
    }
}

// ============================================================================
// Unit Tests
// ============================================================================


// Property-based tests live in the sibling module wheel_tests.rs.
#[cfg(all(test, feature = "stdx-proptest"))]
#[path = "wheel_tests.rs"]
mod wheel_tests;
