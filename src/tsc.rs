//! Monotonic time expressed in CPU cycles.
//!
//! The reactor's hot paths (timer wheel, sleep accounting) compare raw cycle
//! counts; conversions to and from `Duration` happen only at the edges (idle
//! timeout computation, user-facing deadlines). On x86_64 a time point is a
//! raw TSC read; other architectures fall back to a process-epoch `Instant`
//! expressed in nanosecond "cycles".
//!
//! The cycles-per-second rate is calibrated once against `Instant` on first
//! use and cached. Calibration error is irrelevant to wheel correctness
//! (pure cycle arithmetic); it only skews Duration conversions by the
//! measurement error of a ~10 ms window.

use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A monotonic point in time, measured in CPU cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TscTimePoint {
    cycles: u64,
}

impl TscTimePoint {
    /// Reads the current cycle counter.
    #[inline]
    pub fn now() -> Self {
        Self {
            cycles: read_cycle_counter(),
        }
    }

    /// A time point from a raw cycle count.
    #[inline]
    pub const fn from_cycles(cycles: u64) -> Self {
        Self { cycles }
    }

    /// The raw cycle count.
    #[inline]
    pub const fn as_cycles(self) -> u64 {
        self.cycles
    }

    /// Cycles elapsed since `earlier`; zero if `earlier` is in the future.
    #[inline]
    pub fn cycles_since(self, earlier: TscTimePoint) -> u64 {
        self.cycles.saturating_sub(earlier.cycles)
    }

    /// Converts a duration to cycles at the calibrated rate.
    pub fn cycles_for(duration: Duration) -> u64 {
        let rate = cycles_per_sec() as u128;
        let nanos = duration.as_nanos();
        (nanos.saturating_mul(rate) / 1_000_000_000).min(u64::MAX as u128) as u64
    }

    /// Converts a cycle count to a duration at the calibrated rate.
    pub fn duration_for(cycles: u64) -> Duration {
        let rate = cycles_per_sec() as u128;
        let nanos = (cycles as u128).saturating_mul(1_000_000_000) / rate;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl Add<u64> for TscTimePoint {
    type Output = TscTimePoint;

    #[inline]
    fn add(self, cycles: u64) -> TscTimePoint {
        TscTimePoint {
            cycles: self.cycles.saturating_add(cycles),
        }
    }
}

impl AddAssign<u64> for TscTimePoint {
    #[inline]
    fn add_assign(&mut self, cycles: u64) {
        self.cycles = self.cycles.saturating_add(cycles);
    }
}

impl Sub<u64> for TscTimePoint {
    type Output = TscTimePoint;

    #[inline]
    fn sub(self, cycles: u64) -> TscTimePoint {
        TscTimePoint {
            cycles: self.cycles.saturating_sub(cycles),
        }
    }
}

impl Sub<TscTimePoint> for TscTimePoint {
    type Output = u64;

    #[inline]
    fn sub(self, earlier: TscTimePoint) -> u64 {
        self.cycles_since(earlier)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn read_cycle_counter() -> u64 {
    // Plain rdtsc, not rdtscp: ordering against surrounding loads does not
    // matter for scheduling-granularity timestamps.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn read_cycle_counter() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_nanos() as u64
}

#[cfg(target_arch = "x86_64")]
fn cycles_per_sec() -> u64 {
    static RATE: OnceLock<u64> = OnceLock::new();
    *RATE.get_or_init(|| {
        let wall_start = Instant::now();
        let tsc_start = read_cycle_counter();
        std::thread::sleep(Duration::from_millis(10));
        let tsc_end = read_cycle_counter();
        let nanos = wall_start.elapsed().as_nanos().max(1);
        let cycles = tsc_end.saturating_sub(tsc_start).max(1);
        ((cycles as u128 * 1_000_000_000) / nanos).max(1) as u64
    })
}

#[cfg(not(target_arch = "x86_64"))]
fn cycles_per_sec() -> u64 {
    // Fallback cycles are nanoseconds.
    1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotone() {
        let a = TscTimePoint::now();
        let b = TscTimePoint::now();
        assert!(b >= a);
    }

    #[test]
    fn cycle_arithmetic() {
        let t = TscTimePoint::from_cycles(1000);
        assert_eq!((t + 500).as_cycles(), 1500);
        assert_eq!((t - 400).as_cycles(), 600);
        assert_eq!((t + 500) - t, 500);
        assert_eq!(t - (t + 500), 0);
        assert_eq!(t.cycles_since(TscTimePoint::from_cycles(100)), 900);
    }

    #[test]
    fn duration_roundtrip_is_close() {
        let d = Duration::from_millis(5);
        let cycles = TscTimePoint::cycles_for(d);
        assert!(cycles > 0);
        let back = TscTimePoint::duration_for(cycles);
        let err = if back > d { back - d } else { d - back };
        assert!(err < Duration::from_millis(1), "roundtrip error {err:?}");
    }

    #[test]
    fn now_tracks_wall_time_roughly() {
        let t0 = TscTimePoint::now();
        std::thread::sleep(Duration::from_millis(2));
        let elapsed = TscTimePoint::now() - t0;
        assert!(TscTimePoint::duration_for(elapsed) >= Duration::from_millis(1));
    }
}
