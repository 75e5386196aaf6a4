//! Timer wheel soak with the reference host geometry: 256 bins × 3 levels.
//!
//! Entries come from a fixed pool and go back on expiry, so the run also
//! checks that nothing leaks across cascades: total popped equals total
//! inserted and the pool ends idle.

use fiber_rs::stdx::list::{ListLink, ListNode};
use fiber_rs::stdx::FixedPool;
use fiber_rs::wheel::WheelTag;
use fiber_rs::{TimerEntry, TimerWheel, TscTimePoint};

const NUM_BINS: usize = 256;
const NUM_LEVELS: usize = 3;
const RESOLUTION: u64 = 50;
const POOL_CAP: usize = 4096;

#[derive(Default)]
struct SoakTimer {
    deadline: TscTimePoint,
    link: ListLink<SoakTimer, WheelTag>,
}

impl ListNode<WheelTag> for SoakTimer {
    fn list_link(&mut self) -> &mut ListLink<Self, WheelTag> {
        &mut self.link
    }
    fn list_link_ref(&self) -> &ListLink<Self, WheelTag> {
        &self.link
    }
}

impl TimerEntry for SoakTimer {
    fn time_point(&self) -> TscTimePoint {
        self.deadline
    }
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

#[test]
fn random_insert_pop_over_twice_the_span() {
    let mut wheel: TimerWheel<SoakTimer> =
        TimerWheel::new(NUM_BINS, NUM_LEVELS, RESOLUTION, TscTimePoint::from_cycles(0));
    let mut pool: FixedPool<SoakTimer> = FixedPool::new(POOL_CAP);
    let mut rng = XorShift64::new(0x5eed);

    let span_cycles = wheel.span_in_bins() * RESOLUTION;
    let horizon = 2 * span_cycles;

    let mut inserted = 0u64;
    let mut popped = 0u64;

    // Seed the wheel, then alternate pops (advancing `now` in coarse steps
    // across 2x the span) with fresh inserts into the remaining window.
    const STEPS: u64 = 256;
    let mut now = 0u64;
    for step in 0..=STEPS {
        now = horizon * step / STEPS;

        while let Some(entry) = wheel.pop(TscTimePoint::from_cycles(now)) {
            let due = unsafe { entry.as_ref().deadline.as_cycles() };
            assert!(due <= now, "expired early: due={due} now={now}");
            pool.release(entry);
            popped += 1;
        }

        // Stop inserting once deadlines would run past the sweep.
        if now + span_cycles / 2 < horizon {
            for _ in 0..24 {
                let Some(mut slot) = pool.alloc() else { break };
                let base = wheel.base_time().as_cycles();
                let lead = rng.next() % (span_cycles / 2);
                // SAFETY: pool slots are stable; the entry is initialized
                // before the wheel links it.
                let timer = unsafe { slot.as_mut() };
                timer.deadline = TscTimePoint::from_cycles(base + lead.max(1));
                match wheel.insert(timer) {
                    Ok(()) => inserted += 1,
                    Err(err) => panic!("in-window insert rejected: {err}"),
                }
            }
        }
    }

    // Everything must have expired by the end of the sweep.
    assert!(wheel.pop(TscTimePoint::from_cycles(now)).is_none());
    assert!(wheel.is_empty());
    assert!(inserted > 1000, "soak did not exercise the wheel: {inserted}");
    assert_eq!(popped, inserted);
    assert_eq!(pool.in_use(), 0);

    let stats = wheel.stats();
    assert_eq!(stats.inserted, inserted);
    assert_eq!(stats.popped, popped);
    for level in 1..NUM_LEVELS {
        assert!(
            stats.cascades[level] > 0,
            "level {level} never cascaded: {stats:?}"
        );
    }
}

#[test]
fn span_boundary_with_production_geometry() {
    let mut wheel: TimerWheel<SoakTimer> =
        TimerWheel::new(NUM_BINS, NUM_LEVELS, RESOLUTION, TscTimePoint::from_cycles(0));

    let span = wheel.span_in_bins();
    assert_eq!(span, 256 + 256 * 256 + 256 * 256 * 256);

    let mut beyond = SoakTimer {
        deadline: TscTimePoint::from_cycles(RESOLUTION * span),
        ..Default::default()
    };
    assert!(wheel.insert(&mut beyond).is_err());

    let mut edge = SoakTimer {
        deadline: TscTimePoint::from_cycles(RESOLUTION * (span - 1)),
        ..Default::default()
    };
    wheel.insert(&mut edge).unwrap();
    wheel.remove(&mut edge);
    assert!(wheel.is_empty());
}
