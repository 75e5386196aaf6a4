//! Fiber-local storage: a fixed per-fiber slab accessed by static offsets.
//!
//! Every fiber owns one [`FlsArea`] of [`crate::FLS_AREA_SIZE`] bytes. User
//! code registers typed slots at program startup; each registration bumps a
//! cursor in a prototype area and records the slot's initial value there.
//! When a fiber is born (or recycled) its area is `reset` to the prototype
//! with one bulk copy; on every context switch the reactor repoints a
//! thread-local at the incoming fiber's area. Slot access is then a pointer
//! plus a constant offset — no per-slot indirection, no hashing.
//!
//! # Invariants
//!
//! - All slots are registered before the first context switch; registering
//!   later asserts. Offsets are monotone, aligned for the slot type, and the
//!   cumulative size never exceeds the area.
//! - Slot types are `Copy`: `reset` duplicates raw bytes, so destructors
//!   could never run and interior pointers would be duplicated silently.
//! - The active-area pointer refers to the currently executing fiber's area,
//!   or nothing when no fiber is running.
//!
//! All state is thread-local; a multi-reactor port shards it per reactor
//! thread for free.

use crate::fiber::{FiberHandle, Reactor};
use crate::FLS_AREA_SIZE;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// One fiber's local-storage block.
///
/// Alignment is fixed at 16 so any slot type up to pointer alignment lands
/// aligned once its offset is rounded.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FlsArea {
    data: [u8; FLS_AREA_SIZE],
}

thread_local! {
    /// Prototype holding every registered slot's initial value.
    static PROTOTYPE: RefCell<FlsArea> = const {
        RefCell::new(FlsArea { data: [0u8; FLS_AREA_SIZE] })
    };
    /// Bump cursor for slot registration.
    static CURSOR: Cell<usize> = const { Cell::new(0) };
    /// Set on the first context switch; registration afterwards asserts.
    static SEALED: Cell<bool> = const { Cell::new(false) };
    /// Area of the fiber currently executing, if any.
    static CURRENT: Cell<Option<NonNull<FlsArea>>> = const { Cell::new(None) };
}

/// A registered fiber-local slot of type `T`.
///
/// Slots are cheap value handles (an offset); copy them freely. The offset
/// is identical in every fiber's area, which is what makes cross-fiber
/// access (`get_in_fiber`/`set_in_fiber`) a pointer recomputation.
pub struct FlsSlot<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FlsSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FlsSlot<T> {}

impl Default for FlsArea {
    fn default() -> Self {
        Self::new()
    }
}

impl FlsArea {
    /// A fresh area initialized from the prototype.
    pub fn new() -> Self {
        PROTOTYPE.with(|proto| *proto.borrow())
    }

    /// Overwrites the whole area with the prototype. Called when a fiber is
    /// born or its slot is recycled.
    pub fn reset(&mut self) {
        PROTOTYPE.with(|proto| *self = *proto.borrow());
    }

    /// Registers a slot of type `T` with the given initial value and returns
    /// its handle. Must be called exactly once per slot declaration, before
    /// any fiber runs.
    ///
    /// # Panics
    /// - If called after the first context switch.
    /// - If `T` is over-aligned (`align_of::<T>() > align_of::<usize>()`).
    /// - If the area budget is exhausted.
    pub fn alloc_slot<T: Copy + 'static>(init: T) -> FlsSlot<T> {
        SEALED.with(|sealed| {
            assert!(
                !sealed.get(),
                "fls slot registered after fibers started running"
            );
        });
        assert!(
            core::mem::align_of::<T>() <= core::mem::align_of::<usize>(),
            "fls slot type over-aligned"
        );

        let align = core::mem::align_of::<T>();
        let size = core::mem::size_of::<T>();

        let offset = CURSOR.with(|cursor| {
            let offset = (cursor.get() + align - 1) & !(align - 1);
            assert!(
                offset + size <= FLS_AREA_SIZE,
                "fls area overflow: {} + {} exceeds {} bytes",
                offset,
                size,
                FLS_AREA_SIZE
            );
            cursor.set(offset + size);
            offset
        });

        PROTOTYPE.with(|proto| {
            let mut proto = proto.borrow_mut();
            // SAFETY: offset is aligned for T and offset + size is in bounds.
            unsafe {
                (proto.data.as_mut_ptr().add(offset) as *mut T).write(init);
            }
        });

        FlsSlot {
            offset,
            _marker: PhantomData,
        }
    }

    /// Makes `area` the active FLS block. Called by the reactor when it
    /// switches to a fiber. Seals slot registration.
    #[inline]
    pub fn switch_to(area: NonNull<FlsArea>) {
        SEALED.with(|sealed| sealed.set(true));
        CURRENT.with(|current| current.set(Some(area)));
    }

    /// Clears the active FLS block ("no fiber running").
    #[inline]
    pub fn switch_to_none() {
        CURRENT.with(|current| current.set(None));
    }

    /// The active FLS block, if a fiber is running.
    #[inline]
    pub fn active() -> Option<NonNull<FlsArea>> {
        CURRENT.with(|current| current.get())
    }

    #[inline]
    fn slot_ptr<T>(&self, offset: usize) -> *const T {
        debug_assert!(offset + core::mem::size_of::<T>() <= FLS_AREA_SIZE);
        // SAFETY: registration bounded and aligned the offset.
        unsafe { self.data.as_ptr().add(offset) as *const T }
    }
}

impl<T: Copy + 'static> FlsSlot<T> {
    /// Reads this slot in the active fiber's area.
    ///
    /// # Panics
    /// If no fiber is running.
    #[inline]
    pub fn get(self) -> T {
        let area = FlsArea::active().expect("fls access with no active fiber");
        // SAFETY: the reactor keeps the active area alive while it is
        // current; reads are raw so no reference aliasing arises.
        unsafe { self.get_in(area.as_ref()) }
    }

    /// Writes this slot in the active fiber's area.
    ///
    /// # Panics
    /// If no fiber is running.
    #[inline]
    pub fn set(self, value: T) {
        let area = FlsArea::active().expect("fls access with no active fiber");
        // SAFETY: as in `get`; the write targets this fiber's own area.
        unsafe { (area.as_ptr() as *mut u8).add(self.offset).cast::<T>().write(value) };
    }

    /// Reads this slot in an explicit area.
    #[inline]
    pub fn get_in(self, area: &FlsArea) -> T {
        // SAFETY: every area shares the prototype layout, so the offset is
        // in bounds and aligned in `area` too.
        unsafe { area.slot_ptr::<T>(self.offset).read() }
    }

    /// Writes this slot in an explicit area.
    #[inline]
    pub fn set_in(self, area: &mut FlsArea, value: T) {
        // SAFETY: as in `get_in`.
        unsafe {
            (area.data.as_mut_ptr().add(self.offset) as *mut T).write(value);
        }
    }
}

/// Reads `slot` in another fiber's area. `None` if the handle no longer
/// refers to a live fiber.
pub fn get_in_fiber<T: Copy + 'static>(
    reactor: &dyn Reactor,
    fiber: FiberHandle,
    slot: FlsSlot<T>,
) -> Option<T> {
    let area = reactor.fiber_fls(fiber)?;
    // SAFETY: the host keeps a live fiber's area alive; single-threaded, so
    // the fiber is not concurrently mutating it.
    Some(slot.get_in(unsafe { area.as_ref() }))
}

/// Writes `slot` in another fiber's area. Returns false if the handle no
/// longer refers to a live fiber.
pub fn set_in_fiber<T: Copy + 'static>(
    reactor: &dyn Reactor,
    fiber: FiberHandle,
    slot: FlsSlot<T>,
    value: T,
) -> bool {
    match reactor.fiber_fls(fiber) {
        Some(mut area) => {
            // SAFETY: as in `get_in_fiber`, plus exclusive access because
            // only one fiber executes at a time.
            slot.set_in(unsafe { area.as_mut() }, value);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each #[test] runs on its own thread, so every test sees fresh
    // thread-local registration state.

    #[test]
    fn slot_roundtrip_and_reset() {
        let slot = FlsArea::alloc_slot::<u64>(7);
        let mut area = FlsArea::new();

        assert_eq!(slot.get_in(&area), 7);

        slot.set_in(&mut area, 41);
        assert_eq!(slot.get_in(&area), 41);

        area.reset();
        assert_eq!(slot.get_in(&area), 7);
    }

    #[test]
    fn offsets_align_and_pack() {
        let a = FlsArea::alloc_slot::<u8>(1);
        let b = FlsArea::alloc_slot::<u64>(2);
        let c = FlsArea::alloc_slot::<u8>(3);
        let d = FlsArea::alloc_slot::<u32>(4);

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 8);
        assert_eq!(c.offset, 16);
        assert_eq!(d.offset, 20);

        let area = FlsArea::new();
        assert_eq!(a.get_in(&area), 1);
        assert_eq!(b.get_in(&area), 2);
        assert_eq!(c.get_in(&area), 3);
        assert_eq!(d.get_in(&area), 4);
    }

    #[test]
    fn active_area_get_set() {
        let slot = FlsArea::alloc_slot::<u32>(11);
        let mut area = FlsArea::new();

        FlsArea::switch_to(NonNull::from(&mut area));
        assert_eq!(slot.get(), 11);
        slot.set(12);
        assert_eq!(slot.get(), 12);

        FlsArea::switch_to_none();
        assert!(FlsArea::active().is_none());

        // The raw area still holds the written value.
        assert_eq!(slot.get_in(&area), 12);
    }

    #[test]
    fn areas_are_independent() {
        let slot = FlsArea::alloc_slot::<u32>(0);
        let mut a = FlsArea::new();
        let mut b = FlsArea::new();

        slot.set_in(&mut a, 1);
        slot.set_in(&mut b, 2);

        assert_eq!(slot.get_in(&a), 1);
        assert_eq!(slot.get_in(&b), 2);
    }

    #[test]
    fn late_registration_still_seen_by_new_areas() {
        let first = FlsArea::alloc_slot::<u32>(5);
        let early = FlsArea::new();
        let second = FlsArea::alloc_slot::<u32>(6);
        let late = FlsArea::new();

        assert_eq!(first.get_in(&early), 5);
        assert_eq!(first.get_in(&late), 5);
        assert_eq!(second.get_in(&late), 6);

        // An area from before the second registration is refreshed by reset.
        let mut early = early;
        early.reset();
        assert_eq!(second.get_in(&early), 6);
    }

    #[test]
    #[should_panic(expected = "fls area overflow")]
    fn overflow_panics() {
        let _a = FlsArea::alloc_slot::<[u8; 400]>([0; 400]);
        let _b = FlsArea::alloc_slot::<[u8; 200]>([0; 200]);
    }

    #[test]
    #[should_panic(expected = "registered after fibers started running")]
    fn registration_after_switch_panics() {
        let mut area = FlsArea::new();
        FlsArea::switch_to(NonNull::from(&mut area));
        let _late = FlsArea::alloc_slot::<u32>(0);
    }

    #[test]
    #[should_panic(expected = "no active fiber")]
    fn get_without_fiber_panics() {
        let slot = FlsArea::alloc_slot::<u32>(0);
        let _ = slot.get();
    }
}
