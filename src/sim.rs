//! Deterministic single-threaded fiber host for exercising the runtime core.
//!
//! [`SimReactor`] is a minimal cooperative scheduler implementing the
//! [`Reactor`] contract: stackful fibers on one OS thread (ucontext), a FIFO
//! run queue, and idle-callback dispatch. It exists so the end-to-end
//! behavior of the core — fibers really suspending inside `Fd::read`, FLS
//! pointers really swapping on context switch, stale handles really being
//! detected — can be driven deterministically from tests without a
//! production scheduler. It is also the reference implementation of the
//! contract for hosts.
//!
//! # Model
//!
//! - `run()` owns the scheduler context. It pops runnable fibers FIFO and
//!   swaps into them; a fiber runs until it suspends or returns.
//! - On every switch the scheduler repoints the active FLS area to the
//!   incoming fiber's block and clears it when control returns.
//! - When nothing is runnable but fibers are still alive, the registered
//!   idle callbacks run with an unbounded budget (`Duration::MAX`); with
//!   the fd bridge attached this is where `epoll_wait` blocks.
//! - A fiber that returns is retired: its generation bumps (invalidating
//!   all handles) and its slot is kept so stale handles stay checkable.
//!
//! # Invariants
//!
//! - Exactly one of {scheduler, some fiber} executes at any instant.
//! - The reactor must not move while `run()` is in progress (fiber contexts
//!   link back to the scheduler context); keep it behind `Rc`.
//! - A fiber panic aborts the run: the payload is re-raised from `run()`
//!   after control returns to the scheduler.

use crate::fiber::{FiberCell, FiberHandle, Reactor};
use crate::fls::FlsArea;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::time::Duration;

const FIBER_STACK_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FiberState {
    Runnable,
    Running,
    Suspended,
    Dead,
}

struct Fiber {
    ctx: libc::ucontext_t,
    stack: Box<[u8]>,
    state: FiberState,
    /// Set when the fiber is resumed while still running; the next suspend
    /// then requeues instead of parking, so the wakeup is not lost.
    requeued: bool,
    entry: Option<Box<dyn FnOnce()>>,
    panic: Option<Box<dyn Any + Send>>,
    cell: Box<FiberCell>,
    fls: Box<FlsArea>,
}

struct Inner {
    fibers: Vec<Box<Fiber>>,
    run_queue: VecDeque<usize>,
    current: Option<usize>,
    /// Scheduler context; boxed so fiber `uc_link`s stay valid.
    main_ctx: Box<libc::ucontext_t>,
    idle_callbacks: Vec<Box<dyn FnMut(Duration)>>,
    live: usize,
    running: bool,
    open: bool,
}

/// Deterministic cooperative fiber scheduler on the current thread.
pub struct SimReactor {
    inner: UnsafeCell<Inner>,
}

thread_local! {
    /// Hand-off slot for the fiber about to be entered for the first time;
    /// `makecontext` cannot carry a 64-bit pointer portably.
    static ENTERING: Cell<*mut Fiber> = const { Cell::new(std::ptr::null_mut()) };
}

extern "C" fn fiber_trampoline() {
    // SAFETY: the scheduler stores the fiber pointer immediately before the
    // first swap into this context; nothing runs in between.
    let fiber = unsafe { &mut *ENTERING.with(|slot| slot.get()) };

    let entry = fiber.entry.take().expect("fiber entered twice");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
        fiber.panic = Some(payload);
    }

    fiber.state = FiberState::Dead;
    fiber.cell.retire();
    // Falling off the trampoline resumes `uc_link` — the scheduler.
}

impl Default for SimReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimReactor {
    pub fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                fibers: Vec::new(),
                run_queue: VecDeque::new(),
                current: None,
                // SAFETY: ucontext_t is all plain data; getcontext fills it
                // before any use.
                main_ctx: Box::new(unsafe { std::mem::zeroed() }),
                idle_callbacks: Vec::new(),
                live: 0,
                running: false,
                open: true,
            }),
        }
    }

    /// Exclusive access to the scheduler state.
    ///
    /// # Safety
    /// Single-threaded by construction; callers must not let the returned
    /// borrow live across a context switch (parked stack frames hold only
    /// raw pointers).
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut Inner {
        &mut *self.inner.get()
    }

    /// Creates a fiber that will run `entry` and queues it.
    pub fn spawn<F>(&self, entry: F) -> FiberHandle
    where
        F: FnOnce() + 'static,
    {
        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        assert!(inner.open, "spawn on a closed reactor");

        let mut fiber = Box::new(Fiber {
            // SAFETY: plain data, filled by getcontext below.
            ctx: unsafe { std::mem::zeroed() },
            stack: vec![0u8; FIBER_STACK_SIZE].into_boxed_slice(),
            state: FiberState::Runnable,
            requeued: false,
            entry: Some(Box::new(entry)),
            panic: None,
            cell: Box::new(FiberCell::new()),
            fls: Box::new(FlsArea::new()),
        });

        // SAFETY: ctx/stack are owned and stable (boxed); uc_link points at
        // the boxed scheduler context.
        unsafe {
            let rc = libc::getcontext(&mut fiber.ctx);
            assert!(rc == 0, "getcontext failed");
            fiber.ctx.uc_stack.ss_sp = fiber.stack.as_mut_ptr() as *mut libc::c_void;
            fiber.ctx.uc_stack.ss_size = fiber.stack.len();
            fiber.ctx.uc_link = &mut *inner.main_ctx;
            libc::makecontext(&mut fiber.ctx, fiber_trampoline, 0);
        }

        let handle = fiber.cell.handle();
        inner.fibers.push(fiber);
        let index = inner.fibers.len() - 1;
        inner.run_queue.push_back(index);
        inner.live += 1;
        handle
    }

    /// Runs until every fiber has finished.
    ///
    /// # Panics
    /// Re-raises the first fiber panic, and panics on deadlock (fibers
    /// blocked with no idle callback to produce wakeups).
    pub fn run(&self) {
        {
            // SAFETY: no context switch inside this scope.
            let inner = unsafe { self.inner() };
            assert!(!inner.running, "run() is not reentrant");
            inner.running = true;
        }

        loop {
            let next = {
                // SAFETY: no context switch inside this scope.
                let inner = unsafe { self.inner() };
                inner.run_queue.pop_front()
            };

            if let Some(index) = next {
                self.dispatch(index);
                continue;
            }

            // SAFETY: no context switch inside this scope.
            let live = unsafe { self.inner() }.live;
            if live == 0 {
                break;
            }

            // Blocked fibers, empty queue: let the idle callbacks produce
            // wakeups (e.g. epoll_wait in the fd bridge).
            let mut callbacks = {
                // SAFETY: no context switch inside this scope.
                let inner = unsafe { self.inner() };
                assert!(
                    !inner.idle_callbacks.is_empty(),
                    "deadlock: {live} fibers blocked and no idle callback"
                );
                std::mem::take(&mut inner.idle_callbacks)
            };
            for callback in &mut callbacks {
                callback(Duration::MAX);
            }
            // SAFETY: no context switch inside this scope. Callbacks
            // registered during dispatch land at the back.
            let inner = unsafe { self.inner() };
            callbacks.extend(std::mem::take(&mut inner.idle_callbacks));
            inner.idle_callbacks = callbacks;
        }

        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        inner.running = false;
    }

    /// Swaps into fiber `index` until it suspends or finishes.
    fn dispatch(&self, index: usize) {
        let (fiber_ptr, main_ptr, fls_ptr) = {
            // SAFETY: no context switch inside this scope.
            let inner = unsafe { self.inner() };
            let fiber = &mut inner.fibers[index];
            match fiber.state {
                FiberState::Runnable => {}
                // Dead entries can linger in the queue; skip them.
                FiberState::Dead => return,
                state => panic!("dispatching fiber in state {state:?}"),
            }
            fiber.state = FiberState::Running;
            inner.current = Some(index);

            // All fiber pointers derive from one raw base so the fiber's
            // own accesses (via ENTERING) share its provenance.
            let fiber_raw: *mut Fiber = &mut **fiber;
            ENTERING.with(|slot| slot.set(fiber_raw));

            // SAFETY: fiber_raw points at a boxed, stable Fiber.
            let ctx_ptr = unsafe { std::ptr::addr_of_mut!((*fiber_raw).ctx) };
            let fls_ptr = unsafe { NonNull::from(&mut *(*fiber_raw).fls) };

            (
                ctx_ptr,
                &mut *inner.main_ctx as *mut libc::ucontext_t,
                fls_ptr,
            )
        };

        FlsArea::switch_to(fls_ptr);
        // SAFETY: both contexts are initialized and stable; the fiber
        // returns control here by suspending or finishing.
        let rc = unsafe { libc::swapcontext(main_ptr, fiber_ptr) };
        assert!(rc == 0, "swapcontext failed");
        FlsArea::switch_to_none();

        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        inner.current = None;
        let fiber = &mut inner.fibers[index];
        match fiber.state {
            FiberState::Dead => {
                inner.live -= 1;
                if let Some(payload) = fiber.panic.take() {
                    inner.running = false;
                    panic::resume_unwind(payload);
                }
            }
            FiberState::Suspended | FiberState::Runnable => {}
            FiberState::Running => unreachable!("fiber yielded without changing state"),
        }
    }

    /// Reschedules the calling fiber behind everything currently runnable.
    pub fn yield_now(&self) {
        let me = self.current_fiber_handle();
        self.resume_fiber(me);
        self.suspend_current_fiber();
    }

    fn index_of(&self, handle: FiberHandle) -> Option<usize> {
        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        inner
            .fibers
            .iter()
            .position(|fiber| fiber.cell.handle() == handle)
    }
}

impl Reactor for SimReactor {
    fn is_open(&self) -> bool {
        // SAFETY: no context switch inside this scope.
        unsafe { self.inner() }.open
    }

    fn current_fiber_handle(&self) -> FiberHandle {
        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        let index = inner.current.expect("no fiber is running");
        inner.fibers[index].cell.handle()
    }

    fn suspend_current_fiber(&self) {
        let (fiber_ptr, main_ptr) = {
            // SAFETY: no context switch inside this scope.
            let inner = unsafe { self.inner() };
            let index = inner.current.expect("suspend outside fiber context");
            let fiber = &mut inner.fibers[index];
            debug_assert_eq!(fiber.state, FiberState::Running);
            if fiber.requeued {
                // A resume arrived while we were still running; stay
                // schedulable instead of parking so the wakeup is not lost.
                fiber.requeued = false;
                fiber.state = FiberState::Runnable;
                inner.run_queue.push_back(index);
            } else {
                fiber.state = FiberState::Suspended;
            }
            (
                &mut fiber.ctx as *mut libc::ucontext_t,
                &mut *inner.main_ctx as *mut libc::ucontext_t,
            )
        };

        // SAFETY: stable contexts; returns when the scheduler dispatches
        // this fiber again.
        let rc = unsafe { libc::swapcontext(fiber_ptr, main_ptr) };
        assert!(rc == 0, "swapcontext failed");
    }

    fn resume_fiber(&self, fiber: FiberHandle) {
        if !fiber.is_valid() {
            return;
        }
        let Some(index) = self.index_of(fiber) else {
            return;
        };

        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        let target = &mut inner.fibers[index];
        match target.state {
            FiberState::Suspended => {
                target.state = FiberState::Runnable;
                inner.run_queue.push_back(index);
            }
            FiberState::Running => target.requeued = true,
            // Runnable: already scheduled; the wakeup is spurious.
            FiberState::Runnable | FiberState::Dead => {}
        }
    }

    fn register_idle_callback(&self, callback: Box<dyn FnMut(Duration)>) {
        // SAFETY: no context switch inside this scope.
        unsafe { self.inner() }.idle_callbacks.push(callback);
    }

    fn fiber_fls(&self, fiber: FiberHandle) -> Option<NonNull<FlsArea>> {
        if !fiber.is_valid() {
            return None;
        }
        let index = self.index_of(fiber)?;
        // SAFETY: no context switch inside this scope.
        let inner = unsafe { self.inner() };
        Some(NonNull::from(&mut *inner.fibers[index].fls))
    }
}

/// One-shot wakeup flag for fiber tests: a fiber parks in [`wait`] until
/// somebody calls [`signal`].
///
/// [`wait`]: SimEvent::wait
/// [`signal`]: SimEvent::signal
#[derive(Default)]
pub struct SimEvent {
    signaled: Cell<bool>,
    waiter: Cell<FiberHandle>,
}

impl SimEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the calling fiber until the event is signaled, then consumes
    /// the signal.
    pub fn wait(&self, reactor: &SimReactor) {
        while !self.signaled.get() {
            assert!(
                !self.waiter.get().is_valid(),
                "two fibers waiting on one event"
            );
            self.waiter.set(reactor.current_fiber_handle());
            reactor.suspend_current_fiber();
            self.waiter.set(FiberHandle::invalid());
        }
        self.signaled.set(false);
    }

    /// Signals the event and wakes the parked fiber, if any.
    pub fn signal(&self, reactor: &SimReactor) {
        self.signaled.set(true);
        let waiter = self.waiter.get();
        if waiter.is_valid() {
            reactor.resume_fiber(waiter);
        }
    }
}
