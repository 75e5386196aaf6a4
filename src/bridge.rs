//! Epoll-backed bridge between non-blocking file descriptors and fibers.
//!
//! One bridge exists per reactor thread. It owns the epoll instance and a
//! fixed pool of [`FdContext`] records; each registered descriptor is added
//! to epoll once, edge-triggered for both directions, with the event's user
//! data pointing at its context. When a fiber's syscall returns `EAGAIN`,
//! the fd layer parks the fiber's handle in the context and suspends; the
//! idle callback later maps readiness events back to contexts and resumes
//! the parked fibers.
//!
//! # Registration protocol
//!
//! Descriptors are registered with `EPOLLIN | EPOLLOUT | EPOLLRDHUP |
//! EPOLLET`. Deregistration does **not** issue `EPOLL_CTL_DEL`: the caller
//! closes the fd immediately afterwards, which removes it kernel-side and
//! saves a syscall. This assumes the fd is not dup'd elsewhere.
//!
//! # Stale events
//!
//! Because deregistration skips `EPOLL_CTL_DEL`, an event already queued in
//! the kernel can surface after its context was released. Context slots stay
//! initialized after release ([`crate::stdx::FixedPool`]), so the idle
//! callback can always read the (possibly stale) record; a waiter handle
//! that fails its generation check is counted and skipped. The resulting
//! missed wakeup is harmless: a fiber only suspends after observing `EAGAIN`,
//! so the next readiness transition produces a fresh event.
//!
//! # Failure semantics
//!
//! Registration failures (fcntl, epoll_ctl, pool exhaustion) propagate to
//! the caller with partial acquisitions rolled back. `epoll_wait` in the
//! idle callback is expected never to fail; `EINTR` returns to the scheduler
//! (which calls right back), anything else panics.

use crate::fiber::{FiberHandle, Reactor};
use crate::stdx::FixedPool;
use crate::{MAX_CONCURRENT_FDS, NUM_BATCH_EVENTS};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;

// --------------------------
// Errors
// --------------------------

/// A failed syscall, with enough context for user diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsError {
    pub errno: i32,
    pub syscall: &'static str,
    pub fd: RawFd,
}

impl OsError {
    /// Captures `errno` for a syscall that just failed.
    pub(crate) fn last(syscall: &'static str, fd: RawFd) -> Self {
        Self {
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
            syscall,
            fd,
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(fd={}) failed: {}",
            self.syscall,
            self.fd,
            io::Error::from_raw_os_error(self.errno)
        )
    }
}

impl std::error::Error for OsError {}

/// Why wrapping a descriptor failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// A syscall failed.
    Os(OsError),
    /// The context pool is at `MAX_CONCURRENT_FDS`.
    ResourceExhausted,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Os(err) => err.fmt(f),
            RegisterError::ResourceExhausted => {
                write!(f, "fd context pool exhausted ({MAX_CONCURRENT_FDS} slots)")
            }
        }
    }
}

impl std::error::Error for RegisterError {}

impl From<OsError> for RegisterError {
    fn from(err: OsError) -> Self {
        RegisterError::Os(err)
    }
}

// --------------------------
// Contexts and stats
// --------------------------

/// Bridge-side record for one registered descriptor.
///
/// Holds at most one waiting fiber; a second waiter on the same context is a
/// programmer error and asserts in the fd layer.
pub struct FdContext {
    fd: Cell<RawFd>,
    waiter: Cell<FiberHandle>,
}

impl Default for FdContext {
    fn default() -> Self {
        Self {
            fd: Cell::new(-1),
            waiter: Cell::new(FiberHandle::invalid()),
        }
    }
}

impl FdContext {
    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.get()
    }

    #[inline]
    pub(crate) fn waiter(&self) -> FiberHandle {
        self.waiter.get()
    }

    #[inline]
    pub(crate) fn set_waiter(&self, handle: FiberHandle) {
        self.waiter.set(handle);
    }

    #[inline]
    pub(crate) fn clear_waiter(&self) {
        self.waiter.set(FiberHandle::invalid());
    }
}

/// Operation counters. Always recorded; snapshot by value via
/// [`stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Descriptors registered over the bridge's lifetime.
    pub registered: u64,
    /// Descriptors deregistered.
    pub deregistered: u64,
    /// Fiber suspensions taken on `EAGAIN`.
    pub suspensions: u64,
    /// Fibers resumed from readiness events.
    pub resumes: u64,
    /// Events whose context had no valid waiter.
    pub stale_events: u64,
    /// Syscalls retried immediately on `EINTR`.
    pub eintr_retries: u64,
    /// `epoll_wait` calls that returned events or timed out.
    pub polls: u64,
}

#[derive(Default)]
struct StatCells {
    registered: Cell<u64>,
    deregistered: Cell<u64>,
    suspensions: Cell<u64>,
    resumes: Cell<u64>,
    stale_events: Cell<u64>,
    eintr_retries: Cell<u64>,
    polls: Cell<u64>,
}

impl StatCells {
    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            registered: self.registered.get(),
            deregistered: self.deregistered.get(),
            suspensions: self.suspensions.get(),
            resumes: self.resumes.get(),
            stale_events: self.stale_events.get(),
            eintr_retries: self.eintr_retries.get(),
            polls: self.polls.get(),
        }
    }
}

#[inline]
fn bump(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

// --------------------------
// The bridge singleton
// --------------------------

struct Bridge {
    epoll_fd: RawFd,
    reactor: Rc<dyn Reactor>,
    /// Contexts live here; epoll user data points into the slab. Slots stay
    /// initialized after release (see module docs on stale events).
    pool: RefCell<FixedPool<FdContext>>,
    stats: StatCells,
}

thread_local! {
    static BRIDGE: RefCell<Option<Rc<Bridge>>> = const { RefCell::new(None) };
}

/// Opens the bridge for this reactor thread and registers its idle callback
/// with the reactor. Call once, after the reactor is set up and before any
/// descriptor is wrapped.
///
/// # Panics
/// If the bridge is already open on this thread.
pub fn open(reactor: Rc<dyn Reactor>) -> Result<(), OsError> {
    BRIDGE.with(|slot| {
        assert!(slot.borrow().is_none(), "fd bridge already open");

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(OsError::last("epoll_create1", -1));
        }

        let bridge = Rc::new(Bridge {
            epoll_fd,
            reactor: Rc::clone(&reactor),
            pool: RefCell::new(FixedPool::new(MAX_CONCURRENT_FDS)),
            stats: StatCells::default(),
        });

        let for_idle = Rc::clone(&bridge);
        reactor.register_idle_callback(Box::new(move |timeout| for_idle.poll_once(timeout)));

        *slot.borrow_mut() = Some(bridge);
        Ok(())
    })
}

/// Closes the bridge and its epoll instance.
///
/// Every wrapped descriptor must be closed first: live waiters cannot be
/// woken once the epoll fd is gone, so closing with contexts outstanding is
/// a programmer error. A host that wants to shut down with blocked fibers
/// resumes them itself; their retry loop then observes the closed fds.
///
/// # Panics
/// If contexts are still allocated, or the bridge is not open.
pub fn close() {
    let bridge = BRIDGE.with(|slot| {
        slot.borrow_mut()
            .take()
            .expect("closing an fd bridge that is not open")
    });
    assert!(
        bridge.pool.borrow().in_use() == 0,
        "fd bridge closed with {} live fd contexts",
        bridge.pool.borrow().in_use()
    );
    unsafe { libc::close(bridge.epoll_fd) };
}

/// True while this thread's bridge is open.
pub fn is_open() -> bool {
    BRIDGE.with(|slot| slot.borrow().is_some())
}

/// Counter snapshot.
///
/// # Panics
/// If the bridge is not open.
pub fn stats() -> BridgeStats {
    with(|bridge| bridge.stats.snapshot())
}

fn with<R>(f: impl FnOnce(&Bridge) -> R) -> R {
    BRIDGE.with(|slot| {
        let borrow = slot.borrow();
        let bridge = borrow.as_ref().expect("fd bridge not open");
        f(bridge)
    })
}

/// The reactor the bridge was opened with. Cloned out so callers never hold
/// the singleton borrow across a suspension.
pub(crate) fn reactor() -> Rc<dyn Reactor> {
    with(|bridge| Rc::clone(&bridge.reactor))
}

pub(crate) fn note_suspension() {
    with(|bridge| bump(&bridge.stats.suspensions));
}

pub(crate) fn note_eintr() {
    with(|bridge| bump(&bridge.stats.eintr_retries));
}

/// Registers `fd` with epoll and allocates its context.
pub(crate) fn register(fd: RawFd) -> Result<NonNull<FdContext>, RegisterError> {
    with(|bridge| {
        let ctx = bridge
            .pool
            .borrow_mut()
            .alloc()
            .ok_or(RegisterError::ResourceExhausted)?;

        // SAFETY: pool slots are stable and initialized.
        let ctx_ref = unsafe { ctx.as_ref() };
        ctx_ref.fd.set(fd);
        ctx_ref.clear_waiter();

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: ctx.as_ptr() as u64,
        };
        let rc = unsafe { libc::epoll_ctl(bridge.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            let err = OsError::last("epoll_ctl", fd);
            bridge.pool.borrow_mut().release(ctx);
            return Err(err.into());
        }

        bump(&bridge.stats.registered);
        Ok(ctx)
    })
}

/// Releases a context. The caller closes the fd right after, which removes
/// it from the epoll set kernel-side.
pub(crate) fn deregister(ctx: NonNull<FdContext>) {
    with(|bridge| {
        // SAFETY: pool slots are stable and initialized.
        let ctx_ref = unsafe { ctx.as_ref() };
        assert!(
            !ctx_ref.waiter().is_valid(),
            "deregistering an fd with a fiber still waiting on it"
        );
        ctx_ref.clear_waiter();
        ctx_ref.fd.set(-1);

        bridge.pool.borrow_mut().release(ctx);
        bump(&bridge.stats.deregistered);
    });
}

impl Bridge {
    /// The idle callback: waits for readiness and resumes parked fibers.
    ///
    /// `timeout` is the longest the reactor allows us to block.
    fn poll_once(&self, timeout: Duration) {
        let timeout_ms = timeout_to_millis(timeout);
        let mut events: [libc::epoll_event; NUM_BATCH_EVENTS] =
            unsafe { std::mem::zeroed() };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                NUM_BATCH_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = OsError::last("epoll_wait", self.epoll_fd);
            if err.errno == libc::EINTR {
                // The scheduler is about to loop back into us anyway.
                bump(&self.stats.eintr_retries);
                return;
            }
            panic!("idle callback failed: {err}");
        }
        bump(&self.stats.polls);

        for event in &events[..n as usize] {
            let ctx = event.u64 as *const FdContext;
            debug_assert!(!ctx.is_null());

            // SAFETY: user data always points into the context slab, whose
            // slots outlive the bridge and stay initialized after release.
            let waiter = unsafe { (*ctx).waiter() };
            if waiter.is_valid() {
                self.reactor.resume_fiber(waiter);
                bump(&self.stats.resumes);
            } else {
                // Fiber died or fd deregistered between event queueing and
                // delivery; see module docs.
                bump(&self.stats.stale_events);
            }
        }
    }
}

/// Epoll timeout conversion: `Duration::MAX` blocks, a positive
/// sub-millisecond duration rounds up to 1 ms, zero stays zero.
fn timeout_to_millis(timeout: Duration) -> i32 {
    if timeout == Duration::MAX {
        return -1;
    }
    if timeout.is_zero() {
        return 0;
    }
    let millis = timeout.as_millis();
    if millis == 0 {
        1
    } else {
        millis.min(i32::MAX as u128) as i32
    }
}
