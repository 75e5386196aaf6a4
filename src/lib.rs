//! Core runtime primitives for a single-threaded cooperative fiber reactor.
//!
//! The crate provides the three load-bearing pieces a fiber scheduler builds
//! on, plus the contracts it consumes:
//! - An epoll-backed I/O bridge ([`bridge`], [`fd`]) that lets fiber-synchronous
//!   `read`/`write` calls transparently suspend until the kernel signals
//!   readiness (edge-triggered, drain-until-`EAGAIN` discipline).
//! - Fiber-local storage ([`fls`]): a fixed-size per-fiber slab with typed
//!   slots registered at startup and swapped by pointer on context switch.
//! - A cascading timer wheel ([`wheel`]): O(1) amortized insertion and expiry
//!   over a wide span, with O(1) cancellation via intrusive links.
//!
//! Everything assumes one OS thread — the reactor's thread. There is no
//! locking because there is no cross-thread mutation; the active-FLS pointer
//! and the bridge singleton are thread-local by construction.
//!
//! The scheduler itself is not part of the crate: it is consumed through the
//! [`fiber::Reactor`] trait (suspend/resume/idle-callback). A deterministic
//! single-threaded host lives in [`sim`] for tests and as a reference
//! implementation of the contract.

pub mod fiber;
pub mod fls;
pub mod stdx;
pub mod tsc;
pub mod wheel;

#[cfg(target_os = "linux")]
pub mod bridge;
#[cfg(target_os = "linux")]
pub mod fd;
#[cfg(target_os = "linux")]
pub mod sim;

pub use fiber::{FiberCell, FiberHandle, Reactor};
pub use fls::{FlsArea, FlsSlot};
pub use tsc::TscTimePoint;
pub use wheel::{InsertError, TimerEntry, TimerWheel, WheelStats};

#[cfg(target_os = "linux")]
pub use bridge::{BridgeStats, OsError, RegisterError};
#[cfg(target_os = "linux")]
pub use fd::Fd;

// --------------------------
// Configuration constants
// --------------------------

/// Capacity of the FD context pool. Registration beyond this fails with
/// `ResourceExhausted` rather than growing; the reactor's working set stays
/// bounded.
pub const MAX_CONCURRENT_FDS: usize = 512;

/// Number of events fetched per `epoll_wait` call in the idle callback.
pub const NUM_BATCH_EVENTS: usize = 32;

/// Bytes of fiber-local storage per fiber. All slots registered at startup
/// must fit in this budget; `fls::FlsArea::alloc_slot` asserts on overflow.
pub const FLS_AREA_SIZE: usize = 512;
