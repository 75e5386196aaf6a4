//! Small, self-contained data structures used across the reactor core.
//!
//! # Scope
//! `stdx` hosts narrow, allocation-light utilities that back the runtime
//! primitives. They are tuned for predictable memory use and fast paths
//! rather than general-purpose ergonomics.
//!
//! # Design themes
//! - Fixed or upfront capacity; operations panic or error on overflow.
//! - Tight invariants enable `unsafe` fast paths (documented per type).
//! - Deterministic reset behavior for reuse in hot loops.
//!
//! # Module map
//! - `list`: intrusive doubly-linked list with O(1) unlink by element.
//! - `fixed_pool`: preallocated slab with an index free list; slots stay
//!   initialized after release so stale pointers read benign values.
//!
//! # Safety
//! Both types use `unsafe` internally and rely on invariants called out in
//! their module docs. Read those before extending or reusing the internals.

pub mod fixed_pool;
pub mod list;

pub use fixed_pool::FixedPool;
pub use list::{List, ListLink, ListNode};
