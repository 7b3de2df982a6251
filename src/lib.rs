//! Synckit: asynchronous synchronization primitives with capability-key release.
//!
//! # Overview
//!
//! Synckit provides runtime-agnostic async locks, events, and counters built
//! on a single waiting protocol: acquirers park in a FIFO queue, and every
//! release hands the resource to the head waiter directly. There is no
//! wake-and-retry window in which a late arrival can overtake a queued
//! waiter, and a contended resource is never observable as free.
//!
//! Lock-shaped primitives resolve to key values instead of RAII guards. The
//! key is the capability to release: it encodes which grant it belongs to,
//! so stale or foreign keys are rejected, and a condition-variable wait can
//! surrender and reacquire the lock without a guard's lifetime getting in
//! the way.
//!
//! # Core Guarantees
//!
//! - **FIFO handoff**: waiters are granted strictly in arrival order, per
//!   role, subject to the configured contention strategy
//! - **Exactly-once grants**: a cancellation that races a grant resolves to
//!   exactly one of the two; the resource is re-queued, never leaked
//! - **Checked arithmetic**: counts never silently wrap; capacity and
//!   over-signal violations fail the offending call
//! - **Abandonment detection**: in debug builds, dropping a key without
//!   releasing it marks the primitive abandoned and fails its waiters
//! - **No unsafe code**: the crate is `#![forbid(unsafe_code)]`
//!
//! # Module Structure
//!
//! - [`sync`]: the primitives (lock, condvar, rwlock, semaphore, events,
//!   countdown, contention metrics)
//! - [`cx`]: cancellation context threaded through every suspending call
//! - [`error`]: error vocabulary for the checkpoint contract
//! - [`test_utils`]: logging setup and assertion macros shared by tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]

pub mod cx;
pub mod error;
pub mod sync;
pub mod test_utils;

// Re-exports for convenient access to core types
pub use cx::Cx;
pub use error::{Error, ErrorKind};
pub use sync::{
    AsyncCondvar, AsyncLock, AsyncRwLock, AsyncSemaphore, AutoResetEvent, ContendedLock,
    ContentionStrategy, CountdownEvent, LockKey, ManualResetEvent, ReaderKey,
    UpgradeableReaderKey, WriterKey,
};
