//! Asynchronous synchronization primitives with capability-key release.
//!
//! The primitives in this module share one waiting protocol: acquirers park
//! in a FIFO queue, and whoever releases the resource hands it to the head
//! waiter directly. A grant is staged under the primitive's lock and picked
//! up the next time the waiter's future is polled, so the resource is never
//! observable as free while anyone is queued.
//!
//! # Primitives
//!
//! - [`AsyncLock`]: mutual exclusion released by a [`LockKey`] capability
//! - [`AsyncCondvar`]: condition variable paired with an [`AsyncLock`]
//! - [`AsyncRwLock`]: fair reader/writer lock with upgradeable readers and
//!   pluggable [`ContentionStrategy`]
//! - [`AsyncSemaphore`]: counting semaphore with checked capacity
//! - [`ManualResetEvent`] / [`AutoResetEvent`]: broadcast and single-waiter
//!   signal gates
//! - [`CountdownEvent`]: completes when its count is signalled to zero
//! - [`ContendedLock`]: [`AsyncLock`] with optional contention metrics
//!
//! # Keys
//!
//! The lock-shaped primitives do not return RAII guards. Acquisition
//! resolves to a key value that must be passed back to the matching
//! release method; a key that is stale, foreign, or already spent is
//! rejected. In debug builds, dropping a key without releasing it marks
//! the primitive abandoned and fails all current and future waiters.
//!
//! # Cancellation
//!
//! Waiting futures observe cancellation through [`Cx`](crate::cx::Cx)
//! checkpoints. A waiter that is cancelled while queued resolves with a
//! cancellation error and leaves the queue; a waiter whose grant was
//! already staged resolves granted, and cancellation is reported on the
//! following checkpoint instead. Dropping a granted-but-unobserved future
//! hands the resource onward, so nothing is leaked either way.

mod blocking;
mod condvar;
mod contended;
mod countdown;
mod event;
mod key;
mod lock;
mod rwlock;
mod semaphore;
mod waiter;

pub use condvar::{AsyncCondvar, CondvarWaitError, CondvarWaitFuture};
pub use contended::{ContendedLock, LockMetricsSnapshot};
pub use countdown::{
    CountdownAddError, CountdownEvent, CountdownSignalError, CountdownWaitFuture,
};
pub use event::{
    AutoResetEvent, AutoResetWaitFuture, EventWaitError, ManualResetEvent, ManualResetWaitFuture,
};
pub use lock::{AcquireError, AcquireFuture, AsyncLock, LockKey, ReleaseError, TryAcquireError};
pub use rwlock::{
    AsyncRwLock, ContentionStrategy, ReadFuture, ReaderKey, ReleaseUpgradeableError,
    RwAcquireError, RwReleaseError, TryRwAcquireError, UpgradeError, UpgradeFuture,
    UpgradeableReadFuture, UpgradeableReaderKey, WriteFuture, WriterKey,
};
pub use semaphore::{
    AsyncSemaphore, SemaphoreAcquireError, SemaphoreAcquireFuture, SemaphoreReleaseError,
    TrySemaphoreAcquireError,
};
