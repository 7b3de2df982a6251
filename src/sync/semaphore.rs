//! Counting semaphore with checked capacity.
//!
//! [`AsyncSemaphore`] hands out plain permits up to a fixed maximum; permits
//! are not capability tokens and are returned by calling
//! [`release`](AsyncSemaphore::release). Releasing while waiters are queued
//! transfers the permit to the head waiter directly instead of inflating the
//! available count, so permits are granted in strict FIFO order.
//!
//! All count arithmetic is checked: a release that would push the available
//! count past the maximum is refused, and zero-count calls are errors.
//!
//! # Example
//!
//! ```ignore
//! use synckit::sync::AsyncSemaphore;
//!
//! let semaphore = AsyncSemaphore::new(2);
//! semaphore.acquire(&cx).await?;
//! // ... bounded section ...
//! semaphore.release()?;
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::cx::Cx;
use crate::sync::waiter::{GrantLedger, WaitQueue, WakeSet};

/// Error returned when an async permit acquire fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreAcquireError {
    /// Cancelled while waiting for a permit.
    Cancelled,
}

impl std::fmt::Display for SemaphoreAcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "permit acquire cancelled"),
        }
    }
}

impl std::error::Error for SemaphoreAcquireError {}

/// Error returned when trying to acquire a permit without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrySemaphoreAcquireError;

impl std::fmt::Display for TrySemaphoreAcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no permits available")
    }
}

impl std::error::Error for TrySemaphoreAcquireError {}

/// Error returned when releasing permits fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreReleaseError {
    /// The release would push the available count past the maximum.
    ExceedsMaxCount,
    /// Releasing zero permits is a usage error.
    ZeroCount,
}

impl std::fmt::Display for SemaphoreReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExceedsMaxCount => write!(f, "release exceeds the semaphore maximum"),
            Self::ZeroCount => write!(f, "cannot release zero permits"),
        }
    }
}

impl std::error::Error for SemaphoreReleaseError {}

/// An asynchronous counting semaphore.
#[derive(Debug)]
pub struct AsyncSemaphore {
    state: ParkingMutex<SemaphoreState>,
}

#[derive(Debug)]
struct SemaphoreState {
    available: usize,
    max_count: usize,
    queue: WaitQueue,
    granted: GrantLedger<()>,
}

impl SemaphoreState {
    /// Returns one permit: transferred to the head waiter if any, otherwise
    /// added back to the available count.
    fn return_permit(&mut self, wakes: &mut WakeSet) {
        match self.queue.pop_front() {
            Some(waiter) => {
                self.granted.stage(waiter.id, ());
                wakes.push(waiter.waker);
            }
            None => {
                debug_assert!(self.available < self.max_count);
                self.available += 1;
            }
        }
    }
}

impl AsyncSemaphore {
    /// Creates a new semaphore with `permits` permits available and the
    /// maximum set to the same value.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self::with_initial(permits, permits)
    }

    /// Creates a new semaphore with `initial` permits available out of a
    /// maximum of `max_count`.
    ///
    /// # Panics
    ///
    /// Panics if `initial > max_count`.
    #[must_use]
    pub fn with_initial(initial: usize, max_count: usize) -> Self {
        assert!(
            initial <= max_count,
            "initial permits exceed the semaphore maximum"
        );
        Self {
            state: ParkingMutex::new(SemaphoreState {
                available: initial,
                max_count,
                queue: WaitQueue::new(),
                granted: GrantLedger::new(),
            }),
        }
    }

    /// Returns the number of currently available permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.state.lock().available
    }

    /// Returns the maximum number of permits.
    #[must_use]
    pub fn max_count(&self) -> usize {
        self.state.lock().max_count
    }

    /// Returns the number of callers currently waiting for a permit.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Acquires one permit asynchronously.
    pub fn acquire<'a, 'b>(&'a self, cx: &'b Cx) -> SemaphoreAcquireFuture<'a, 'b> {
        SemaphoreAcquireFuture {
            semaphore: self,
            cx,
            waiter_id: None,
        }
    }

    /// Tries to acquire one permit without waiting.
    pub fn try_acquire(&self) -> Result<(), TrySemaphoreAcquireError> {
        let mut state = self.state.lock();
        // Strict FIFO: a free permit never bypasses queued waiters.
        if state.available == 0 || !state.queue.is_empty() {
            return Err(TrySemaphoreAcquireError);
        }
        state.available -= 1;
        Ok(())
    }

    /// Releases one permit.
    pub fn release(&self) -> Result<(), SemaphoreReleaseError> {
        self.release_many(1)
    }

    /// Releases `count` permits, satisfying queued waiters head-first and
    /// adding the remainder to the available count.
    ///
    /// The call is atomic: if the remainder would exceed the maximum, no
    /// waiter is granted and no permit is added.
    pub fn release_many(&self, count: usize) -> Result<(), SemaphoreReleaseError> {
        if count == 0 {
            return Err(SemaphoreReleaseError::ZeroCount);
        }
        let wakes = {
            let mut state = self.state.lock();
            let served = count.min(state.queue.len());
            let leftover = count - served;
            let fits = state
                .available
                .checked_add(leftover)
                .is_some_and(|total| total <= state.max_count);
            if !fits {
                return Err(SemaphoreReleaseError::ExceedsMaxCount);
            }
            let mut wakes = WakeSet::new();
            for _ in 0..served {
                let Some(waiter) = state.queue.pop_front() else {
                    break;
                };
                state.granted.stage(waiter.id, ());
                wakes.push(waiter.waker);
            }
            state.available += leftover;
            wakes
        };
        wakes.wake_all();
        Ok(())
    }

    /// Acquires one permit, blocking the calling thread until granted.
    pub fn acquire_blocking(&self, cx: &Cx) -> Result<(), SemaphoreAcquireError> {
        crate::sync::blocking::block_on_future(self.acquire(cx))
    }

    /// Like [`acquire_blocking`](Self::acquire_blocking), giving up after
    /// `timeout`. Expiry behaves as implicit cancellation.
    pub fn acquire_blocking_timeout(
        &self,
        cx: &Cx,
        timeout: std::time::Duration,
    ) -> Result<(), SemaphoreAcquireError> {
        crate::sync::blocking::block_on_future_deadline(
            self.acquire(cx),
            std::time::Instant::now() + timeout,
            SemaphoreAcquireError::Cancelled,
        )
    }
}

/// Future returned by [`AsyncSemaphore::acquire`].
#[must_use = "futures do nothing unless polled"]
pub struct SemaphoreAcquireFuture<'a, 'b> {
    semaphore: &'a AsyncSemaphore,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for SemaphoreAcquireFuture<'_, '_> {
    type Output = Result<(), SemaphoreAcquireError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.semaphore.state.lock();

        // A transferred permit wins over cancellation.
        if let Some(id) = self.waiter_id {
            if state.granted.take(id).is_some() {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(()));
            }
        }

        if self.cx.checkpoint().is_err() {
            if let Some(id) = self.waiter_id.take() {
                let removed = state.queue.remove(id);
                debug_assert!(removed, "cancelled waiter neither queued nor granted");
            }
            return Poll::Ready(Err(SemaphoreAcquireError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if state.available > 0 && state.queue.is_empty() {
                    state.available -= 1;
                    return Poll::Ready(Ok(()));
                }
                let id = state.queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.queue.register(id, context.waker());
                debug_assert!(registered, "permit waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for SemaphoreAcquireFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let wakes = {
            let mut state = self.semaphore.state.lock();
            let mut wakes = WakeSet::new();
            if !state.queue.remove(id) && state.granted.take(id).is_some() {
                // Permit transferred but never observed: hand it onward.
                state.return_permit(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
    }
}
