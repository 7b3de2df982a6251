//! Countdown event.
//!
//! [`CountdownEvent`] starts at an initial count and completes once
//! [`signal`](CountdownEvent::signal) has driven the count to zero. Every
//! queued waiter is granted at the zero transition and the event latches:
//! later waits complete immediately until [`reset`](CountdownEvent::reset).
//!
//! All count arithmetic is checked. Signalling more than the remaining
//! count, signalling zero, or adding to an already-completed countdown are
//! usage errors and fail the call without changing state.

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::cx::Cx;
use crate::sync::event::EventWaitError;
use crate::sync::waiter::{GrantLedger, WaitQueue, WakeSet};

/// Error returned when signalling a countdown fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownSignalError {
    /// The signal count exceeds the remaining count.
    ExceedsCount,
    /// Signalling zero is a usage error.
    ZeroCount,
}

impl std::fmt::Display for CountdownSignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExceedsCount => write!(f, "signal count exceeds the remaining count"),
            Self::ZeroCount => write!(f, "cannot signal zero counts"),
        }
    }
}

impl std::error::Error for CountdownSignalError {}

/// Error returned when raising the remaining count fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownAddError {
    /// The countdown already completed; the count cannot be raised again
    /// without a reset.
    AlreadyCompleted,
    /// The addition would overflow the count.
    Overflow,
    /// Adding zero is a usage error.
    ZeroCount,
}

impl std::fmt::Display for CountdownAddError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyCompleted => write!(f, "countdown already completed"),
            Self::Overflow => write!(f, "count addition overflows"),
            Self::ZeroCount => write!(f, "cannot add zero counts"),
        }
    }
}

impl std::error::Error for CountdownAddError {}

/// An event that completes once its count has been signalled down to zero.
#[derive(Debug)]
pub struct CountdownEvent {
    state: ParkingMutex<CountdownState>,
}

#[derive(Debug)]
struct CountdownState {
    remaining: usize,
    initial: usize,
    queue: WaitQueue,
    granted: GrantLedger<()>,
}

impl CountdownState {
    /// Grants every queued waiter. Called exactly at the zero transition.
    fn complete(&mut self, wakes: &mut WakeSet) {
        while let Some(waiter) = self.queue.pop_front() {
            self.granted.stage(waiter.id, ());
            wakes.push(waiter.waker);
        }
    }
}

impl CountdownEvent {
    /// Creates a new countdown starting at `count`. A count of zero starts
    /// the event already completed.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: ParkingMutex::new(CountdownState {
                remaining: count,
                initial: count,
                queue: WaitQueue::new(),
                granted: GrantLedger::new(),
            }),
        }
    }

    /// Returns the remaining count.
    #[must_use]
    pub fn current_count(&self) -> usize {
        self.state.lock().remaining
    }

    /// Returns the count the event started with, as set at construction or
    /// by the last [`reset_to`](Self::reset_to).
    #[must_use]
    pub fn initial_count(&self) -> usize {
        self.state.lock().initial
    }

    /// Returns whether the countdown has completed.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().remaining == 0
    }

    /// Returns the number of callers currently waiting for completion.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Signals the countdown once. Returns `true` if this signal completed
    /// the countdown.
    pub fn signal(&self) -> Result<bool, CountdownSignalError> {
        self.signal_many(1)
    }

    /// Signals the countdown `count` times. Returns `true` if the countdown
    /// completed. On error the remaining count is unchanged.
    pub fn signal_many(&self, count: usize) -> Result<bool, CountdownSignalError> {
        if count == 0 {
            return Err(CountdownSignalError::ZeroCount);
        }
        let (completed, wakes) = {
            let mut state = self.state.lock();
            let Some(remaining) = state.remaining.checked_sub(count) else {
                return Err(CountdownSignalError::ExceedsCount);
            };
            state.remaining = remaining;
            let mut wakes = WakeSet::new();
            let completed = remaining == 0;
            if completed {
                state.complete(&mut wakes);
            }
            (completed, wakes)
        };
        wakes.wake_all();
        Ok(completed)
    }

    /// Raises the remaining count by `count`. Fails once the countdown has
    /// completed; use [`reset`](Self::reset) to rearm it.
    pub fn add_count(&self, count: usize) -> Result<(), CountdownAddError> {
        if count == 0 {
            return Err(CountdownAddError::ZeroCount);
        }
        let mut state = self.state.lock();
        if state.remaining == 0 {
            return Err(CountdownAddError::AlreadyCompleted);
        }
        state.remaining = state
            .remaining
            .checked_add(count)
            .ok_or(CountdownAddError::Overflow)?;
        Ok(())
    }

    /// Rearms the countdown at its initial count. Queued waiters stay
    /// queued and wait for the new countdown.
    pub fn reset(&self) {
        let initial = self.state.lock().initial;
        self.reset_to(initial);
    }

    /// Rearms the countdown at `count`, which also becomes the new initial
    /// count. A count of zero completes the event immediately.
    pub fn reset_to(&self, count: usize) {
        let wakes = {
            let mut state = self.state.lock();
            state.remaining = count;
            state.initial = count;
            let mut wakes = WakeSet::new();
            if count == 0 {
                state.complete(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
    }

    /// Waits until the countdown completes.
    pub fn wait<'a, 'b>(&'a self, cx: &'b Cx) -> CountdownWaitFuture<'a, 'b> {
        CountdownWaitFuture {
            event: self,
            cx,
            waiter_id: None,
        }
    }

    /// Waits until the countdown completes, blocking the calling thread.
    pub fn wait_blocking(&self, cx: &Cx) -> Result<(), EventWaitError> {
        crate::sync::blocking::block_on_future(self.wait(cx))
    }

    /// Like [`wait_blocking`](Self::wait_blocking), giving up after
    /// `timeout`. Expiry behaves as implicit cancellation.
    pub fn wait_blocking_timeout(
        &self,
        cx: &Cx,
        timeout: std::time::Duration,
    ) -> Result<(), EventWaitError> {
        crate::sync::blocking::block_on_future_deadline(
            self.wait(cx),
            std::time::Instant::now() + timeout,
            EventWaitError::Cancelled,
        )
    }
}

/// Future returned by [`CountdownEvent::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct CountdownWaitFuture<'a, 'b> {
    event: &'a CountdownEvent,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for CountdownWaitFuture<'_, '_> {
    type Output = Result<(), EventWaitError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.event.state.lock();

        // A staged grant wins over cancellation.
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
            return Poll::Ready(Err(EventWaitError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if state.remaining == 0 {
                    debug_assert!(state.queue.is_empty(), "countdown completed with waiters");
                    return Poll::Ready(Ok(()));
                }
                let id = state.queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.queue.register(id, context.waker());
                debug_assert!(registered, "countdown waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for CountdownWaitFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let mut state = self.event.state.lock();
        if !state.queue.remove(id) {
            // Completion grants are broadcast, not consumed.
            let _ = state.granted.take(id);
        }
    }
}
