//! Manual- and auto-reset events.
//!
//! Both event types gate waiters on a boolean signal. [`ManualResetEvent`]
//! stays signalled once [`set`](ManualResetEvent::set) is called: every
//! queued waiter is granted and later waits complete immediately until
//! [`reset`](ManualResetEvent::reset). [`AutoResetEvent`] hands the signal
//! to exactly one waiter per [`set`](AutoResetEvent::set): the head of the
//! queue if anyone is waiting, otherwise the signal latches for the next
//! wait. A latched signal does not accumulate; setting an already-set
//! auto-reset event is a no-op.
//!
//! Grants are staged at `set` time. A waiter that was granted keeps its
//! grant even if the event is reset before it gets to run.

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::cx::Cx;
use crate::sync::waiter::{GrantLedger, WaitQueue, WakeSet};

/// Error returned when waiting on an event fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWaitError {
    /// Cancelled while waiting for the event to be set.
    Cancelled,
}

impl std::fmt::Display for EventWaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "event wait cancelled"),
        }
    }
}

impl std::error::Error for EventWaitError {}

#[derive(Debug)]
struct EventState {
    set: bool,
    queue: WaitQueue,
    granted: GrantLedger<()>,
}

impl EventState {
    fn new(set: bool) -> Self {
        Self {
            set,
            queue: WaitQueue::new(),
            granted: GrantLedger::new(),
        }
    }
}

/// An event that stays signalled until explicitly reset.
#[derive(Debug)]
pub struct ManualResetEvent {
    state: ParkingMutex<EventState>,
}

impl ManualResetEvent {
    /// Creates a new event in the given initial state.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: ParkingMutex::new(EventState::new(initially_set)),
        }
    }

    /// Returns whether the event is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Returns the number of callers currently waiting for the event.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Sets the event, granting every queued waiter. The event remains set
    /// until [`reset`](Self::reset).
    pub fn set(&self) {
        let wakes = {
            let mut state = self.state.lock();
            state.set = true;
            let mut wakes = WakeSet::new();
            while let Some(waiter) = state.queue.pop_front() {
                state.granted.stage(waiter.id, ());
                wakes.push(waiter.waker);
            }
            wakes
        };
        wakes.wake_all();
    }

    /// Clears the event. Waiters granted by an earlier
    /// [`set`](Self::set) keep their grant.
    pub fn reset(&self) {
        self.state.lock().set = false;
    }

    /// Waits until the event is set.
    pub fn wait<'a, 'b>(&'a self, cx: &'b Cx) -> ManualResetWaitFuture<'a, 'b> {
        ManualResetWaitFuture {
            event: self,
            cx,
            waiter_id: None,
        }
    }

    /// Waits until the event is set, blocking the calling thread.
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

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Future returned by [`ManualResetEvent::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct ManualResetWaitFuture<'a, 'b> {
    event: &'a ManualResetEvent,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for ManualResetWaitFuture<'_, '_> {
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
                if state.set {
                    debug_assert!(state.queue.is_empty(), "event set with waiters queued");
                    return Poll::Ready(Ok(()));
                }
                let id = state.queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.queue.register(id, context.waker());
                debug_assert!(registered, "event waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for ManualResetWaitFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let mut state = self.event.state.lock();
        if !state.queue.remove(id) {
            // An unobserved manual-reset grant is not a consumable resource;
            // discarding it loses nothing.
            let _ = state.granted.take(id);
        }
    }
}

/// An event that hands its signal to exactly one waiter per `set`.
#[derive(Debug)]
pub struct AutoResetEvent {
    state: ParkingMutex<EventState>,
}

impl AutoResetEvent {
    /// Creates a new event in the given initial state.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: ParkingMutex::new(EventState::new(initially_set)),
        }
    }

    /// Returns whether the signal is currently latched.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Returns the number of callers currently waiting for the event.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Sets the event. The head waiter is granted if anyone is queued;
    /// otherwise the signal latches for the next wait. Setting an
    /// already-set event is a no-op.
    pub fn set(&self) {
        let waker = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(waiter) => {
                    state.granted.stage(waiter.id, ());
                    Some(waiter.waker)
                }
                None => {
                    state.set = true;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Clears a latched signal. Waiters granted by an earlier
    /// [`set`](Self::set) keep their grant.
    pub fn reset(&self) {
        self.state.lock().set = false;
    }

    /// Waits until the event is set, consuming the signal.
    pub fn wait<'a, 'b>(&'a self, cx: &'b Cx) -> AutoResetWaitFuture<'a, 'b> {
        AutoResetWaitFuture {
            event: self,
            cx,
            waiter_id: None,
        }
    }

    /// Waits until the event is set, blocking the calling thread.
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

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Future returned by [`AutoResetEvent::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct AutoResetWaitFuture<'a, 'b> {
    event: &'a AutoResetEvent,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for AutoResetWaitFuture<'_, '_> {
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
                if state.set {
                    debug_assert!(state.queue.is_empty(), "signal latched with waiters queued");
                    state.set = false;
                    return Poll::Ready(Ok(()));
                }
                let id = state.queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.queue.register(id, context.waker());
                debug_assert!(registered, "event waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for AutoResetWaitFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let waker = {
            let mut state = self.event.state.lock();
            if state.queue.remove(id) || state.granted.take(id).is_none() {
                None
            } else {
                // Unobserved signal: hand it to the next waiter or re-latch.
                match state.queue.pop_front() {
                    Some(waiter) => {
                        state.granted.stage(waiter.id, ());
                        Some(waiter.waker)
                    }
                    None => {
                        state.set = true;
                        None
                    }
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
