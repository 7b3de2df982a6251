//! Condition variable for [`AsyncLock`].
//!
//! An [`AsyncCondvar`] is bound to at most one lock at a time: the first
//! [`wait`](AsyncCondvar::wait) attaches it to that lock, and it detaches
//! once its queue empties. Waiting atomically gives up the lock (handing it
//! to the next queued acquirer) and parks the caller on the condition
//! variable; [`pulse`](AsyncCondvar::pulse) and
//! [`pulse_all`](AsyncCondvar::pulse_all) move parked waiters back into the
//! lock's wait queue, and each wait resolves only once its caller holds the
//! lock again, yielding a fresh [`LockKey`].
//!
//! A cancelled wait resolves with an error and *without* the lock; any pulse
//! it may have consumed is not replayed.

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::cx::Cx;
use crate::sync::lock::{AsyncLock, LockKey, LockShared};
use crate::sync::waiter::{next_waiter_id, WaitQueue, WakeSet};

/// Error returned when a condition-variable wait fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondvarWaitError {
    /// Cancelled while parked or while re-acquiring the lock.
    ///
    /// The caller does not hold the lock.
    Cancelled,
    /// The associated lock was abandoned.
    Abandoned,
}

impl std::fmt::Display for CondvarWaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "condition wait cancelled"),
            Self::Abandoned => write!(f, "associated lock abandoned"),
        }
    }
}

impl std::error::Error for CondvarWaitError {}

/// Condition variable usable with one [`AsyncLock`] at a time.
#[derive(Debug)]
pub struct AsyncCondvar {
    state: ParkingMutex<CondvarState>,
}

#[derive(Debug)]
struct CondvarState {
    /// Lock this condition variable is currently bound to. Set by the first
    /// wait, cleared once the queue empties.
    owner: Option<Arc<LockShared>>,
    queue: WaitQueue,
}

impl AsyncCondvar {
    /// Creates a new, unbound condition variable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParkingMutex::new(CondvarState {
                owner: None,
                queue: WaitQueue::new(),
            }),
        }
    }

    /// Returns the number of callers parked on this condition variable.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Releases `key`'s lock and parks the caller until pulsed.
    ///
    /// The lock is handed to its next queued acquirer (or freed) before this
    /// call returns; the returned future resolves once the caller has been
    /// pulsed *and* has re-acquired the lock, yielding the new key.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not the current key of `lock`, or if this condition
    /// variable is already bound to a different lock. Both are usage bugs.
    pub fn wait<'a, 'b>(&'a self, cx: &'b Cx, lock: &AsyncLock, key: LockKey) -> CondvarWaitFuture<'a, 'b> {
        let mut key = key;
        let shared = Arc::clone(lock.shared());
        let (waiter_id, wakes) = {
            // Lock order is always condition variable first, then lock.
            let mut cv_state = self.state.lock();
            let mut lock_state = shared.state.lock();

            if lock_state.poisoned {
                key.raw.disarm();
                // Never enqueued; the first poll observes the poisoned lock.
                (next_waiter_id(), WakeSet::new())
            } else {
                assert!(
                    key.raw.matches(shared.id, lock_state.current_generation),
                    "condition variable wait requires the lock's current key"
                );
                match &cv_state.owner {
                    None => cv_state.owner = Some(Arc::clone(&shared)),
                    Some(owner) => assert!(
                        Arc::ptr_eq(owner, &shared),
                        "condition variable is already bound to a different lock"
                    ),
                }
                key.raw.disarm();
                // Park first, then give up the lock, so a pulse arriving
                // between the two cannot miss this waiter.
                let waiter_id = cv_state.queue.enqueue(Waker::noop());
                let mut wakes = WakeSet::new();
                lock_state.release_to_next(&mut wakes);
                (waiter_id, wakes)
            }
        };
        wakes.wake_all();
        CondvarWaitFuture {
            cv: self,
            lock_shared: shared,
            cx,
            waiter_id,
            done: false,
        }
    }

    /// Moves the head waiter back into the lock's wait queue.
    ///
    /// If the lock is currently free the waiter is granted it immediately.
    /// Pulsing with no waiters parked is a no-op.
    pub fn pulse(&self) {
        let wakes = {
            let mut cv_state = self.state.lock();
            let Some(owner) = cv_state.owner.clone() else {
                return;
            };
            let mut lock_state = owner.state.lock();
            let mut wakes = WakeSet::new();
            if let Some(waiter) = cv_state.queue.pop_front() {
                if lock_state.poisoned {
                    wakes.push_waiter(waiter);
                } else {
                    lock_state.admit_transferred(waiter, &mut wakes);
                }
            }
            if cv_state.queue.is_empty() {
                cv_state.owner = None;
            }
            wakes
        };
        wakes.wake_all();
    }

    /// Moves every parked waiter back into the lock's wait queue, in FIFO
    /// order, then detaches from the lock.
    pub fn pulse_all(&self) {
        let wakes = {
            let mut cv_state = self.state.lock();
            let Some(owner) = cv_state.owner.take() else {
                return;
            };
            let mut lock_state = owner.state.lock();
            let mut wakes = WakeSet::new();
            for waiter in cv_state.queue.take_all() {
                if lock_state.poisoned {
                    wakes.push_waiter(waiter);
                } else {
                    lock_state.admit_transferred(waiter, &mut wakes);
                }
            }
            wakes
        };
        wakes.wake_all();
    }

    /// Waits for a pulse, blocking the calling thread.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`wait`](Self::wait).
    pub fn wait_blocking(
        &self,
        cx: &Cx,
        lock: &AsyncLock,
        key: LockKey,
    ) -> Result<LockKey, CondvarWaitError> {
        crate::sync::blocking::block_on_future(self.wait(cx, lock, key))
    }

    /// Like [`wait_blocking`](Self::wait_blocking) with a timeout. Expiry
    /// behaves as implicit cancellation: the caller resolves *without* the
    /// lock and must reacquire it.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`wait`](Self::wait).
    pub fn wait_blocking_timeout(
        &self,
        cx: &Cx,
        lock: &AsyncLock,
        key: LockKey,
        timeout: std::time::Duration,
    ) -> Result<LockKey, CondvarWaitError> {
        crate::sync::blocking::block_on_future_deadline(
            self.wait(cx, lock, key),
            std::time::Instant::now() + timeout,
            CondvarWaitError::Cancelled,
        )
    }
}

impl Default for AsyncCondvar {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`AsyncCondvar::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct CondvarWaitFuture<'a, 'b> {
    cv: &'a AsyncCondvar,
    lock_shared: Arc<LockShared>,
    cx: &'b Cx,
    waiter_id: u64,
    done: bool,
}

impl Future for CondvarWaitFuture<'_, '_> {
    type Output = Result<LockKey, CondvarWaitError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cv_state = self.cv.state.lock();
        let mut lock_state = self.lock_shared.state.lock();
        let id = self.waiter_id;

        // Once the lock has been re-granted, the wait succeeded; cancellation
        // arriving now is too late.
        if let Some(generation) = lock_state.granted.take(id) {
            drop(lock_state);
            drop(cv_state);
            self.done = true;
            return Poll::Ready(Ok(LockKey::grant(&self.lock_shared, generation)));
        }

        if lock_state.poisoned {
            lock_state.queue.remove(id);
            if cv_state.queue.remove(id) && cv_state.queue.is_empty() {
                cv_state.owner = None;
            }
            drop(lock_state);
            drop(cv_state);
            self.done = true;
            return Poll::Ready(Err(CondvarWaitError::Abandoned));
        }

        if self.cx.checkpoint().is_err() {
            let in_cv = cv_state.queue.remove(id);
            if in_cv && cv_state.queue.is_empty() {
                cv_state.owner = None;
            }
            let removed = in_cv || lock_state.queue.remove(id);
            debug_assert!(removed, "condvar waiter neither queued nor granted");
            drop(lock_state);
            drop(cv_state);
            self.done = true;
            return Poll::Ready(Err(CondvarWaitError::Cancelled));
        }

        // Register the waker wherever the waiter currently sits: parked on
        // the condition variable, or transferred into the lock's queue.
        let registered = cv_state.queue.register(id, context.waker())
            || lock_state.queue.register(id, context.waker());
        debug_assert!(registered, "condvar waiter neither queued nor granted");
        Poll::Pending
    }
}

impl Drop for CondvarWaitFuture<'_, '_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let wakes = {
            let mut cv_state = self.cv.state.lock();
            let mut lock_state = self.lock_shared.state.lock();
            let mut wakes = WakeSet::new();
            let id = self.waiter_id;
            if cv_state.queue.remove(id) {
                if cv_state.queue.is_empty() {
                    cv_state.owner = None;
                }
            } else if !lock_state.queue.remove(id) {
                // Already granted but never observed: pass the lock onward.
                if let Some(generation) = lock_state.granted.take(id) {
                    debug_assert_eq!(generation, lock_state.current_generation);
                    lock_state.release_to_next(&mut wakes);
                }
            }
            wakes
        };
        wakes.wake_all();
    }
}
