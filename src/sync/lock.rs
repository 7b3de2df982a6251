//! Keyed asynchronous mutual exclusion.
//!
//! [`AsyncLock`] suspends contending callers as pending futures instead of
//! blocking a thread. A successful acquire returns a [`LockKey`] — an opaque
//! capability carrying the generation minted for this hold — and the key must
//! be passed back through [`AsyncLock::release`]. Releasing with a stale or
//! foreign key fails; it never unlocks someone else's hold.
//!
//! Ownership is handed off directly: when waiters are queued, release mints
//! the next generation and stages it for the head waiter under the internal
//! lock, so the lock is never observable as free while anyone is waiting.
//!
//! # Cancellation
//!
//! Waiting is cancel-safe. A waiter cancelled via its [`Cx`] — or by dropping
//! the acquire future — is removed from the queue and resolves cancelled;
//! if its grant was already staged, the grant wins and cancellation is a
//! no-op (or, for a dropped future, the grant passes to the next waiter).
//!
//! # Example
//!
//! ```ignore
//! use synckit::sync::AsyncLock;
//!
//! let lock = AsyncLock::new();
//! let key = lock.acquire(&cx).await?;
//! // ... critical section ...
//! lock.release(key)?;
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::cx::Cx;
#[cfg(debug_assertions)]
use crate::sync::key::AbandonTarget;
use crate::sync::key::{next_instance_id, GenerationSource, KeyTracker, RawKey};
use crate::sync::waiter::{GrantLedger, WaitQueue, Waiter, WakeSet};

/// Error returned when an async acquire fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Cancelled while waiting for the lock.
    Cancelled,
    /// The lock was abandoned: a key was dropped without being released.
    Abandoned,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquire cancelled"),
            Self::Abandoned => write!(f, "lock abandoned"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Error returned when trying to acquire without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireError {
    /// The lock is currently held.
    Held,
    /// The lock was abandoned.
    Abandoned,
}

impl std::fmt::Display for TryAcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Held => write!(f, "lock is held"),
            Self::Abandoned => write!(f, "lock abandoned"),
        }
    }
}

impl std::error::Error for TryAcquireError {}

/// Error returned when releasing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    /// The key does not match the lock's current holder.
    ///
    /// The offending key is consumed by the failed call; in debug builds its
    /// tracker then reports the lost hold on whichever lock minted it.
    InvalidKey,
    /// The lock was abandoned.
    Abandoned,
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "key does not match the current holder"),
            Self::Abandoned => write!(f, "lock abandoned"),
        }
    }
}

impl std::error::Error for ReleaseError {}

/// An asynchronous mutual-exclusion lock handing out capability keys.
#[derive(Debug)]
pub struct AsyncLock {
    shared: Arc<LockShared>,
}

#[derive(Debug)]
pub(crate) struct LockShared {
    /// Instance identity baked into every key.
    pub(crate) id: u64,
    pub(crate) state: ParkingMutex<LockState>,
}

#[derive(Debug)]
pub(crate) struct LockState {
    /// Generation of the current holder; 0 means the lock is free.
    pub(crate) current_generation: u64,
    generations: GenerationSource,
    pub(crate) queue: WaitQueue,
    pub(crate) granted: GrantLedger<u64>,
    pub(crate) poisoned: bool,
}

impl LockState {
    /// Hands the lock to the head waiter, or frees it when nobody waits.
    pub(crate) fn release_to_next(&mut self, wakes: &mut WakeSet) {
        match self.queue.pop_front() {
            None => self.current_generation = 0,
            Some(waiter) => {
                let generation = self.generations.mint();
                self.current_generation = generation;
                self.granted.stage(waiter.id, generation);
                wakes.push(waiter.waker);
            }
        }
    }

    /// Admits a waiter transferred from a condition variable.
    ///
    /// When the lock is free the transferred waiter is granted on the spot;
    /// a freed lock with a populated queue cannot otherwise occur, so nobody
    /// would ever hand it onward.
    pub(crate) fn admit_transferred(&mut self, waiter: Waiter, wakes: &mut WakeSet) {
        if self.current_generation == 0 {
            debug_assert!(self.queue.is_empty(), "free lock with queued waiters");
            let generation = self.generations.mint();
            self.current_generation = generation;
            self.granted.stage(waiter.id, generation);
            wakes.push(waiter.waker);
        } else {
            self.queue.push_back(waiter);
        }
    }

    /// Latches the lock failed and fails every queued waiter.
    pub(crate) fn poison(&mut self, wakes: &mut WakeSet) {
        self.poisoned = true;
        for waiter in self.queue.take_all() {
            wakes.push_waiter(waiter);
        }
        self.granted.clear();
    }
}

impl AsyncLock {
    /// Creates a new unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LockShared {
                id: next_instance_id(),
                state: ParkingMutex::new(LockState {
                    current_generation: 0,
                    generations: GenerationSource::new(),
                    queue: WaitQueue::new(),
                    granted: GrantLedger::new(),
                    poisoned: false,
                }),
            }),
        }
    }

    /// Returns true if the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.state.lock().current_generation != 0
    }

    /// Returns true if the lock has been abandoned.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.shared.state.lock().poisoned
    }

    /// Returns the number of callers currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Acquires the lock asynchronously.
    pub fn acquire<'a, 'b>(&'a self, cx: &'b Cx) -> AcquireFuture<'a, 'b> {
        AcquireFuture {
            lock: self,
            cx,
            waiter_id: None,
        }
    }

    /// Tries to acquire the lock without waiting.
    pub fn try_acquire(&self) -> Result<LockKey, TryAcquireError> {
        let mut state = self.shared.state.lock();
        if state.poisoned {
            return Err(TryAcquireError::Abandoned);
        }
        if state.current_generation != 0 {
            return Err(TryAcquireError::Held);
        }
        let generation = state.generations.mint();
        state.current_generation = generation;
        drop(state);
        Ok(LockKey::grant(&self.shared, generation))
    }

    /// Releases the lock, consuming the holder's key.
    ///
    /// When waiters are queued, ownership passes directly to the head waiter;
    /// the lock never becomes observable as free in between.
    pub fn release(&self, key: LockKey) -> Result<(), ReleaseError> {
        let mut key = key;
        let wakes = {
            let mut state = self.shared.state.lock();
            if state.poisoned {
                key.raw.disarm();
                return Err(ReleaseError::Abandoned);
            }
            if !key.raw.matches(self.shared.id, state.current_generation) {
                return Err(ReleaseError::InvalidKey);
            }
            key.raw.disarm();
            let mut wakes = WakeSet::new();
            state.release_to_next(&mut wakes);
            wakes
        };
        wakes.wake_all();
        Ok(())
    }

    /// Acquires the lock, blocking the calling thread until granted.
    ///
    /// Spins briefly, then parks. Returns `Err(Cancelled)` once the context
    /// is cancelled.
    pub fn acquire_blocking(&self, cx: &Cx) -> Result<LockKey, AcquireError> {
        crate::sync::blocking::block_on_future(self.acquire(cx))
    }

    /// Like [`acquire_blocking`](Self::acquire_blocking), giving up after
    /// `timeout`. Expiry behaves as implicit cancellation.
    pub fn acquire_blocking_timeout(
        &self,
        cx: &Cx,
        timeout: std::time::Duration,
    ) -> Result<LockKey, AcquireError> {
        crate::sync::blocking::block_on_future_deadline(
            self.acquire(cx),
            std::time::Instant::now() + timeout,
            AcquireError::Cancelled,
        )
    }

    pub(crate) fn shared(&self) -> &Arc<LockShared> {
        &self.shared
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncLock {
    fn drop(&mut self) {
        // Plain acquire futures borrow the lock, so waiters can still be
        // queued here only after a condition variable transferred them in.
        let wakes = {
            let mut state = self.shared.state.lock();
            let mut wakes = WakeSet::new();
            if !state.queue.is_empty() || !state.granted.is_empty() {
                state.poison(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
    }
}

#[cfg(debug_assertions)]
impl AbandonTarget for LockShared {
    fn on_key_abandoned(&self) {
        let wakes = {
            let mut state = self.state.lock();
            let mut wakes = WakeSet::new();
            state.poison(&mut wakes);
            wakes
        };
        tracing::error!(
            target: "synckit::sync",
            lock = self.id,
            "lock key dropped without release; lock is abandoned"
        );
        wakes.wake_all();
    }
}

/// Future returned by [`AsyncLock::acquire`].
#[must_use = "futures do nothing unless polled"]
pub struct AcquireFuture<'a, 'b> {
    lock: &'a AsyncLock,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for AcquireFuture<'_, '_> {
    type Output = Result<LockKey, AcquireError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.shared.state.lock();

        // A staged grant wins over cancellation: once release handed us the
        // lock, the hold already exists and must be surfaced.
        if let Some(id) = self.waiter_id {
            if let Some(generation) = state.granted.take(id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(LockKey::grant(&self.lock.shared, generation)));
            }
        }

        if state.poisoned {
            if let Some(id) = self.waiter_id.take() {
                state.queue.remove(id);
            }
            return Poll::Ready(Err(AcquireError::Abandoned));
        }

        if self.cx.checkpoint().is_err() {
            if let Some(id) = self.waiter_id.take() {
                let removed = state.queue.remove(id);
                debug_assert!(removed, "cancelled waiter neither queued nor granted");
            }
            return Poll::Ready(Err(AcquireError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if state.current_generation == 0 {
                    debug_assert!(state.queue.is_empty(), "free lock with queued waiters");
                    let generation = state.generations.mint();
                    state.current_generation = generation;
                    drop(state);
                    return Poll::Ready(Ok(LockKey::grant(&self.lock.shared, generation)));
                }
                let id = state.queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.queue.register(id, context.waker());
                debug_assert!(registered, "lock waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for AcquireFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let wakes = {
            let mut state = self.lock.shared.state.lock();
            let mut wakes = WakeSet::new();
            if !state.queue.remove(id) {
                // Already granted but never observed: pass the lock onward.
                if let Some(generation) = state.granted.take(id) {
                    debug_assert_eq!(generation, state.current_generation);
                    state.release_to_next(&mut wakes);
                }
            }
            wakes
        };
        wakes.wake_all();
    }
}

/// Capability proving the current hold of an [`AsyncLock`].
#[must_use = "a key dropped without release abandons the lock"]
#[derive(Debug, PartialEq, Eq)]
pub struct LockKey {
    pub(crate) raw: RawKey,
}

impl LockKey {
    pub(crate) fn grant(shared: &Arc<LockShared>, generation: u64) -> Self {
        Self {
            raw: RawKey::new(shared.id, generation, KeyTracker::armed(shared)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::task::Waker;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn poll_once<T, F>(future: &mut F) -> Option<T>
    where
        F: Future<Output = T> + Unpin,
    {
        let waker = Waker::noop();
        let mut context = Context::from_waker(waker);
        match Pin::new(future).poll(&mut context) {
            Poll::Ready(value) => Some(value),
            Poll::Pending => None,
        }
    }

    fn forged_key(instance: u64, generation: u64) -> LockKey {
        LockKey {
            raw: RawKey::new(instance, generation, KeyTracker::disarmed()),
        }
    }

    fn release(lock: &AsyncLock, key: LockKey) {
        lock.release(key).expect("release should succeed");
    }

    #[test]
    fn new_lock_is_unlocked() {
        init_test("new_lock_is_unlocked");
        let lock = AsyncLock::new();
        crate::assert_with_log!(!lock.is_locked(), "lock starts free", false, lock.is_locked());
        assert_eq!(lock.waiters(), 0);
        crate::test_complete!("new_lock_is_unlocked");
    }

    #[test]
    fn try_acquire_round_trip() {
        init_test("try_acquire_round_trip");
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("try_acquire on free lock");
        assert!(lock.is_locked());
        assert_eq!(lock.try_acquire().unwrap_err(), TryAcquireError::Held);
        release(&lock, key);
        assert!(!lock.is_locked());
        crate::test_complete!("try_acquire_round_trip");
    }

    #[test]
    fn acquire_fast_path_grants_immediately() {
        init_test("acquire_fast_path_grants_immediately");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let mut future = lock.acquire(&cx);
        let key = poll_once(&mut future)
            .expect("fast path should resolve on first poll")
            .expect("grant");
        assert!(lock.is_locked());
        release(&lock, key);
        crate::test_complete!("acquire_fast_path_grants_immediately");
    }

    #[test]
    fn contended_acquire_waits_for_release() {
        init_test("contended_acquire_waits_for_release");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let first = lock.try_acquire().expect("first hold");

        let mut second = lock.acquire(&cx);
        assert!(poll_once(&mut second).is_none(), "second acquire must wait");
        assert_eq!(lock.waiters(), 1);

        release(&lock, first);
        let key = poll_once(&mut second)
            .expect("grant after release")
            .expect("grant");
        release(&lock, key);
        crate::test_complete!("contended_acquire_waits_for_release");
    }

    #[test]
    fn handoff_never_frees_lock_while_waiters_queued() {
        init_test("handoff_never_frees_lock_while_waiters_queued");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let first = lock.try_acquire().expect("first hold");
        let mut second = lock.acquire(&cx);
        assert!(poll_once(&mut second).is_none());

        release(&lock, first);
        crate::assert_with_log!(
            lock.is_locked(),
            "lock passes directly to the next holder",
            true,
            lock.is_locked()
        );
        assert_eq!(lock.try_acquire().unwrap_err(), TryAcquireError::Held);

        let key = poll_once(&mut second).expect("staged grant").expect("grant");
        release(&lock, key);
        crate::test_complete!("handoff_never_frees_lock_while_waiters_queued");
    }

    #[test]
    fn waiters_are_granted_in_fifo_order() {
        init_test("waiters_are_granted_in_fifo_order");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");

        let mut w1 = lock.acquire(&cx);
        let mut w2 = lock.acquire(&cx);
        let mut w3 = lock.acquire(&cx);
        assert!(poll_once(&mut w1).is_none());
        assert!(poll_once(&mut w2).is_none());
        assert!(poll_once(&mut w3).is_none());
        assert_eq!(lock.waiters(), 3);

        release(&lock, key);
        assert!(poll_once(&mut w2).is_none(), "w2 waits behind w1");
        assert!(poll_once(&mut w3).is_none(), "w3 waits behind w1");
        let k1 = poll_once(&mut w1).expect("w1 granted first").expect("grant");

        release(&lock, k1);
        assert!(poll_once(&mut w3).is_none(), "w3 waits behind w2");
        let k2 = poll_once(&mut w2).expect("w2 granted second").expect("grant");

        release(&lock, k2);
        let k3 = poll_once(&mut w3).expect("w3 granted third").expect("grant");
        release(&lock, k3);
        crate::test_complete!("waiters_are_granted_in_fifo_order");
    }

    #[test]
    fn generations_increase_across_holds() {
        init_test("generations_increase_across_holds");
        let lock = AsyncLock::new();
        let k1 = lock.try_acquire().expect("first");
        let g1 = k1.raw.generation();
        release(&lock, k1);
        let k2 = lock.try_acquire().expect("second");
        let g2 = k2.raw.generation();
        crate::assert_with_log!(g2 > g1, "generation advances", g1 + 1, g2);
        release(&lock, k2);
        crate::test_complete!("generations_increase_across_holds");
    }

    #[test]
    fn release_with_stale_generation_fails() {
        init_test("release_with_stale_generation_fails");
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");
        let stale = forged_key(lock.shared.id, key.raw.generation().wrapping_sub(1));
        assert_eq!(lock.release(stale).unwrap_err(), ReleaseError::InvalidKey);
        assert!(lock.is_locked(), "failed release must not unlock");
        release(&lock, key);
        crate::test_complete!("release_with_stale_generation_fails");
    }

    #[test]
    fn release_with_foreign_key_fails() {
        init_test("release_with_foreign_key_fails");
        let lock = AsyncLock::new();
        let other = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");
        let foreign = forged_key(other.shared.id, key.raw.generation());
        assert_eq!(lock.release(foreign).unwrap_err(), ReleaseError::InvalidKey);
        release(&lock, key);
        crate::test_complete!("release_with_foreign_key_fails");
    }

    #[test]
    fn release_on_free_lock_fails() {
        init_test("release_on_free_lock_fails");
        let lock = AsyncLock::new();
        let forged = forged_key(lock.shared.id, 1);
        assert_eq!(lock.release(forged).unwrap_err(), ReleaseError::InvalidKey);
        crate::test_complete!("release_on_free_lock_fails");
    }

    #[test]
    fn cancelled_waiter_resolves_cancelled() {
        init_test("cancelled_waiter_resolves_cancelled");
        let cx_waiter = Cx::for_testing();
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");

        let mut waiting = lock.acquire(&cx_waiter);
        assert!(poll_once(&mut waiting).is_none());
        cx_waiter.set_cancel_requested(true);
        assert_eq!(
            poll_once(&mut waiting).expect("cancellation resolves"),
            Err(AcquireError::Cancelled)
        );
        assert_eq!(lock.waiters(), 0, "cancelled waiter left the queue");

        release(&lock, key);
        assert!(!lock.is_locked(), "no waiter remains, lock frees");
        crate::test_complete!("cancelled_waiter_resolves_cancelled");
    }

    #[test]
    fn grant_beats_cancellation() {
        init_test("grant_beats_cancellation");
        let cx_waiter = Cx::for_testing();
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");

        let mut waiting = lock.acquire(&cx_waiter);
        assert!(poll_once(&mut waiting).is_none());

        // Release stages the grant, then cancellation arrives: removal from
        // the queue already failed, so the grant proceeds.
        release(&lock, key);
        cx_waiter.set_cancel_requested(true);
        let granted = poll_once(&mut waiting)
            .expect("resolution")
            .expect("grant wins the race");
        release(&lock, granted);
        crate::test_complete!("grant_beats_cancellation");
    }

    #[test]
    fn dropping_pending_future_removes_waiter() {
        init_test("dropping_pending_future_removes_waiter");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");

        let mut waiting = lock.acquire(&cx);
        assert!(poll_once(&mut waiting).is_none());
        assert_eq!(lock.waiters(), 1);
        drop(waiting);
        assert_eq!(lock.waiters(), 0);

        release(&lock, key);
        assert!(!lock.is_locked());
        crate::test_complete!("dropping_pending_future_removes_waiter");
    }

    #[test]
    fn dropping_granted_future_passes_baton() {
        init_test("dropping_granted_future_passes_baton");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");

        let mut first = lock.acquire(&cx);
        let mut second = lock.acquire(&cx);
        assert!(poll_once(&mut first).is_none());
        assert!(poll_once(&mut second).is_none());

        // Grant goes to `first`, which is dropped before observing it; the
        // hold must pass to `second` instead of leaking.
        release(&lock, key);
        drop(first);
        let granted = poll_once(&mut second)
            .expect("baton reaches the second waiter")
            .expect("grant");
        release(&lock, granted);
        assert!(!lock.is_locked());
        crate::test_complete!("dropping_granted_future_passes_baton");
    }

    #[test]
    fn reentrant_waker_does_not_deadlock() {
        init_test("reentrant_waker_does_not_deadlock");
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::task::Wake;

        struct ReentrantWaker {
            lock: Arc<AsyncLock>,
            attempts: AtomicUsize,
        }

        impl Wake for ReentrantWaker {
            fn wake(self: Arc<Self>) {
                // Runs on the releasing thread; the internal state lock must
                // already be dropped or this deadlocks.
                let _ = self.lock.try_acquire();
                self.attempts.fetch_add(1, Ordering::SeqCst);
            }
        }

        let cx = Cx::for_testing();
        let lock = Arc::new(AsyncLock::new());
        let key = lock.try_acquire().expect("hold");

        let reentrant = Arc::new(ReentrantWaker {
            lock: Arc::clone(&lock),
            attempts: AtomicUsize::new(0),
        });
        let waker = Waker::from(Arc::clone(&reentrant));
        let mut context = Context::from_waker(&waker);

        let mut waiting = lock.acquire(&cx);
        assert!(Pin::new(&mut waiting).poll(&mut context).is_pending());

        release(&lock, key);
        assert_eq!(reentrant.attempts.load(Ordering::SeqCst), 1);

        let granted = poll_once(&mut waiting).expect("grant").expect("key");
        release(&lock, granted);
        crate::test_complete!("reentrant_waker_does_not_deadlock");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn dropped_key_abandons_lock() {
        init_test("dropped_key_abandons_lock");
        let cx = Cx::for_testing();
        let lock = AsyncLock::new();
        let key = lock.try_acquire().expect("hold");

        let mut waiting = lock.acquire(&cx);
        assert!(poll_once(&mut waiting).is_none());

        drop(key);
        assert!(lock.is_abandoned());
        assert_eq!(
            poll_once(&mut waiting).expect("waiter fails"),
            Err(AcquireError::Abandoned)
        );
        assert_eq!(lock.try_acquire().unwrap_err(), TryAcquireError::Abandoned);
        let mut fresh = lock.acquire(&cx);
        assert_eq!(
            poll_once(&mut fresh).expect("future acquires fail"),
            Err(AcquireError::Abandoned)
        );
        crate::test_complete!("dropped_key_abandons_lock");
    }
}
