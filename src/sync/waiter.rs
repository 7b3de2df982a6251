//! Waiter queues and the grant-staging machinery shared by every primitive.
//!
//! A [`Waiter`] records one suspended acquisition attempt: a stable id plus the
//! caller's waker. Each primitive keeps one [`WaitQueue`] per role and resolves
//! waiters through a two-step handoff:
//!
//! 1. Under the primitive's internal lock, the release path detaches the waiter
//!    from its queue, mutates all primitive state for the grant, stages the
//!    grant payload in a [`GrantLedger`], and collects the waker in a
//!    [`WakeSet`].
//! 2. After the internal lock guard is dropped, [`WakeSet::wake_all`] fires the
//!    collected wakers. Caller continuations are never invoked while the
//!    internal lock is held.
//!
//! The granted future finds its payload in the ledger on its next poll. A
//! waiter id therefore lives in exactly one place at any time — some queue, the
//! ledger, or nowhere once resolved — which is what makes grant/cancel races
//! single-winner: whoever removes the id from its queue decides the outcome.

use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;

/// Waiter ids are minted from one crate-wide counter so a node can migrate
/// between queues of different primitives (condition variable transfer)
/// without colliding.
static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_waiter_id() -> u64 {
    NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed)
}

/// One suspended acquisition attempt.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) waker: Waker,
}

/// FIFO queue of waiters with O(1) enqueue/dequeue and O(n) removal by id.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::with_capacity(4),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Enqueues a new waiter at the tail and returns its freshly minted id.
    pub(crate) fn enqueue(&mut self, waker: &Waker) -> u64 {
        let id = next_waiter_id();
        self.waiters.push_back(Waiter {
            id,
            waker: waker.clone(),
        });
        id
    }

    /// Appends an existing waiter node at the tail, keeping its id.
    pub(crate) fn push_back(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    /// Updates the waker stored for `id`.
    ///
    /// Returns false when the waiter is no longer queued. The waker is only
    /// replaced when it would wake a different task; some executors hand out a
    /// fresh waker on every poll and failing to track that loses wakeups.
    pub(crate) fn register(&mut self, id: u64, waker: &Waker) -> bool {
        match self.waiters.iter_mut().find(|w| w.id == id) {
            Some(entry) => {
                if !entry.waker.will_wake(waker) {
                    entry.waker.clone_from(waker);
                }
                true
            }
            None => false,
        }
    }

    /// Removes the waiter with `id`, returning true if it was still queued.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        before != self.waiters.len()
    }

    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    /// Detaches every queued waiter, preserving FIFO order.
    pub(crate) fn take_all(&mut self) -> VecDeque<Waiter> {
        std::mem::take(&mut self.waiters)
    }
}

/// Side list of grants staged for detached waiters.
///
/// A grant is staged under the internal lock by the release path and taken by
/// the granted future on its next poll. Staging the same id twice would mean a
/// waiter was resolved twice; that is a bug in the release path, asserted in
/// debug builds.
#[derive(Debug)]
pub(crate) struct GrantLedger<T> {
    grants: SmallVec<[(u64, T); 2]>,
}

impl<T> GrantLedger<T> {
    pub(crate) fn new() -> Self {
        Self {
            grants: SmallVec::new(),
        }
    }

    pub(crate) fn stage(&mut self, id: u64, payload: T) {
        debug_assert!(
            !self.contains(id),
            "waiter {id} resolved twice: grant already staged"
        );
        self.grants.push((id, payload));
    }

    pub(crate) fn take(&mut self, id: u64) -> Option<T> {
        let index = self.grants.iter().position(|(gid, _)| *gid == id)?;
        Some(self.grants.swap_remove(index).1)
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.grants.iter().any(|(gid, _)| *gid == id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Voids every staged grant. Used when the primitive is poisoned.
    pub(crate) fn clear(&mut self) {
        self.grants.clear();
    }
}

/// Wakers collected under the internal lock, to be woken after it is dropped.
#[derive(Debug)]
#[must_use = "collected wakers must be woken after the state guard is dropped"]
pub(crate) struct WakeSet {
    wakers: SmallVec<[Waker; 4]>,
}

impl WakeSet {
    pub(crate) fn new() -> Self {
        Self {
            wakers: SmallVec::new(),
        }
    }

    pub(crate) fn push(&mut self, waker: Waker) {
        self.wakers.push(waker);
    }

    pub(crate) fn push_waiter(&mut self, waiter: Waiter) {
        self.wakers.push(waiter.waker);
    }

    /// Wakes everything collected. Call only after the state guard is gone.
    pub(crate) fn wake_all(self) {
        for waker in self.wakers {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker {
        wakes: AtomicUsize,
    }

    impl CountingWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                wakes: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.wakes.load(Ordering::SeqCst)
        }
    }

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let mut queue = WaitQueue::new();
        let waker = Waker::noop();
        let a = queue.enqueue(waker);
        let b = queue.enqueue(waker);
        let c = queue.enqueue(waker);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().map(|w| w.id), Some(a));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(b));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(c));
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_detaches_only_the_target() {
        let mut queue = WaitQueue::new();
        let waker = Waker::noop();
        let a = queue.enqueue(waker);
        let b = queue.enqueue(waker);
        assert!(queue.remove(a));
        assert!(!queue.remove(a), "second removal finds nothing");
        assert_eq!(queue.pop_front().map(|w| w.id), Some(b));
    }

    #[test]
    fn register_reports_missing_waiters() {
        let mut queue = WaitQueue::new();
        let waker = Waker::noop();
        let id = queue.enqueue(waker);
        assert!(queue.register(id, waker));
        assert!(queue.remove(id));
        assert!(!queue.register(id, waker));
    }

    #[test]
    fn waiter_ids_are_globally_unique() {
        let mut first = WaitQueue::new();
        let mut second = WaitQueue::new();
        let waker = Waker::noop();
        let a = first.enqueue(waker);
        let b = second.enqueue(waker);
        assert_ne!(a, b);
    }

    #[test]
    fn ledger_stage_and_take() {
        let mut ledger: GrantLedger<u64> = GrantLedger::new();
        ledger.stage(7, 100);
        ledger.stage(9, 200);
        assert!(ledger.contains(7));
        assert_eq!(ledger.take(9), Some(200));
        assert_eq!(ledger.take(9), None);
        assert_eq!(ledger.take(7), Some(100));
        assert!(ledger.is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "resolved twice")]
    fn ledger_rejects_double_stage() {
        let mut ledger: GrantLedger<()> = GrantLedger::new();
        ledger.stage(3, ());
        ledger.stage(3, ());
    }

    #[test]
    fn wake_set_wakes_everything_collected() {
        let counter = CountingWaker::new();
        let waker = Waker::from(Arc::clone(&counter));

        let mut queue = WaitQueue::new();
        queue.enqueue(&waker);
        queue.enqueue(&waker);

        let mut wakes = WakeSet::new();
        for waiter in queue.take_all() {
            wakes.push_waiter(waiter);
        }
        wakes.push(waker);

        wakes.wake_all();
        assert_eq!(counter.count(), 3);
    }
}
