//! Capability-key plumbing: instance identity, generations, abandonment.
//!
//! Every keyed primitive (lock, reader-writer lock) hands out opaque keys that
//! prove "you currently hold this lock". A key pairs the owning instance's id
//! with the generation minted at grant time; release validates both, so a key
//! held over from a previous holder era — or minted by a different instance —
//! is rejected instead of silently unlocking someone else's hold.
//!
//! In debug builds a key also carries a disposal tracker. Dropping a key that
//! was never passed back through release marks the owning primitive abandoned:
//! the hold is provably lost, every queued waiter would deadlock, so the
//! primitive latches into a failing state and reports loudly instead. Release
//! builds compile the tracker out; a dropped key then leaks its hold.

use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(debug_assertions)]
use std::sync::{Arc, Weak};

/// Instance ids distinguish primitives so a key cannot unlock a foreign lock.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Mints the monotonically increasing generations for one primitive instance.
///
/// Generation 0 is reserved to mean "unheld"; the source never returns it.
#[derive(Debug)]
pub(crate) struct GenerationSource(u64);

impl GenerationSource {
    pub(crate) fn new() -> Self {
        Self(1)
    }

    pub(crate) fn mint(&mut self) -> u64 {
        let generation = self.0;
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = 1;
        }
        generation
    }
}

/// Implemented by a primitive's shared state to receive abandonment reports.
#[cfg(debug_assertions)]
pub(crate) trait AbandonTarget: Send + Sync {
    fn on_key_abandoned(&self);
}

/// Debug-build disposal tracker carried inside every key.
///
/// Armed on grant, disarmed by a successful release. Dropping while armed
/// reports abandonment to the owning primitive.
#[cfg(debug_assertions)]
#[derive(Debug)]
pub(crate) struct KeyTracker {
    target: Option<Weak<dyn AbandonTarget>>,
}

#[cfg(not(debug_assertions))]
#[derive(Debug)]
pub(crate) struct KeyTracker;

#[cfg(debug_assertions)]
impl KeyTracker {
    pub(crate) fn armed<T: AbandonTarget + 'static>(target: &Arc<T>) -> Self {
        let target: Arc<dyn AbandonTarget> = Arc::clone(target) as Arc<dyn AbandonTarget>;
        Self {
            target: Some(Arc::downgrade(&target)),
        }
    }

    pub(crate) fn disarmed() -> Self {
        Self { target: None }
    }

    pub(crate) fn disarm(&mut self) {
        self.target = None;
    }
}

#[cfg(not(debug_assertions))]
impl KeyTracker {
    pub(crate) fn armed<T>(_target: &std::sync::Arc<T>) -> Self {
        Self
    }

    pub(crate) fn disarmed() -> Self {
        Self
    }

    pub(crate) fn disarm(&mut self) {}
}

#[cfg(debug_assertions)]
impl Drop for KeyTracker {
    fn drop(&mut self) {
        if let Some(weak) = self.target.take() {
            if let Some(target) = weak.upgrade() {
                target.on_key_abandoned();
            }
        }
    }
}

/// The shared core of every key type: identity, generation, tracker.
#[derive(Debug)]
pub(crate) struct RawKey {
    instance: u64,
    generation: u64,
    tracker: KeyTracker,
}

impl RawKey {
    pub(crate) fn new(instance: u64, generation: u64, tracker: KeyTracker) -> Self {
        Self {
            instance,
            generation,
            tracker,
        }
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// True when this key was minted by `instance` for generation `generation`.
    pub(crate) fn matches(&self, instance: u64, generation: u64) -> bool {
        self.instance == instance && self.generation == generation
    }

    /// Disarms the abandonment tracker; called on successful release.
    pub(crate) fn disarm(&mut self) {
        self.tracker.disarm();
    }
}

/// Key equality is identity: same instance and generation. The disposal
/// tracker carries no identity and is ignored.
impl PartialEq for RawKey {
    fn eq(&self, other: &Self) -> bool {
        self.instance == other.instance && self.generation == other.generation
    }
}

impl Eq for RawKey {}
