//! Feature-gated contention-instrumented lock.
//!
//! When the `lock-metrics` feature is enabled, `ContendedLock` wraps
//! [`AsyncLock`](crate::sync::AsyncLock) and tracks wait time, hold time,
//! contention count, and total acquisitions. When disabled, it's a
//! zero-cost wrapper.
//!
//! # Usage
//!
//! ```ignore
//! use synckit::sync::ContendedLock;
//!
//! let lock = ContendedLock::new("scheduler");
//! let key = lock.acquire(&cx).await?;
//! // ... critical section ...
//! lock.release(key)?;
//!
//! #[cfg(feature = "lock-metrics")]
//! {
//!     let snap = lock.snapshot();
//!     println!("acquisitions: {}", snap.acquisitions);
//! }
//! ```

/// Snapshot of lock contention metrics.
#[derive(Debug, Clone, Default)]
pub struct LockMetricsSnapshot {
    /// Human-readable name for this lock (e.g., "scheduler", "registry").
    pub name: &'static str,
    /// Total number of successful lock acquisitions.
    pub acquisitions: u64,
    /// Number of acquisitions that had to wait (the lock was held).
    pub contentions: u64,
    /// Cumulative nanoseconds spent waiting to acquire the lock.
    pub wait_ns: u64,
    /// Cumulative nanoseconds the lock was held.
    pub hold_ns: u64,
    /// Maximum single wait duration in nanoseconds.
    pub max_wait_ns: u64,
    /// Maximum single hold duration in nanoseconds.
    pub max_hold_ns: u64,
}

// ── Feature-gated implementation ──────────────────────────────────────────

#[cfg(feature = "lock-metrics")]
mod inner {
    use super::LockMetricsSnapshot;
    use crate::cx::Cx;
    use crate::sync::lock::{
        AcquireError, AsyncLock, LockKey, ReleaseError, TryAcquireError,
    };
    use parking_lot::Mutex as ParkingMutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    /// Metrics counters split into two cache lines to avoid false sharing.
    /// Acquire-path counters (acquisitions, contentions, wait_ns, max_wait_ns)
    /// are updated on grant; release-path counters (hold_ns, max_hold_ns) are
    /// updated on release. Separating them prevents cross-invalidation.
    #[derive(Debug)]
    #[repr(C)]
    struct Metrics {
        // ── Cache line 1: updated on acquire ──
        acquisitions: AtomicU64,
        contentions: AtomicU64,
        wait_ns: AtomicU64,
        max_wait_ns: AtomicU64,
        // Pad to 64 bytes (4 × 8 = 32 bytes of data, 32 bytes padding)
        _pad: [u8; 32],
        // ── Cache line 2: updated on release ──
        hold_ns: AtomicU64,
        max_hold_ns: AtomicU64,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self {
                acquisitions: AtomicU64::new(0),
                contentions: AtomicU64::new(0),
                wait_ns: AtomicU64::new(0),
                max_wait_ns: AtomicU64::new(0),
                _pad: [0; 32],
                hold_ns: AtomicU64::new(0),
                max_hold_ns: AtomicU64::new(0),
            }
        }
    }

    impl Metrics {
        fn update_max(current: &AtomicU64, value: u64) {
            let mut old = current.load(Ordering::Relaxed);
            while value > old {
                match current.compare_exchange_weak(
                    old,
                    value,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => old = actual,
                }
            }
        }

        fn record_grant(&self, wait_ns: u64, contended: bool) {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            self.wait_ns.fetch_add(wait_ns, Ordering::Relaxed);
            Self::update_max(&self.max_wait_ns, wait_ns);
            if contended {
                self.contentions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Contention-instrumented asynchronous lock.
    #[derive(Debug)]
    pub struct ContendedLock {
        inner: AsyncLock,
        metrics: Metrics,
        // Grant instant of the current hold. The lock has one holder at a
        // time, so a single slot suffices.
        acquired_at: ParkingMutex<Option<Instant>>,
        name: &'static str,
    }

    impl ContendedLock {
        /// Creates a new instrumented lock with the given name.
        #[must_use]
        pub fn new(name: &'static str) -> Self {
            Self {
                inner: AsyncLock::new(),
                metrics: Metrics::default(),
                acquired_at: ParkingMutex::new(None),
                name,
            }
        }

        /// Acquires the lock, tracking contention metrics.
        pub async fn acquire(&self, cx: &Cx) -> Result<LockKey, AcquireError> {
            let start = Instant::now();
            let (key, contended) = match self.inner.try_acquire() {
                Ok(key) => (key, false),
                Err(TryAcquireError::Abandoned) => return Err(AcquireError::Abandoned),
                Err(TryAcquireError::Held) => (self.inner.acquire(cx).await?, true),
            };
            let wait_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.metrics.record_grant(wait_ns, contended);
            *self.acquired_at.lock() = Some(Instant::now());
            Ok(key)
        }

        /// Attempts to acquire the lock without waiting.
        pub fn try_acquire(&self) -> Result<LockKey, TryAcquireError> {
            let key = self.inner.try_acquire()?;
            self.metrics.record_grant(0, false);
            *self.acquired_at.lock() = Some(Instant::now());
            Ok(key)
        }

        /// Releases the lock, recording the hold time.
        pub fn release(&self, key: LockKey) -> Result<(), ReleaseError> {
            // Take the hold instant before releasing: the moment the inner
            // release completes, the next holder may overwrite the slot.
            let acquired_at = self.acquired_at.lock().take();
            if let Err(err) = self.inner.release(key) {
                *self.acquired_at.lock() = acquired_at;
                return Err(err);
            }
            if let Some(acquired_at) = acquired_at {
                let hold_ns = u64::try_from(acquired_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
                self.metrics.hold_ns.fetch_add(hold_ns, Ordering::Relaxed);
                Metrics::update_max(&self.metrics.max_hold_ns, hold_ns);
            }
            Ok(())
        }

        /// Returns a snapshot of the current metrics.
        pub fn snapshot(&self) -> LockMetricsSnapshot {
            LockMetricsSnapshot {
                name: self.name,
                acquisitions: self.metrics.acquisitions.load(Ordering::Relaxed),
                contentions: self.metrics.contentions.load(Ordering::Relaxed),
                wait_ns: self.metrics.wait_ns.load(Ordering::Relaxed),
                hold_ns: self.metrics.hold_ns.load(Ordering::Relaxed),
                max_wait_ns: self.metrics.max_wait_ns.load(Ordering::Relaxed),
                max_hold_ns: self.metrics.max_hold_ns.load(Ordering::Relaxed),
            }
        }

        /// Resets all metrics to zero.
        pub fn reset_metrics(&self) {
            self.metrics.acquisitions.store(0, Ordering::Relaxed);
            self.metrics.contentions.store(0, Ordering::Relaxed);
            self.metrics.wait_ns.store(0, Ordering::Relaxed);
            self.metrics.hold_ns.store(0, Ordering::Relaxed);
            self.metrics.max_wait_ns.store(0, Ordering::Relaxed);
            self.metrics.max_hold_ns.store(0, Ordering::Relaxed);
        }

        /// Returns the lock name.
        #[must_use]
        pub fn name(&self) -> &'static str {
            self.name
        }

        /// Returns whether the lock is currently held.
        #[must_use]
        pub fn is_locked(&self) -> bool {
            self.inner.is_locked()
        }
    }
}

// ── No-op implementation (feature disabled) ───────────────────────────────

#[cfg(not(feature = "lock-metrics"))]
mod inner {
    use super::LockMetricsSnapshot;
    use crate::cx::Cx;
    use crate::sync::lock::{
        AcquireError, AsyncLock, LockKey, ReleaseError, TryAcquireError,
    };

    /// Zero-cost lock wrapper (metrics disabled).
    #[derive(Debug)]
    pub struct ContendedLock {
        inner: AsyncLock,
        name: &'static str,
    }

    impl ContendedLock {
        /// Creates a new lock with the given name.
        #[inline]
        #[must_use]
        pub fn new(name: &'static str) -> Self {
            Self {
                inner: AsyncLock::new(),
                name,
            }
        }

        /// Acquires the lock (no instrumentation).
        pub async fn acquire(&self, cx: &Cx) -> Result<LockKey, AcquireError> {
            self.inner.acquire(cx).await
        }

        /// Attempts to acquire the lock without waiting.
        pub fn try_acquire(&self) -> Result<LockKey, TryAcquireError> {
            self.inner.try_acquire()
        }

        /// Releases the lock.
        pub fn release(&self, key: LockKey) -> Result<(), ReleaseError> {
            self.inner.release(key)
        }

        /// Returns an empty snapshot (metrics disabled).
        pub fn snapshot(&self) -> LockMetricsSnapshot {
            LockMetricsSnapshot {
                name: self.name,
                ..Default::default()
            }
        }

        /// No-op (metrics disabled).
        pub fn reset_metrics(&self) {}

        /// Returns the lock name.
        #[must_use]
        pub fn name(&self) -> &'static str {
            self.name
        }

        /// Returns whether the lock is currently held.
        #[must_use]
        pub fn is_locked(&self) -> bool {
            self.inner.is_locked()
        }
    }
}

pub use inner::ContendedLock;
