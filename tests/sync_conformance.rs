//! Sync Primitives Conformance Suite
//!
//! Cross-thread conformance tests for the synchronization primitives,
//! driven through the blocking entry points.
//!
//! Test Coverage:
//! - SYNC-001: Lock basic acquire/release and key validation
//! - SYNC-002: Lock mutual exclusion under contention
//! - SYNC-003: RwLock reader sharing and writer exclusivity
//! - SYNC-004: Condvar notification round-trip
//! - SYNC-005: Semaphore permit limiting and capacity
//! - SYNC-006: Event gating (manual and auto reset)
//! - SYNC-007: Countdown completion
//! - SYNC-008: Timeout/grant races preserve exactly-once handoff
//! - SYNC-009: Abandonment detection (debug builds)

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use synckit::Cx;
use synckit::sync::{
    AsyncCondvar, AsyncLock, AsyncRwLock, AsyncSemaphore, AutoResetEvent, CountdownEvent,
    ManualResetEvent, SemaphoreReleaseError,
};
use synckit::test_utils::init_test_logging;

/// Spins until `probe` returns true or the timeout elapses.
fn wait_until(timeout: Duration, probe: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::yield_now();
    }
    probe()
}

/// SYNC-001: Lock Basic Acquire/Release
///
/// Verifies that a lock can be acquired and released by key, and that
/// release-and-reacquire cycles cleanly.
#[test]
fn sync_001_lock_basic_acquire_release() {
    init_test_logging();
    let lock = AsyncLock::new();

    let key = lock.try_acquire().expect("free lock grants immediately");
    assert!(lock.is_locked());
    assert!(
        lock.try_acquire().is_err(),
        "second acquire must fail while held"
    );

    lock.release(key).expect("release with the granted key");
    assert!(!lock.is_locked(), "lock is free after release");

    // Each hold gets its own key; release-and-reacquire cycles cleanly.
    let again = lock.try_acquire().expect("reacquire after release");
    lock.release(again).expect("release");
    assert!(!lock.is_locked());
}

/// SYNC-002: Lock Mutual Exclusion Under Contention
///
/// Verifies that threads contending for the lock never overlap in the
/// critical section and that every acquisition is granted exactly once.
#[test]
fn sync_002_lock_mutual_exclusion() {
    init_test_logging();
    let lock = Arc::new(AsyncLock::new());
    let in_section = Arc::new(AtomicU32::new(0));
    let grants = Arc::new(AtomicU32::new(0));
    let num_threads = 4;
    let iterations = 250;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_section = Arc::clone(&in_section);
            let grants = Arc::clone(&grants);
            thread::spawn(move || {
                let cx = Cx::for_testing();
                for _ in 0..iterations {
                    let key = lock.acquire_blocking(&cx).expect("acquire");
                    let overlapping = in_section.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(overlapping, 0, "mutual exclusion violated");
                    thread::yield_now();
                    in_section.fetch_sub(1, Ordering::SeqCst);
                    grants.fetch_add(1, Ordering::SeqCst);
                    lock.release(key).expect("release");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread should complete");
    }
    assert_eq!(
        grants.load(Ordering::SeqCst),
        num_threads * iterations,
        "every iteration was granted exactly once"
    );
    assert!(!lock.is_locked(), "lock ends free");
}

/// SYNC-002b: Lock Cancellation While Waiting
///
/// Verifies that a waiter whose context is cancelled resolves with a
/// cancellation error and leaves the queue.
#[test]
fn sync_002b_lock_cancellation() {
    init_test_logging();
    let lock = Arc::new(AsyncLock::new());
    let key = lock.try_acquire().expect("hold the lock");

    let lock_clone = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        lock_clone.acquire_blocking(&cx).is_err()
    });

    let was_cancelled = handle.join().expect("thread should complete");
    assert!(was_cancelled, "cancelled context fails the acquire");
    assert_eq!(lock.waiters(), 0, "cancelled waiter left the queue");
    lock.release(key).expect("release");
}

/// SYNC-003: RwLock Reader Sharing and Writer Exclusivity
///
/// Readers may overlap; writers exclude both readers and other writers.
#[test]
fn sync_003_rwlock_shared_and_exclusive() {
    init_test_logging();
    let rw = Arc::new(AsyncRwLock::new());

    // Deterministic sharing: three read holds coexist.
    let r1 = rw.try_read().expect("first reader");
    let r2 = rw.try_read().expect("second reader");
    let r3 = rw.try_read().expect("third reader");
    assert_eq!(rw.reader_count(), 3);
    rw.release_reader(r1).expect("release");
    rw.release_reader(r2).expect("release");
    rw.release_reader(r3).expect("release");

    // Threaded safety: a writer never overlaps readers or writers.
    let readers_in = Arc::new(AtomicU32::new(0));
    let writers_in = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();

    for _ in 0..6 {
        let rw = Arc::clone(&rw);
        let readers_in = Arc::clone(&readers_in);
        let writers_in = Arc::clone(&writers_in);
        handles.push(thread::spawn(move || {
            let cx = Cx::for_testing();
            for _ in 0..50 {
                let key = rw.read_blocking(&cx).expect("read");
                readers_in.fetch_add(1, Ordering::SeqCst);
                assert_eq!(
                    writers_in.load(Ordering::SeqCst),
                    0,
                    "reader overlapped a writer"
                );
                thread::yield_now();
                readers_in.fetch_sub(1, Ordering::SeqCst);
                rw.release_reader(key).expect("release reader");
            }
        }));
    }
    for _ in 0..2 {
        let rw = Arc::clone(&rw);
        let readers_in = Arc::clone(&readers_in);
        let writers_in = Arc::clone(&writers_in);
        handles.push(thread::spawn(move || {
            let cx = Cx::for_testing();
            for _ in 0..25 {
                let key = rw.write_blocking(&cx).expect("write");
                let other_writers = writers_in.fetch_add(1, Ordering::SeqCst);
                assert_eq!(other_writers, 0, "writers overlapped");
                assert_eq!(
                    readers_in.load(Ordering::SeqCst),
                    0,
                    "writer overlapped readers"
                );
                thread::yield_now();
                writers_in.fetch_sub(1, Ordering::SeqCst);
                rw.release_writer(key).expect("release writer");
            }
        }));
    }

    for handle in handles {
        handle.join().expect("thread should complete");
    }
    assert_eq!(rw.reader_count(), 0);
    assert!(!rw.is_write_locked());
}

/// SYNC-003b: RwLock Upgrade Round-Trip
///
/// An upgradeable reader upgrades once concurrent readers drain, writes
/// exclusively, downgrades on writer release, and can then release its
/// original hold.
#[test]
fn sync_003b_rwlock_upgrade_round_trip() {
    init_test_logging();
    let rw = AsyncRwLock::new();
    let cx = Cx::for_testing();

    let upgradeable = rw.upgradeable_read_blocking(&cx).expect("upgradeable");
    let r1 = rw.try_read().expect("reader coexists");
    let r2 = rw.try_read().expect("reader coexists");

    thread::scope(|scope| {
        let upgrader = scope.spawn(|| {
            let cx = Cx::for_testing();
            let writer = rw
                .upgrade_blocking(&cx, &upgradeable)
                .expect("upgrade once readers drain");
            assert!(rw.is_write_locked());
            assert_eq!(rw.reader_count(), 0);
            rw.release_writer(writer).expect("downgrade");
        });

        // Let the upgrade park behind the two read holds, then drain them.
        thread::sleep(Duration::from_millis(10));
        rw.release_reader(r1).expect("release");
        rw.release_reader(r2).expect("release");
        upgrader.join().expect("upgrader should complete");
    });

    assert!(
        rw.has_upgradeable_reader(),
        "downgrade restored the upgradeable hold"
    );
    rw.release_upgradeable(upgradeable)
        .expect("release after downgrade");
    assert!(!rw.has_upgradeable_reader());
}

/// SYNC-004: Condvar Notification Round-Trip
///
/// A waiter parks on the condvar releasing the lock, the notifier flips
/// the predicate under the lock and pulses, and the waiter resumes holding
/// the lock.
#[test]
fn sync_004_condvar_notification() {
    init_test_logging();
    let lock = Arc::new(AsyncLock::new());
    let cv = Arc::new(AsyncCondvar::new());
    let ready = Arc::new(AtomicU32::new(0));

    let consumer = {
        let lock = Arc::clone(&lock);
        let cv = Arc::clone(&cv);
        let ready = Arc::clone(&ready);
        thread::spawn(move || {
            let cx = Cx::for_testing();
            let mut key = lock.acquire_blocking(&cx).expect("acquire");
            while ready.load(Ordering::SeqCst) == 0 {
                key = cv.wait_blocking(&cx, &lock, key).expect("pulsed");
            }
            lock.release(key).expect("release");
        })
    };

    // Wait until the consumer has parked (and therefore released the lock).
    assert!(
        wait_until(Duration::from_secs(5), || cv.waiters() == 1),
        "consumer parks on the condvar"
    );

    let cx = Cx::for_testing();
    let key = lock.acquire_blocking(&cx).expect("notifier acquires");
    ready.store(1, Ordering::SeqCst);
    cv.pulse();
    lock.release(key).expect("release");

    consumer.join().expect("consumer should complete");
    assert_eq!(cv.waiters(), 0);
    assert!(!lock.is_locked());
}

/// SYNC-005: Semaphore Permit Limiting
///
/// Verifies that the semaphore never admits more than its permit count.
#[test]
fn sync_005_semaphore_permit_limiting() {
    init_test_logging();
    let sem = Arc::new(AsyncSemaphore::new(3));
    let current = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));
    let num_workers = 10;

    let handles: Vec<_> = (0..num_workers)
        .map(|_| {
            let sem = Arc::clone(&sem);
            let current = Arc::clone(&current);
            let max_concurrent = Arc::clone(&max_concurrent);
            thread::spawn(move || {
                let cx = Cx::for_testing();
                sem.acquire_blocking(&cx).expect("acquire");

                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                thread::yield_now();
                current.fetch_sub(1, Ordering::SeqCst);

                sem.release().expect("release");
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread should complete");
    }
    assert!(
        max_concurrent.load(Ordering::SeqCst) <= 3,
        "no more than three workers inside"
    );
    assert_eq!(sem.available_permits(), 3, "all permits returned");
}

/// SYNC-005b: Semaphore Capacity Checking
///
/// Releasing past the maximum is refused without changing state.
#[test]
fn sync_005b_semaphore_capacity() {
    init_test_logging();
    let sem = AsyncSemaphore::new(2);
    assert_eq!(
        sem.release().unwrap_err(),
        SemaphoreReleaseError::ExceedsMaxCount
    );
    assert_eq!(sem.available_permits(), 2);

    sem.try_acquire().expect("take one");
    sem.release().expect("give it back");
    assert_eq!(sem.available_permits(), 2);
}

/// SYNC-006: Event Gating
///
/// A manual-reset event releases every parked thread at once; an
/// auto-reset event hands its signal to one waiter and latches otherwise.
#[test]
fn sync_006_event_gating() {
    init_test_logging();
    let manual = Arc::new(ManualResetEvent::new(false));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let manual = Arc::clone(&manual);
            thread::spawn(move || {
                let cx = Cx::for_testing();
                manual.wait_blocking(&cx).expect("event set");
            })
        })
        .collect();

    assert!(
        wait_until(Duration::from_secs(5), || manual.waiters() == 3),
        "all three park on the event"
    );
    manual.set();
    for handle in handles {
        handle.join().expect("thread should complete");
    }
    assert!(manual.is_set());

    // Auto-reset: a parked waiter consumes the signal, so no latch remains.
    let auto = Arc::new(AutoResetEvent::new(false));
    let waiter = {
        let auto = Arc::clone(&auto);
        thread::spawn(move || {
            let cx = Cx::for_testing();
            auto.wait_blocking(&cx).expect("signal");
        })
    };
    assert!(
        wait_until(Duration::from_secs(5), || auto.waiters() == 1),
        "waiter parks"
    );
    auto.set();
    waiter.join().expect("waiter should complete");
    assert!(!auto.is_set(), "signal was consumed, not latched");

    // With nobody waiting the signal latches and the next wait consumes it.
    auto.set();
    assert!(auto.is_set());
    let cx = Cx::for_testing();
    auto.wait_blocking(&cx).expect("latched signal");
    assert!(!auto.is_set());
}

/// SYNC-007: Countdown Completion
///
/// The waiter is released only after every worker has signalled.
#[test]
fn sync_007_countdown_completion() {
    init_test_logging();
    let num_workers = 4;
    let event = Arc::new(CountdownEvent::new(num_workers));

    let handles: Vec<_> = (0..num_workers)
        .map(|_| {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                thread::yield_now();
                event.signal().expect("signal");
            })
        })
        .collect();

    let cx = Cx::for_testing();
    event.wait_blocking(&cx).expect("all workers signalled");
    assert!(event.is_set());
    assert_eq!(event.current_count(), 0);

    for handle in handles {
        handle.join().expect("worker should complete");
    }
}

/// SYNC-008: Timeout/Grant Races Preserve Exactly-Once Handoff
///
/// Threads hammer the lock with very short timeouts. Whichever way the
/// expiry races against a staged grant, the hold resolves to exactly one
/// owner or is passed onward; mutual exclusion and liveness both survive.
#[test]
fn sync_008_timeout_grant_races() {
    init_test_logging();
    let lock = Arc::new(AsyncLock::new());
    let in_section = Arc::new(AtomicU32::new(0));
    let grants = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_section = Arc::clone(&in_section);
            let grants = Arc::clone(&grants);
            thread::spawn(move || {
                let cx = Cx::for_testing();
                for _ in 0..100 {
                    match lock.acquire_blocking_timeout(&cx, Duration::from_micros(500)) {
                        Ok(key) => {
                            let overlapping = in_section.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(overlapping, 0, "mutual exclusion violated");
                            in_section.fetch_sub(1, Ordering::SeqCst);
                            grants.fetch_add(1, Ordering::SeqCst);
                            lock.release(key).expect("release");
                        }
                        Err(_) => thread::yield_now(),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread should complete");
    }
    assert!(grants.load(Ordering::SeqCst) > 0, "some acquisitions landed");
    assert!(!lock.is_locked(), "no hold leaked through the races");
    assert_eq!(lock.waiters(), 0, "no waiter leaked through the races");
}

/// SYNC-009: Abandonment Detection (debug builds)
///
/// Dropping a key without releasing marks the lock abandoned and fails
/// later acquisitions.
#[cfg(debug_assertions)]
#[test]
fn sync_009_abandonment_detection() {
    init_test_logging();
    let lock = AsyncLock::new();
    let key = lock.try_acquire().expect("acquire");
    drop(key);

    assert!(lock.is_abandoned(), "dropped key abandons the lock");
    assert!(
        lock.try_acquire().is_err(),
        "abandoned lock refuses new holds"
    );
}
