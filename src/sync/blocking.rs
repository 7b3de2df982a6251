//! Thread-blocking bridge for the synchronization futures.
//!
//! The `*_blocking` entry points on the primitives drive their futures on
//! the calling thread: a short yield phase for near-immediate grants, then
//! park/unpark. The deadline variant polls one final time before declaring
//! a timeout, so a grant that races the expiry is honoured rather than
//! dropped.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::Instant;

/// Wakes a parked thread. `notified` latches wake-ups that land between a
/// poll and the park, so the parking loop never misses one.
struct ThreadUnparker {
    thread: Thread,
    notified: AtomicBool,
}

impl ThreadUnparker {
    fn for_current_thread() -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        })
    }

    fn take_notification(&self) -> bool {
        self.notified.swap(false, Ordering::Acquire)
    }
}

impl Wake for ThreadUnparker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Polls this many times with a yield between attempts before parking.
const YIELD_POLLS: usize = 16;

/// Blocks the calling thread until `future` resolves.
pub(crate) fn block_on_future<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let unparker = ThreadUnparker::for_current_thread();
    let waker = Waker::from(Arc::clone(&unparker));
    let mut context = Context::from_waker(&waker);

    let mut polls = 0;
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
            return output;
        }
        if polls < YIELD_POLLS {
            polls += 1;
            thread::yield_now();
            continue;
        }
        while !unparker.take_notification() {
            thread::park();
        }
    }
}

/// Blocks the calling thread until `future` resolves or `deadline` passes,
/// in which case `timeout_error` is returned. Dropping the timed-out future
/// re-queues or hands on whatever it held.
pub(crate) fn block_on_future_deadline<F, T, E>(
    future: F,
    deadline: Instant,
    timeout_error: E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let mut future = pin!(future);
    let unparker = ThreadUnparker::for_current_thread();
    let waker = Waker::from(Arc::clone(&unparker));
    let mut context = Context::from_waker(&waker);

    loop {
        // Poll before the deadline check so a grant racing the expiry wins.
        if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
            return output;
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(timeout_error);
        }
        if !unparker.take_notification() {
            thread::park_timeout(deadline - now);
        }
    }
}
