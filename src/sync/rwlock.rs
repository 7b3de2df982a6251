//! Keyed reader-writer lock with upgradeable readers.
//!
//! [`AsyncRwLock`] admits any number of plain readers plus at most one
//! upgradeable reader concurrently, or a single exclusive writer. Each
//! role hands out its own key type ([`ReaderKey`], [`WriterKey`],
//! [`UpgradeableReaderKey`]); the keys are not interchangeable and each must
//! be passed back through the matching release call.
//!
//! The upgradeable reader can promote its hold to a writer in place via
//! [`upgrade`](AsyncRwLock::upgrade), without releasing and re-acquiring;
//! releasing the upgraded writer downgrades back to the original read hold,
//! and the retained [`UpgradeableReaderKey`] becomes valid again.
//!
//! # Contention Strategy
//!
//! Cross-role ordering is governed by the [`ContentionStrategy`] chosen at
//! construction. Within one role, grants are strictly FIFO.
//!
//! | Strategy                       | Effect                                               |
//! |--------------------------------|------------------------------------------------------|
//! | `None` (default)               | Queued writer intent blocks new readers              |
//! | `PrioritizeWriters`            | Writer handoff also skips queued readers             |
//! | `PrioritizeReaders`            | New readers are admitted past queued writer intent   |
//! | `PrioritizeUpgradeableReaders` | New upgradeable readers pass queued writer intent    |
//!
//! Anti-starvation: when a writer releases, all queued readers (plus the head
//! upgradeable reader) are admitted as one batch before the next writer,
//! unless another writer is queued and the strategy prioritizes writers.
//!
//! # Example
//!
//! ```ignore
//! use synckit::sync::AsyncRwLock;
//!
//! let lock = AsyncRwLock::new();
//! let upgradeable = lock.upgradeable_read(&cx).await?;
//! // ... decide a write is needed ...
//! let writer = lock.upgrade(&cx, &upgradeable).await?;
//! lock.release_writer(writer)?;   // downgrades back to the read hold
//! lock.release_upgradeable(upgradeable)?;
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
use crate::sync::waiter::{next_waiter_id, GrantLedger, WaitQueue, Waiter, WakeSet};

/// Cross-role tie-break policy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentionStrategy {
    /// No prioritization: queued writer intent blocks new readers and new
    /// upgradeable readers, in both directions only the documented
    /// anti-starvation rules apply.
    #[default]
    None,
    /// A releasing writer hands off to the next queued writer even when
    /// readers are queued.
    PrioritizeWriters,
    /// New plain readers are admitted even while writers are queued.
    PrioritizeReaders,
    /// New upgradeable readers are admitted even while writers are queued.
    PrioritizeUpgradeableReaders,
}

/// Error returned when an async acquire fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwAcquireError {
    /// Cancelled while waiting.
    Cancelled,
    /// The lock was abandoned: a key was dropped without being released.
    Abandoned,
    /// Admitting this reader would exceed the supported reader count.
    ReaderOverflow,
}

impl std::fmt::Display for RwAcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquire cancelled"),
            Self::Abandoned => write!(f, "lock abandoned"),
            Self::ReaderOverflow => write!(f, "reader count limit reached"),
        }
    }
}

impl std::error::Error for RwAcquireError {}

/// Error returned when trying to acquire without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRwAcquireError {
    /// The requested role is not grantable right now.
    Unavailable,
    /// The lock was abandoned.
    Abandoned,
    /// Admitting this reader would exceed the supported reader count.
    ReaderOverflow,
}

impl std::fmt::Display for TryRwAcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "lock role is unavailable"),
            Self::Abandoned => write!(f, "lock abandoned"),
            Self::ReaderOverflow => write!(f, "reader count limit reached"),
        }
    }
}

impl std::error::Error for TryRwAcquireError {}

/// Error returned when releasing a reader or writer key fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwReleaseError {
    /// The key does not match the lock's current holder for its role.
    ///
    /// The offending key is consumed by the failed call; in debug builds its
    /// tracker then reports the lost hold on whichever lock minted it.
    InvalidKey,
    /// The lock was abandoned.
    Abandoned,
}

impl std::fmt::Display for RwReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "key does not match the current holder"),
            Self::Abandoned => write!(f, "lock abandoned"),
        }
    }
}

impl std::error::Error for RwReleaseError {}

/// Error returned when releasing an upgradeable-reader key fails.
#[derive(Debug)]
pub enum ReleaseUpgradeableError {
    /// The key does not match the lock's current upgradeable holder.
    InvalidKey,
    /// An upgrade is in flight on this key: the writer hold must be released
    /// (downgrading) before the read hold can be. The key is handed back so
    /// the caller can finish that protocol.
    UpgradeInProgress(UpgradeableReaderKey),
    /// The lock was abandoned.
    Abandoned,
}

impl std::fmt::Display for ReleaseUpgradeableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "key does not match the current holder"),
            Self::UpgradeInProgress(_) => write!(f, "upgrade in flight on this key"),
            Self::Abandoned => write!(f, "lock abandoned"),
        }
    }
}

impl std::error::Error for ReleaseUpgradeableError {}

/// Error returned when an upgrade fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeError {
    /// The key is not the lock's current upgradeable-reader key.
    InvalidKey,
    /// An upgrade is already in flight on this lock.
    UpgradeInProgress,
    /// Cancelled while waiting for concurrent readers to release.
    Cancelled,
    /// The lock was abandoned.
    Abandoned,
}

impl std::fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "key is not the current upgradeable reader"),
            Self::UpgradeInProgress => write!(f, "an upgrade is already in flight"),
            Self::Cancelled => write!(f, "upgrade cancelled"),
            Self::Abandoned => write!(f, "lock abandoned"),
        }
    }
}

impl std::error::Error for UpgradeError {}

/// Role bits, tracking holds and queued writer intent together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct LockMask(u8);

impl LockMask {
    const READER: u8 = 1 << 0;
    const WRITER: u8 = 1 << 1;
    const UPGRADEABLE: u8 = 1 << 2;

    fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterType {
    None,
    Writer,
    UpgradedFromReader,
}

/// Reader headroom limit; one slot is reserved for an in-flight upgrade.
const MAX_READERS: u64 = (u32::MAX - 1) as u64;

/// Fair asynchronous reader-writer lock with an upgradeable-reader role.
#[derive(Debug)]
pub struct AsyncRwLock {
    shared: Arc<RwShared>,
}

#[derive(Debug)]
struct RwShared {
    id: u64,
    state: ParkingMutex<RwState>,
}

#[derive(Debug)]
struct RwState {
    mask: LockMask,
    writer_type: WriterType,
    /// Generation of the current holders: the reader era (shared by plain
    /// readers and the upgradeable reader) or the exclusive writer. 0 = free.
    current_generation: u64,
    /// Pre-upgrade era generation, restored when the upgraded writer
    /// downgrades.
    previous_generation: u64,
    generations: GenerationSource,
    /// Read holds, including the upgradeable reader's contribution.
    reader_hold_count: u32,
    /// Whether the upgradeable holder currently counts as a reader. False
    /// while its hold is promoted (or promoting) to a writer.
    upgradeable_holds_read: bool,
    reader_queue: WaitQueue,
    writer_queue: WaitQueue,
    upgradeable_queue: WaitQueue,
    /// The single in-flight in-place upgrade, granted ahead of the writer
    /// queue by the last concurrent reader's release.
    upgrade_waiter: Option<Waiter>,
    granted_readers: GrantLedger<u64>,
    granted_writers: GrantLedger<u64>,
    granted_upgradeable: GrantLedger<u64>,
    granted_upgrade: GrantLedger<u64>,
    strategy: ContentionStrategy,
    poisoned: bool,
}

impl RwState {
    fn new(strategy: ContentionStrategy) -> Self {
        Self {
            mask: LockMask::default(),
            writer_type: WriterType::None,
            current_generation: 0,
            previous_generation: 0,
            generations: GenerationSource::new(),
            reader_hold_count: 0,
            upgradeable_holds_read: false,
            reader_queue: WaitQueue::new(),
            writer_queue: WaitQueue::new(),
            upgradeable_queue: WaitQueue::new(),
            upgrade_waiter: None,
            granted_readers: GrantLedger::new(),
            granted_writers: GrantLedger::new(),
            granted_upgradeable: GrantLedger::new(),
            granted_upgrade: GrantLedger::new(),
            strategy,
            poisoned: false,
        }
    }

    fn reader_grantable(&self) -> bool {
        self.writer_type == WriterType::None
            && self.upgrade_waiter.is_none()
            && (!self.mask.contains(LockMask::WRITER)
                || self.strategy == ContentionStrategy::PrioritizeReaders)
    }

    fn upgradeable_grantable(&self) -> bool {
        self.writer_type == WriterType::None
            && !self.mask.contains(LockMask::UPGRADEABLE)
            && self.upgrade_waiter.is_none()
            && (!self.mask.contains(LockMask::WRITER)
                || self.strategy == ContentionStrategy::PrioritizeUpgradeableReaders)
    }

    fn writer_grantable(&self) -> bool {
        self.writer_type == WriterType::None
            && self.reader_hold_count == 0
            && !self.mask.contains(LockMask::UPGRADEABLE)
            && self.upgrade_waiter.is_none()
    }

    fn reader_capacity_left(&self) -> bool {
        u64::from(self.reader_hold_count)
            + (self.reader_queue.len() as u64)
            + (self.upgradeable_queue.len() as u64)
            < MAX_READERS
    }

    fn sync_reader_bit(&mut self) {
        let plain = self.reader_hold_count - u32::from(self.upgradeable_holds_read);
        if plain > 0 {
            self.mask.set(LockMask::READER);
        } else {
            self.mask.clear(LockMask::READER);
        }
    }

    /// Admits one plain reader into the current era, starting a fresh era if
    /// nothing is held. Returns the era generation.
    fn grant_reader(&mut self) -> u64 {
        if self.reader_hold_count == 0 {
            debug_assert!(!self.mask.contains(LockMask::UPGRADEABLE));
            self.current_generation = self.generations.mint();
        }
        self.reader_hold_count += 1;
        self.mask.set(LockMask::READER);
        self.current_generation
    }

    /// Admits an upgradeable reader into the current era (or starts one).
    fn grant_upgradeable(&mut self) -> u64 {
        debug_assert!(!self.mask.contains(LockMask::UPGRADEABLE));
        if self.reader_hold_count == 0 {
            self.current_generation = self.generations.mint();
        }
        self.reader_hold_count += 1;
        self.upgradeable_holds_read = true;
        self.mask.set(LockMask::UPGRADEABLE);
        self.current_generation
    }

    fn admit_queued_readers(&mut self, wakes: &mut WakeSet) {
        while let Some(waiter) = self.reader_queue.pop_front() {
            let generation = self.grant_reader();
            self.granted_readers.stage(waiter.id, generation);
            wakes.push(waiter.waker);
        }
    }

    fn admit_head_upgradeable(&mut self, wakes: &mut WakeSet) {
        if let Some(waiter) = self.upgradeable_queue.pop_front() {
            let generation = self.grant_upgradeable();
            self.granted_upgradeable.stage(waiter.id, generation);
            wakes.push(waiter.waker);
        }
    }

    /// Re-evaluates reader and upgradeable admission after queued writer
    /// intent cleared or a pending upgrade was reverted.
    fn readmit_after_block_cleared(&mut self, wakes: &mut WakeSet) {
        if !self.reader_queue.is_empty() && self.reader_grantable() {
            self.admit_queued_readers(wakes);
        }
        if !self.upgradeable_queue.is_empty() && self.upgradeable_grantable() {
            self.admit_head_upgradeable(wakes);
        }
    }

    /// A cancelled queued writer clears the intent bit when it was the last
    /// writer in the system, then re-evaluates blocked readers.
    fn writer_intent_may_clear(&mut self, wakes: &mut WakeSet) {
        if self.writer_queue.is_empty() && self.writer_type == WriterType::None {
            self.mask.clear(LockMask::WRITER);
            self.readmit_after_block_cleared(wakes);
        }
    }

    /// Runs when the read-side hold count reaches zero: grants a pending
    /// upgrade, else the next writer, else a queued upgradeable reader, else
    /// frees the lock.
    fn era_end(&mut self, wakes: &mut WakeSet) {
        debug_assert_eq!(self.reader_hold_count, 0);
        if let Some(waiter) = self.upgrade_waiter.take() {
            // The pending upgrade preempts the ordinary writer queue.
            self.previous_generation = self.current_generation;
            self.current_generation = self.generations.mint();
            self.writer_type = WriterType::UpgradedFromReader;
            self.mask.set(LockMask::WRITER);
            self.granted_upgrade.stage(waiter.id, self.current_generation);
            wakes.push(waiter.waker);
            return;
        }
        if self.mask.contains(LockMask::UPGRADEABLE) {
            // The upgradeable holder remains; the era continues.
            return;
        }
        if let Some(waiter) = self.writer_queue.pop_front() {
            self.current_generation = self.generations.mint();
            self.writer_type = WriterType::Writer;
            self.granted_writers.stage(waiter.id, self.current_generation);
            wakes.push(waiter.waker);
            return;
        }
        debug_assert!(!self.mask.contains(LockMask::WRITER));
        if !self.upgradeable_queue.is_empty() {
            // Queued behind the released upgradeable slot; starts a new era.
            self.admit_head_upgradeable(wakes);
            return;
        }
        self.current_generation = 0;
    }

    /// Handoff ladder for a releasing (non-upgraded) writer.
    fn release_writer_ladder(&mut self, wakes: &mut WakeSet) {
        debug_assert_eq!(self.writer_type, WriterType::None);
        debug_assert!(!self.mask.contains(LockMask::UPGRADEABLE));
        if self.writer_queue.is_empty() {
            self.mask.clear(LockMask::WRITER);
        }
        let writer_priority = !self.writer_queue.is_empty()
            && self.strategy == ContentionStrategy::PrioritizeWriters;
        let admit_readers = !self.reader_queue.is_empty() && !writer_priority;
        let admit_upgradeable = !self.upgradeable_queue.is_empty() && !writer_priority;
        if admit_readers || admit_upgradeable {
            // Batch grant: all queued readers plus one upgradeable reader
            // share the fresh era.
            if admit_upgradeable {
                self.admit_head_upgradeable(wakes);
            }
            if admit_readers {
                self.admit_queued_readers(wakes);
            }
            return;
        }
        if let Some(waiter) = self.writer_queue.pop_front() {
            self.current_generation = self.generations.mint();
            self.writer_type = WriterType::Writer;
            self.granted_writers.stage(waiter.id, self.current_generation);
            wakes.push(waiter.waker);
            return;
        }
        self.current_generation = 0;
    }

    /// Reverts an upgraded writer back to the pre-upgrade read hold.
    fn downgrade(&mut self, wakes: &mut WakeSet) {
        debug_assert!(self.mask.contains(LockMask::UPGRADEABLE));
        self.writer_type = WriterType::None;
        self.current_generation = self.previous_generation;
        self.previous_generation = 0;
        self.reader_hold_count += 1;
        self.upgradeable_holds_read = true;
        if self.writer_queue.is_empty() {
            self.mask.clear(LockMask::WRITER);
        }
        // Readers that queued during the writer interval rejoin the restored
        // era regardless of strategy; no writer can run while it lasts.
        self.admit_queued_readers(wakes);
        self.sync_reader_bit();
    }

    /// Reverses the bookkeeping of a cancelled pending upgrade.
    fn revert_pending_upgrade(&mut self, wakes: &mut WakeSet) {
        debug_assert!(self.upgrade_waiter.is_none());
        self.reader_hold_count += 1;
        self.upgradeable_holds_read = true;
        self.sync_reader_bit();
        self.readmit_after_block_cleared(wakes);
    }

    fn poison(&mut self, wakes: &mut WakeSet) {
        self.poisoned = true;
        for waiter in self.reader_queue.take_all() {
            wakes.push_waiter(waiter);
        }
        for waiter in self.writer_queue.take_all() {
            wakes.push_waiter(waiter);
        }
        for waiter in self.upgradeable_queue.take_all() {
            wakes.push_waiter(waiter);
        }
        if let Some(waiter) = self.upgrade_waiter.take() {
            wakes.push_waiter(waiter);
        }
        self.granted_readers.clear();
        self.granted_writers.clear();
        self.granted_upgradeable.clear();
        self.granted_upgrade.clear();
    }
}

impl AsyncRwLock {
    /// Creates a new lock with no cross-role prioritization.
    #[must_use]
    pub fn new() -> Self {
        Self::with_strategy(ContentionStrategy::None)
    }

    /// Creates a new lock with the given contention strategy.
    #[must_use]
    pub fn with_strategy(strategy: ContentionStrategy) -> Self {
        Self {
            shared: Arc::new(RwShared {
                id: next_instance_id(),
                state: ParkingMutex::new(RwState::new(strategy)),
            }),
        }
    }

    /// Returns the configured contention strategy.
    #[must_use]
    pub fn strategy(&self) -> ContentionStrategy {
        self.shared.state.lock().strategy
    }

    /// Returns the number of read holds, counting the upgradeable reader.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.shared.state.lock().reader_hold_count
    }

    /// Returns true if a writer (upgraded or not) holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.shared.state.lock().writer_type != WriterType::None
    }

    /// Returns true if an upgradeable reader holds the lock (including while
    /// upgraded).
    #[must_use]
    pub fn has_upgradeable_reader(&self) -> bool {
        self.shared.state.lock().mask.contains(LockMask::UPGRADEABLE)
    }

    /// Returns true if the lock has been abandoned.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.shared.state.lock().poisoned
    }

    /// Returns the queued waiter counts as (readers, writers, upgradeable).
    #[must_use]
    pub fn queued_waiters(&self) -> (usize, usize, usize) {
        let state = self.shared.state.lock();
        (
            state.reader_queue.len(),
            state.writer_queue.len(),
            state.upgradeable_queue.len(),
        )
    }

    /// Acquires a plain read hold asynchronously.
    pub fn read<'a, 'b>(&'a self, cx: &'b Cx) -> ReadFuture<'a, 'b> {
        ReadFuture {
            lock: self,
            cx,
            waiter_id: None,
        }
    }

    /// Tries to acquire a plain read hold without waiting.
    pub fn try_read(&self) -> Result<ReaderKey, TryRwAcquireError> {
        let mut state = self.shared.state.lock();
        if state.poisoned {
            return Err(TryRwAcquireError::Abandoned);
        }
        if !state.reader_capacity_left() {
            return Err(TryRwAcquireError::ReaderOverflow);
        }
        if !state.reader_grantable() || !state.reader_queue.is_empty() {
            return Err(TryRwAcquireError::Unavailable);
        }
        let generation = state.grant_reader();
        drop(state);
        Ok(ReaderKey::grant(&self.shared, generation))
    }

    /// Acquires the exclusive writer hold asynchronously.
    ///
    /// Queued writers mark intent immediately: new readers (and upgradeable
    /// readers) are blocked while any writer waits, unless the strategy
    /// admits them.
    pub fn write<'a, 'b>(&'a self, cx: &'b Cx) -> WriteFuture<'a, 'b> {
        WriteFuture {
            lock: self,
            cx,
            waiter_id: None,
        }
    }

    /// Tries to acquire the writer hold without waiting.
    pub fn try_write(&self) -> Result<WriterKey, TryRwAcquireError> {
        let mut state = self.shared.state.lock();
        if state.poisoned {
            return Err(TryRwAcquireError::Abandoned);
        }
        if !state.writer_grantable() || !state.writer_queue.is_empty() {
            return Err(TryRwAcquireError::Unavailable);
        }
        state.current_generation = state.generations.mint();
        state.writer_type = WriterType::Writer;
        state.mask.set(LockMask::WRITER);
        let generation = state.current_generation;
        drop(state);
        Ok(WriterKey::grant(&self.shared, generation))
    }

    /// Acquires the upgradeable read hold asynchronously.
    pub fn upgradeable_read<'a, 'b>(&'a self, cx: &'b Cx) -> UpgradeableReadFuture<'a, 'b> {
        UpgradeableReadFuture {
            lock: self,
            cx,
            waiter_id: None,
        }
    }

    /// Tries to acquire the upgradeable read hold without waiting.
    pub fn try_upgradeable_read(&self) -> Result<UpgradeableReaderKey, TryRwAcquireError> {
        let mut state = self.shared.state.lock();
        if state.poisoned {
            return Err(TryRwAcquireError::Abandoned);
        }
        if !state.reader_capacity_left() {
            return Err(TryRwAcquireError::ReaderOverflow);
        }
        if !state.upgradeable_grantable() || !state.upgradeable_queue.is_empty() {
            return Err(TryRwAcquireError::Unavailable);
        }
        let generation = state.grant_upgradeable();
        drop(state);
        Ok(UpgradeableReaderKey::grant(&self.shared, generation))
    }

    /// Promotes the upgradeable read hold to a writer hold in place.
    ///
    /// The key is only borrowed: the caller keeps it, inert, while the
    /// upgrade is in flight, and it becomes valid again once the returned
    /// [`WriterKey`] is released (which downgrades back to the read hold).
    /// If concurrent plain readers hold the lock the upgrade waits for the
    /// last of them; it is then granted ahead of the ordinary writer queue.
    pub fn upgrade<'a, 'b>(&'a self, cx: &'b Cx, key: &UpgradeableReaderKey) -> UpgradeFuture<'a, 'b> {
        UpgradeFuture {
            lock: self,
            cx,
            key_instance: key.raw.instance(),
            key_generation: key.raw.generation(),
            waiter_id: None,
            done: false,
        }
    }

    /// Releases a plain read hold.
    pub fn release_reader(&self, key: ReaderKey) -> Result<(), RwReleaseError> {
        let mut key = key;
        let wakes = {
            let mut state = self.shared.state.lock();
            if state.poisoned {
                key.raw.disarm();
                return Err(RwReleaseError::Abandoned);
            }
            let plain_readers = state.reader_hold_count - u32::from(state.upgradeable_holds_read);
            if plain_readers == 0 || !key.raw.matches(self.shared.id, state.current_generation) {
                return Err(RwReleaseError::InvalidKey);
            }
            key.raw.disarm();
            state.reader_hold_count -= 1;
            state.sync_reader_bit();
            let mut wakes = WakeSet::new();
            if state.reader_hold_count == 0 {
                state.era_end(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
        Ok(())
    }

    /// Releases the writer hold.
    ///
    /// For a writer that was upgraded from an upgradeable reader, this
    /// downgrades: the pre-upgrade read hold (and its generation) is
    /// restored and readers queued during the writer interval are admitted.
    pub fn release_writer(&self, key: WriterKey) -> Result<(), RwReleaseError> {
        let mut key = key;
        let wakes = {
            let mut state = self.shared.state.lock();
            if state.poisoned {
                key.raw.disarm();
                return Err(RwReleaseError::Abandoned);
            }
            if !key.raw.matches(self.shared.id, state.current_generation) {
                return Err(RwReleaseError::InvalidKey);
            }
            let mut wakes = WakeSet::new();
            match state.writer_type {
                WriterType::None => return Err(RwReleaseError::InvalidKey),
                WriterType::Writer => {
                    key.raw.disarm();
                    state.writer_type = WriterType::None;
                    state.release_writer_ladder(&mut wakes);
                }
                WriterType::UpgradedFromReader => {
                    key.raw.disarm();
                    state.downgrade(&mut wakes);
                }
            }
            wakes
        };
        wakes.wake_all();
        Ok(())
    }

    /// Releases the upgradeable read hold.
    ///
    /// While an upgrade is pending or granted on this key the release is
    /// refused and the key is handed back; release the writer hold first.
    pub fn release_upgradeable(
        &self,
        key: UpgradeableReaderKey,
    ) -> Result<(), ReleaseUpgradeableError> {
        let mut key = key;
        let wakes = {
            let mut state = self.shared.state.lock();
            if state.poisoned {
                key.raw.disarm();
                return Err(ReleaseUpgradeableError::Abandoned);
            }
            let in_flight = (state.upgrade_waiter.is_some()
                && key.raw.matches(self.shared.id, state.current_generation))
                || (state.writer_type == WriterType::UpgradedFromReader
                    && key.raw.matches(self.shared.id, state.previous_generation));
            if in_flight {
                // The hold still exists behind the upgrade; the caller keeps
                // the key and releases after the downgrade.
                return Err(ReleaseUpgradeableError::UpgradeInProgress(key));
            }
            if !state.mask.contains(LockMask::UPGRADEABLE)
                || !state.upgradeable_holds_read
                || !key.raw.matches(self.shared.id, state.current_generation)
            {
                return Err(ReleaseUpgradeableError::InvalidKey);
            }
            key.raw.disarm();
            state.mask.clear(LockMask::UPGRADEABLE);
            state.upgradeable_holds_read = false;
            state.reader_hold_count -= 1;
            state.sync_reader_bit();
            let mut wakes = WakeSet::new();
            if state.reader_hold_count == 0 {
                state.era_end(&mut wakes);
            } else if !state.upgradeable_queue.is_empty() && state.upgradeable_grantable() {
                // The slot freed mid-era; the head upgradeable waiter joins.
                state.admit_head_upgradeable(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
        Ok(())
    }

    /// Acquires a plain read hold, blocking the calling thread.
    pub fn read_blocking(&self, cx: &Cx) -> Result<ReaderKey, RwAcquireError> {
        crate::sync::blocking::block_on_future(self.read(cx))
    }

    /// Acquires the writer hold, blocking the calling thread.
    pub fn write_blocking(&self, cx: &Cx) -> Result<WriterKey, RwAcquireError> {
        crate::sync::blocking::block_on_future(self.write(cx))
    }

    /// Acquires the upgradeable read hold, blocking the calling thread.
    pub fn upgradeable_read_blocking(&self, cx: &Cx) -> Result<UpgradeableReaderKey, RwAcquireError> {
        crate::sync::blocking::block_on_future(self.upgradeable_read(cx))
    }

    /// Like [`read_blocking`](Self::read_blocking) with a timeout; expiry
    /// behaves as implicit cancellation.
    pub fn read_blocking_timeout(
        &self,
        cx: &Cx,
        timeout: std::time::Duration,
    ) -> Result<ReaderKey, RwAcquireError> {
        crate::sync::blocking::block_on_future_deadline(
            self.read(cx),
            std::time::Instant::now() + timeout,
            RwAcquireError::Cancelled,
        )
    }

    /// Like [`write_blocking`](Self::write_blocking) with a timeout.
    pub fn write_blocking_timeout(
        &self,
        cx: &Cx,
        timeout: std::time::Duration,
    ) -> Result<WriterKey, RwAcquireError> {
        crate::sync::blocking::block_on_future_deadline(
            self.write(cx),
            std::time::Instant::now() + timeout,
            RwAcquireError::Cancelled,
        )
    }

    /// Like [`upgradeable_read_blocking`](Self::upgradeable_read_blocking)
    /// with a timeout.
    pub fn upgradeable_read_blocking_timeout(
        &self,
        cx: &Cx,
        timeout: std::time::Duration,
    ) -> Result<UpgradeableReaderKey, RwAcquireError> {
        crate::sync::blocking::block_on_future_deadline(
            self.upgradeable_read(cx),
            std::time::Instant::now() + timeout,
            RwAcquireError::Cancelled,
        )
    }

    /// Upgrades to the writer hold, blocking the calling thread.
    pub fn upgrade_blocking(
        &self,
        cx: &Cx,
        key: &UpgradeableReaderKey,
    ) -> Result<WriterKey, UpgradeError> {
        crate::sync::blocking::block_on_future(self.upgrade(cx, key))
    }

    /// Like [`upgrade_blocking`](Self::upgrade_blocking) with a timeout.
    /// Expiry cancels the pending upgrade and restores the read hold.
    pub fn upgrade_blocking_timeout(
        &self,
        cx: &Cx,
        key: &UpgradeableReaderKey,
        timeout: std::time::Duration,
    ) -> Result<WriterKey, UpgradeError> {
        crate::sync::blocking::block_on_future_deadline(
            self.upgrade(cx, key),
            std::time::Instant::now() + timeout,
            UpgradeError::Cancelled,
        )
    }
}

impl Default for AsyncRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(debug_assertions)]
impl AbandonTarget for RwShared {
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
            "reader-writer lock key dropped without release; lock is abandoned"
        );
        wakes.wake_all();
    }
}

/// Capability proving a plain read hold of an [`AsyncRwLock`].
#[must_use = "a key dropped without release abandons the lock"]
#[derive(Debug, PartialEq, Eq)]
pub struct ReaderKey {
    pub(crate) raw: RawKey,
}

impl ReaderKey {
    fn grant(shared: &Arc<RwShared>, generation: u64) -> Self {
        Self {
            raw: RawKey::new(shared.id, generation, KeyTracker::armed(shared)),
        }
    }
}

/// Capability proving the exclusive writer hold of an [`AsyncRwLock`].
#[must_use = "a key dropped without release abandons the lock"]
#[derive(Debug, PartialEq, Eq)]
pub struct WriterKey {
    pub(crate) raw: RawKey,
}

impl WriterKey {
    fn grant(shared: &Arc<RwShared>, generation: u64) -> Self {
        Self {
            raw: RawKey::new(shared.id, generation, KeyTracker::armed(shared)),
        }
    }
}

/// Capability proving the upgradeable read hold of an [`AsyncRwLock`].
#[must_use = "a key dropped without release abandons the lock"]
#[derive(Debug)]
pub struct UpgradeableReaderKey {
    pub(crate) raw: RawKey,
}

impl UpgradeableReaderKey {
    fn grant(shared: &Arc<RwShared>, generation: u64) -> Self {
        Self {
            raw: RawKey::new(shared.id, generation, KeyTracker::armed(shared)),
        }
    }
}

/// Future returned by [`AsyncRwLock::read`].
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<'a, 'b> {
    lock: &'a AsyncRwLock,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for ReadFuture<'_, '_> {
    type Output = Result<ReaderKey, RwAcquireError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.shared.state.lock();

        if let Some(id) = self.waiter_id {
            if let Some(generation) = state.granted_readers.take(id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(ReaderKey::grant(&self.lock.shared, generation)));
            }
        }

        if state.poisoned {
            if let Some(id) = self.waiter_id.take() {
                state.reader_queue.remove(id);
            }
            return Poll::Ready(Err(RwAcquireError::Abandoned));
        }

        if self.cx.checkpoint().is_err() {
            if let Some(id) = self.waiter_id.take() {
                let removed = state.reader_queue.remove(id);
                debug_assert!(removed, "cancelled reader neither queued nor granted");
            }
            return Poll::Ready(Err(RwAcquireError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if !state.reader_capacity_left() {
                    return Poll::Ready(Err(RwAcquireError::ReaderOverflow));
                }
                if state.reader_grantable() && state.reader_queue.is_empty() {
                    let generation = state.grant_reader();
                    drop(state);
                    return Poll::Ready(Ok(ReaderKey::grant(&self.lock.shared, generation)));
                }
                let id = state.reader_queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.reader_queue.register(id, context.waker());
                debug_assert!(registered, "reader waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for ReadFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let wakes = {
            let mut state = self.lock.shared.state.lock();
            let mut wakes = WakeSet::new();
            if !state.reader_queue.remove(id) {
                if let Some(generation) = state.granted_readers.take(id) {
                    // Granted but never observed: release the read hold.
                    debug_assert_eq!(generation, state.current_generation);
                    state.reader_hold_count -= 1;
                    state.sync_reader_bit();
                    if state.reader_hold_count == 0 {
                        state.era_end(&mut wakes);
                    }
                }
            }
            wakes
        };
        wakes.wake_all();
    }
}

/// Future returned by [`AsyncRwLock::write`].
#[must_use = "futures do nothing unless polled"]
pub struct WriteFuture<'a, 'b> {
    lock: &'a AsyncRwLock,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for WriteFuture<'_, '_> {
    type Output = Result<WriterKey, RwAcquireError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.shared.state.lock();

        if let Some(id) = self.waiter_id {
            if let Some(generation) = state.granted_writers.take(id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(WriterKey::grant(&self.lock.shared, generation)));
            }
        }

        if state.poisoned {
            if let Some(id) = self.waiter_id.take() {
                state.writer_queue.remove(id);
            }
            return Poll::Ready(Err(RwAcquireError::Abandoned));
        }

        if self.cx.checkpoint().is_err() {
            let mut wakes = WakeSet::new();
            if let Some(id) = self.waiter_id.take() {
                let removed = state.writer_queue.remove(id);
                debug_assert!(removed, "cancelled writer neither queued nor granted");
                if removed {
                    state.writer_intent_may_clear(&mut wakes);
                }
            }
            drop(state);
            wakes.wake_all();
            return Poll::Ready(Err(RwAcquireError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if state.writer_grantable() && state.writer_queue.is_empty() {
                    state.current_generation = state.generations.mint();
                    state.writer_type = WriterType::Writer;
                    state.mask.set(LockMask::WRITER);
                    let generation = state.current_generation;
                    drop(state);
                    return Poll::Ready(Ok(WriterKey::grant(&self.lock.shared, generation)));
                }
                // Mark intent while queued so reader admission sees the
                // contention.
                state.mask.set(LockMask::WRITER);
                let id = state.writer_queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.writer_queue.register(id, context.waker());
                debug_assert!(registered, "writer waiter {id} neither queued nor granted");
                Poll::Pending
            }
        }
    }
}

impl Drop for WriteFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let wakes = {
            let mut state = self.lock.shared.state.lock();
            let mut wakes = WakeSet::new();
            if state.writer_queue.remove(id) {
                state.writer_intent_may_clear(&mut wakes);
            } else if let Some(generation) = state.granted_writers.take(id) {
                // Granted but never observed: run the normal release ladder.
                debug_assert_eq!(generation, state.current_generation);
                state.writer_type = WriterType::None;
                state.release_writer_ladder(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
    }
}

/// Future returned by [`AsyncRwLock::upgradeable_read`].
#[must_use = "futures do nothing unless polled"]
pub struct UpgradeableReadFuture<'a, 'b> {
    lock: &'a AsyncRwLock,
    cx: &'b Cx,
    waiter_id: Option<u64>,
}

impl Future for UpgradeableReadFuture<'_, '_> {
    type Output = Result<UpgradeableReaderKey, RwAcquireError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.shared.state.lock();

        if let Some(id) = self.waiter_id {
            if let Some(generation) = state.granted_upgradeable.take(id) {
                drop(state);
                self.waiter_id = None;
                return Poll::Ready(Ok(UpgradeableReaderKey::grant(&self.lock.shared, generation)));
            }
        }

        if state.poisoned {
            if let Some(id) = self.waiter_id.take() {
                state.upgradeable_queue.remove(id);
            }
            return Poll::Ready(Err(RwAcquireError::Abandoned));
        }

        if self.cx.checkpoint().is_err() {
            if let Some(id) = self.waiter_id.take() {
                let removed = state.upgradeable_queue.remove(id);
                debug_assert!(removed, "cancelled upgradeable reader neither queued nor granted");
            }
            return Poll::Ready(Err(RwAcquireError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if !state.reader_capacity_left() {
                    return Poll::Ready(Err(RwAcquireError::ReaderOverflow));
                }
                if state.upgradeable_grantable() && state.upgradeable_queue.is_empty() {
                    let generation = state.grant_upgradeable();
                    drop(state);
                    return Poll::Ready(Ok(UpgradeableReaderKey::grant(
                        &self.lock.shared,
                        generation,
                    )));
                }
                let id = state.upgradeable_queue.enqueue(context.waker());
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                let registered = state.upgradeable_queue.register(id, context.waker());
                debug_assert!(
                    registered,
                    "upgradeable waiter {id} neither queued nor granted"
                );
                Poll::Pending
            }
        }
    }
}

impl Drop for UpgradeableReadFuture<'_, '_> {
    fn drop(&mut self) {
        let Some(id) = self.waiter_id else {
            return;
        };
        let wakes = {
            let mut state = self.lock.shared.state.lock();
            let mut wakes = WakeSet::new();
            if !state.upgradeable_queue.remove(id) {
                if let Some(generation) = state.granted_upgradeable.take(id) {
                    // Granted but never observed: release the upgradeable
                    // hold.
                    debug_assert_eq!(generation, state.current_generation);
                    state.mask.clear(LockMask::UPGRADEABLE);
                    state.upgradeable_holds_read = false;
                    state.reader_hold_count -= 1;
                    state.sync_reader_bit();
                    if state.reader_hold_count == 0 {
                        state.era_end(&mut wakes);
                    } else if !state.upgradeable_queue.is_empty() && state.upgradeable_grantable()
                    {
                        state.admit_head_upgradeable(&mut wakes);
                    }
                }
            }
            wakes
        };
        wakes.wake_all();
    }
}

/// Future returned by [`AsyncRwLock::upgrade`].
#[must_use = "futures do nothing unless polled"]
pub struct UpgradeFuture<'a, 'b> {
    lock: &'a AsyncRwLock,
    cx: &'b Cx,
    key_instance: u64,
    key_generation: u64,
    waiter_id: Option<u64>,
    done: bool,
}

impl Future for UpgradeFuture<'_, '_> {
    type Output = Result<WriterKey, UpgradeError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.lock.shared.state.lock();

        if let Some(id) = self.waiter_id {
            if let Some(generation) = state.granted_upgrade.take(id) {
                drop(state);
                self.waiter_id = None;
                self.done = true;
                return Poll::Ready(Ok(WriterKey::grant(&self.lock.shared, generation)));
            }
        }

        if state.poisoned {
            if let Some(id) = self.waiter_id.take() {
                if state.upgrade_waiter.as_ref().is_some_and(|w| w.id == id) {
                    state.upgrade_waiter = None;
                }
            }
            self.done = true;
            return Poll::Ready(Err(UpgradeError::Abandoned));
        }

        if self.cx.checkpoint().is_err() {
            let mut wakes = WakeSet::new();
            if let Some(id) = self.waiter_id.take() {
                if state.upgrade_waiter.as_ref().is_some_and(|w| w.id == id) {
                    state.upgrade_waiter = None;
                    state.revert_pending_upgrade(&mut wakes);
                }
            }
            drop(state);
            wakes.wake_all();
            self.done = true;
            return Poll::Ready(Err(UpgradeError::Cancelled));
        }

        match self.waiter_id {
            None => {
                if state.upgrade_waiter.is_some()
                    || state.writer_type == WriterType::UpgradedFromReader
                {
                    self.done = true;
                    return Poll::Ready(Err(UpgradeError::UpgradeInProgress));
                }
                let holds = state.mask.contains(LockMask::UPGRADEABLE)
                    && state.upgradeable_holds_read
                    && self.key_instance == self.lock.shared.id
                    && self.key_generation == state.current_generation;
                if !holds {
                    self.done = true;
                    return Poll::Ready(Err(UpgradeError::InvalidKey));
                }
                // Withdraw the upgradeable holder's read contribution.
                state.reader_hold_count -= 1;
                state.upgradeable_holds_read = false;
                state.sync_reader_bit();
                if state.reader_hold_count == 0 {
                    // Sole reader: promote in place.
                    state.previous_generation = state.current_generation;
                    state.current_generation = state.generations.mint();
                    state.writer_type = WriterType::UpgradedFromReader;
                    state.mask.set(LockMask::WRITER);
                    let generation = state.current_generation;
                    drop(state);
                    self.done = true;
                    return Poll::Ready(Ok(WriterKey::grant(&self.lock.shared, generation)));
                }
                let id = next_waiter_id();
                state.upgrade_waiter = Some(Waiter {
                    id,
                    waker: context.waker().clone(),
                });
                drop(state);
                self.waiter_id = Some(id);
                Poll::Pending
            }
            Some(id) => {
                if let Some(waiter) = state.upgrade_waiter.as_mut() {
                    if waiter.id == id && !waiter.waker.will_wake(context.waker()) {
                        waiter.waker.clone_from(context.waker());
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for UpgradeFuture<'_, '_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(id) = self.waiter_id else {
            return;
        };
        let wakes = {
            let mut state = self.lock.shared.state.lock();
            let mut wakes = WakeSet::new();
            if state.upgrade_waiter.as_ref().is_some_and(|w| w.id == id) {
                state.upgrade_waiter = None;
                state.revert_pending_upgrade(&mut wakes);
            } else if let Some(generation) = state.granted_upgrade.take(id) {
                // Upgrade granted but never observed: downgrade immediately.
                debug_assert_eq!(generation, state.current_generation);
                state.downgrade(&mut wakes);
            }
            wakes
        };
        wakes.wake_all();
    }
}
