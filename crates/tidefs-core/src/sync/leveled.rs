//! Deadlock-preventing lock wrappers with a statically assigned level.
//!
//! Every lock in the folder engine carries a small integer level, and every
//! logical flow of execution carries a [`LockState`] token recording which
//! levels it currently holds. Acquiring a lock whose level is numerically
//! less than or equal to the highest level already recorded in the token is
//! a programming error and panics immediately, before any blocking wait.
//! Locks are therefore always taken in one global order, which makes
//! deadlock between them impossible by construction.
//!
//! The token tags the logical call chain rather than the executing thread,
//! because execution hops between tasks at every await point. Every public
//! engine operation creates one `LockState` near its top and plumbs it
//! through to every function that holds (or asserts) any of the engine's
//! locks.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A lock level. Lower levels must always be acquired before higher ones.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexLevel(pub u8);

impl MutexLevel {
    fn bit(self) -> u8 {
        assert!(self.0 < 8, "lock level {} out of range", self.0);
        1 << self.0
    }
}

impl fmt::Debug for MutexLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutexLevel({})", self.0)
    }
}

/// Names a level for diagnostics; supplied by whoever defines the hierarchy.
pub type LevelNamer = fn(MutexLevel) -> &'static str;

/// Per-flow token recording which lock levels are currently held.
///
/// One token per logical flow; a token must never be shared between
/// concurrently executing flows. Exclusive and shared holds are tracked
/// separately so the assertion helpers can distinguish them.
#[derive(Debug)]
pub struct LockState {
    exclusive: AtomicU8,
    shared: AtomicU8,
    namer: LevelNamer,
}

impl LockState {
    /// Create an empty token using `namer` for panic messages.
    pub fn new(namer: LevelNamer) -> Self {
        Self {
            exclusive: AtomicU8::new(0),
            shared: AtomicU8::new(0),
            namer,
        }
    }

    fn highest_held(&self) -> Option<u8> {
        let mask = self.exclusive.load(Ordering::Relaxed) | self.shared.load(Ordering::Relaxed);
        if mask == 0 {
            None
        } else {
            Some(7 - mask.leading_zeros() as u8)
        }
    }

    /// Panics if acquiring `level` now would violate the lock order.
    fn check_acquire(&self, level: MutexLevel) {
        if let Some(highest) = self.highest_held() {
            assert!(
                level.0 > highest,
                "lock order violation: acquiring {} (level {}) while already holding {} (level {})",
                (self.namer)(level),
                level.0,
                (self.namer)(MutexLevel(highest)),
                highest,
            );
        }
    }

    fn record(&self, level: MutexLevel, exclusive: bool) {
        let mask = if exclusive { &self.exclusive } else { &self.shared };
        mask.fetch_or(level.bit(), Ordering::Relaxed);
    }

    fn release(&self, level: MutexLevel, exclusive: bool) {
        let mask = if exclusive { &self.exclusive } else { &self.shared };
        mask.fetch_and(!level.bit(), Ordering::Relaxed);
    }

    /// Whether `level` is recorded as held exclusively.
    pub fn is_exclusive_held(&self, level: MutexLevel) -> bool {
        self.exclusive.load(Ordering::Relaxed) & level.bit() != 0
    }

    /// Whether `level` is recorded as held shared.
    pub fn is_shared_held(&self, level: MutexLevel) -> bool {
        self.shared.load(Ordering::Relaxed) & level.bit() != 0
    }

    /// Whether `level` is recorded as held at all.
    pub fn is_any_held(&self, level: MutexLevel) -> bool {
        self.is_exclusive_held(level) || self.is_shared_held(level)
    }
}

/// A mutex with a level, protecting `T`.
#[derive(Debug)]
pub struct LeveledMutex<T> {
    level: MutexLevel,
    inner: Mutex<T>,
}

impl<T> LeveledMutex<T> {
    pub fn new(level: MutexLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    /// Acquire the mutex, recording the hold in `lstate`.
    ///
    /// Panics (before waiting) if `lstate` already holds this level or a
    /// higher one.
    pub fn lock<'a, 'b>(
        &'a self,
        lstate: &'b LockState,
    ) -> impl Future<Output = LeveledMutexGuard<'a, 'b, T>> + Send + use<'a, 'b, T>
    where
        T: Send,
    {
        async move {
            lstate.check_acquire(self.level);
            let guard = self.inner.lock().await;
            lstate.record(self.level, true);
            LeveledMutexGuard {
                guard,
                level: self.level,
                lstate,
            }
        }
    }

    /// Panics unless `lstate` records this mutex as held.
    pub fn assert_locked(&self, lstate: &LockState) {
        assert!(
            lstate.is_exclusive_held(self.level),
            "{} (level {}) required but not held",
            (lstate.namer)(self.level),
            self.level.0,
        );
    }
}

/// RAII guard for [`LeveledMutex`]; releases the token bit on drop.
pub struct LeveledMutexGuard<'a, 'b, T> {
    guard: MutexGuard<'a, T>,
    level: MutexLevel,
    lstate: &'b LockState,
}

impl<T> Deref for LeveledMutexGuard<'_, '_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledMutexGuard<'_, '_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LeveledMutexGuard<'_, '_, T> {
    fn drop(&mut self) {
        self.lstate.release(self.level, true);
    }
}

/// A read-write lock with a level, protecting `T`.
///
/// Additionally tracks whether it is currently write-locked, so callers
/// holding a guard of unknown kind can decide whether it is safe to drop a
/// shared guard around slow work (the cache-miss-fetch pattern) without
/// giving up an exclusive hold.
#[derive(Debug)]
pub struct LeveledRwLock<T> {
    level: MutexLevel,
    inner: RwLock<T>,
    write_locked: AtomicU8,
}

impl<T> LeveledRwLock<T> {
    pub fn new(level: MutexLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
            write_locked: AtomicU8::new(0),
        }
    }

    /// Acquire a shared guard, recording the hold in `lstate`.
    pub fn read<'a, 'b>(
        &'a self,
        lstate: &'b LockState,
    ) -> impl Future<Output = LeveledReadGuard<'a, 'b, T>> + Send + use<'a, 'b, T>
    where
        T: Send + Sync,
    {
        async move {
            lstate.check_acquire(self.level);
            let guard = self.inner.read().await;
            lstate.record(self.level, false);
            LeveledReadGuard {
                guard,
                level: self.level,
                lstate,
            }
        }
    }

    /// Acquire an exclusive guard, recording the hold in `lstate`.
    pub fn write<'a, 'b>(
        &'a self,
        lstate: &'b LockState,
    ) -> impl Future<Output = LeveledWriteGuard<'a, 'b, T>> + Send + use<'a, 'b, T>
    where
        T: Send + Sync,
    {
        async move {
            lstate.check_acquire(self.level);
            let guard = self.inner.write().await;
            lstate.record(self.level, true);
            self.write_locked.store(1, Ordering::Relaxed);
            LeveledWriteGuard {
                guard,
                lock: self,
                lstate,
            }
        }
    }

    /// Whether the lock is currently held exclusively by some flow.
    pub fn is_write_locked(&self) -> bool {
        self.write_locked.load(Ordering::Relaxed) != 0
    }

    /// Panics unless `lstate` records an exclusive hold of this lock.
    pub fn assert_locked(&self, lstate: &LockState) {
        assert!(
            lstate.is_exclusive_held(self.level),
            "{} (level {}) required exclusively but not held",
            (lstate.namer)(self.level),
            self.level.0,
        );
    }

    /// Panics unless `lstate` records a shared hold of this lock.
    pub fn assert_read_locked(&self, lstate: &LockState) {
        assert!(
            lstate.is_shared_held(self.level),
            "{} (level {}) required shared but not held",
            (lstate.namer)(self.level),
            self.level.0,
        );
    }

    /// Panics unless `lstate` records any hold of this lock.
    pub fn assert_any_locked(&self, lstate: &LockState) {
        assert!(
            lstate.is_any_held(self.level),
            "{} (level {}) required but not held",
            (lstate.namer)(self.level),
            self.level.0,
        );
    }
}

/// RAII shared guard for [`LeveledRwLock`].
pub struct LeveledReadGuard<'a, 'b, T> {
    guard: RwLockReadGuard<'a, T>,
    level: MutexLevel,
    lstate: &'b LockState,
}

impl<T> Deref for LeveledReadGuard<'_, '_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for LeveledReadGuard<'_, '_, T> {
    fn drop(&mut self) {
        self.lstate.release(self.level, false);
    }
}

/// RAII exclusive guard for [`LeveledRwLock`].
pub struct LeveledWriteGuard<'a, 'b, T> {
    guard: RwLockWriteGuard<'a, T>,
    lock: &'a LeveledRwLock<T>,
    lstate: &'b LockState,
}

impl<T> Deref for LeveledWriteGuard<'_, '_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledWriteGuard<'_, '_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LeveledWriteGuard<'_, '_, T> {
    fn drop(&mut self) {
        self.lock.write_locked.store(0, Ordering::Relaxed);
        self.lstate.release(self.lock.level, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(level: MutexLevel) -> &'static str {
        match level.0 {
            0 => "outerLock",
            1 => "middleLock",
            2 => "innerLock",
            _ => "unknown",
        }
    }

    #[tokio::test]
    async fn test_in_order_acquisition() {
        let outer = LeveledMutex::new(MutexLevel(0), 1u32);
        let middle = LeveledRwLock::new(MutexLevel(1), 2u32);
        let inner = LeveledRwLock::new(MutexLevel(2), 3u32);

        let lstate = LockState::new(name);
        let a = outer.lock(&lstate).await;
        let b = middle.write(&lstate).await;
        let c = inner.read(&lstate).await;
        assert_eq!((*a, *b, *c), (1, 2, 3));

        outer.assert_locked(&lstate);
        middle.assert_locked(&lstate);
        inner.assert_read_locked(&lstate);
        inner.assert_any_locked(&lstate);
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn test_out_of_order_acquisition_panics() {
        let outer = LeveledMutex::new(MutexLevel(0), ());
        let inner = LeveledRwLock::new(MutexLevel(2), ());

        let lstate = LockState::new(name);
        let _held = inner.write(&lstate).await;
        // The check fires before any blocking wait on the mutex.
        let _ = outer.lock(&lstate).await;
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn test_same_level_reacquisition_panics() {
        let outer = LeveledMutex::new(MutexLevel(0), ());
        let lstate = LockState::new(name);
        let _held = outer.lock(&lstate).await;
        let _ = outer.lock(&lstate).await;
    }

    #[tokio::test]
    async fn test_release_allows_lower_reacquisition() {
        let outer = LeveledMutex::new(MutexLevel(0), ());
        let inner = LeveledRwLock::new(MutexLevel(2), ());

        let lstate = LockState::new(name);
        {
            let _held = inner.write(&lstate).await;
        }
        // Inner hold released; taking the outer lock is legal again.
        let _outer = outer.lock(&lstate).await;
        assert!(!lstate.is_any_held(MutexLevel(2)));
    }

    #[tokio::test]
    #[should_panic(expected = "required but not held")]
    async fn test_assert_locked_panics_when_not_held() {
        let outer = LeveledMutex::new(MutexLevel(0), ());
        let lstate = LockState::new(name);
        outer.assert_locked(&lstate);
    }

    #[tokio::test]
    async fn test_separate_flows_do_not_interfere() {
        use std::sync::Arc;

        let lock = Arc::new(LeveledRwLock::new(MutexLevel(1), 0u32));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            tasks.push(tokio::spawn(async move {
                let lstate = LockState::new(name);
                let mut g = lock.write(&lstate).await;
                *g += 1;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let lstate = LockState::new(name);
        assert_eq!(*lock.read(&lstate).await, 8);
    }

    #[tokio::test]
    async fn test_write_locked_flag_tracks_exclusive_hold() {
        let lock = LeveledRwLock::new(MutexLevel(1), ());
        let lstate = LockState::new(name);
        assert!(!lock.is_write_locked());
        {
            let _g = lock.write(&lstate).await;
            assert!(lock.is_write_locked());
        }
        assert!(!lock.is_write_locked());
        {
            let _g = lock.read(&lstate).await;
            assert!(!lock.is_write_locked());
        }
    }
}
