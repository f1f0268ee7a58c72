//! Concurrency primitives for the folder engine

pub mod coalescing;
pub mod leveled;
pub mod waitgroup;

pub use coalescing::{CoalescingContext, CoalescingError, ContextError, OpContext};
pub use leveled::{
    LeveledMutex, LeveledMutexGuard, LeveledReadGuard, LeveledRwLock, LeveledWriteGuard, LockState,
    MutexLevel,
};
pub use waitgroup::RepeatedWaitGroup;
