//! Synchronization primitives.
//!
//! From the bottom up: the [`SpinLock`] guards short critical sections
//! without rescheduling; the [`Semaphore`] is the blocking primitive
//! everything else is built from; the [`Lock`] adds holder tracking and
//! priority donation; the [`ConditionVariable`] completes the monitor
//! pattern.

pub mod condvar;
pub mod lock;
pub mod semaphore;
pub mod spinlock;

pub use condvar::ConditionVariable;
pub use lock::Lock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
