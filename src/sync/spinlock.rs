//! Spinlock.
//!
//! The spinlock is the lowest-level mutual exclusion primitive of the
//! kernel. Unlike the sleeping [`Lock`], a spinlock never suspends the
//! holder; contenders spin until the lock becomes available. It therefore
//! protects only short critical sections, and holding one marks a region in
//! which the holder must not reschedule.
//!
//! The guard returned by [`SpinLock::lock`] must be *explicitly* released
//! with [`SpinLockGuard::unlock`]. Dropping a live guard is a programming
//! error and panics, so a forgotten unlock is caught at the point of the
//! mistake rather than as a mysterious hang later.
//!
//! [`Lock`]: crate::sync::Lock

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Each spinlock has a type parameter which represents the data it protects.
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`], which guarantees the data is only ever touched while
/// the lock is held.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use seos::sync::SpinLock;
///
/// let data = SpinLock::new(0);
/// let mut guard = data.lock();
/// *guard += 1;
/// // The lock must be explicitly unlocked.
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, spinning until it is available.
    ///
    /// Upon returning, the calling thread is the only thread with the lock
    /// held. A guard is returned to allow scoped access to the data. The
    /// guard does not release the lock on drop; it must be released with
    /// [`SpinLockGuard::unlock`].
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
        }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    ///
    /// Returns [`WouldBlock`] if the lock is already held.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if !self.locked.swap(true, Ordering::Acquire) {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
            })
        } else {
            Err(WouldBlock)
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// A scoped guard of a [`SpinLock`].
///
/// The lock must be explicitly released by the [`unlock`] method; dropping a
/// live guard panics with the location where the lock was taken.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(self) {
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // A panic while a guard is live would otherwise turn into a double
        // panic; release the lock and let the original panic propagate.
        if std::thread::panicking() {
            self.lock.locked.store(false, Ordering::Release);
            return;
        }
        panic!(
            "`.unlock()` must be explicitly called before dropping a SpinLockGuard. \
The lock was taken at {:?}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::sync::Arc;

    #[test]
    fn counter() {
        let data = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let data = data.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = data.lock();
                        *guard += 1;
                        guard.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let guard = data.lock();
        assert_eq!(*guard, 8000);
        guard.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let l = SpinLock::new(());
        let g = l.lock();
        assert!(l.try_lock().is_err());
        g.unlock();
        let g = l.try_lock().ok().unwrap();
        g.unlock();
    }
}
