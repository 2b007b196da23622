//! A mutex that can be held across `fork(2)` and rebuilt in the child.
//!
//! `std::sync::Mutex` only unlocks through its guard, which rules out the
//! prepare/parent split of a fork hook (lock in one callback, unlock in
//! another) and offers no way to throw away a lock owned by a thread that
//! does not exist in the child. This wraps a heap-pinned `pthread_mutex_t`
//! so those operations are available alongside an ordinary RAII guard.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;

pub(crate) struct ForkSafeMutex<T> {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    data: UnsafeCell<T>,
}

// Access to `data` is serialized by `raw`.
unsafe impl<T: Send> Send for ForkSafeMutex<T> {}
unsafe impl<T: Send> Sync for ForkSafeMutex<T> {}

impl<T> ForkSafeMutex<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            raw: Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)),
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn lock(&self) -> ForkSafeMutexGuard<'_, T> {
        // SAFETY: the mutex was initialized in `new` (or `reinit`) and its
        // address is stable because it lives in a `Box`.
        unsafe { self.lock_raw() };
        ForkSafeMutexGuard { mutex: self }
    }

    /// Acquires the lock without producing a guard.
    ///
    /// # Safety
    /// The caller must release it with [`Self::unlock_raw`] from the same
    /// thread, or abandon it with [`Self::reinit`] in a forked child.
    pub(crate) unsafe fn lock_raw(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock failed");
    }

    /// # Safety
    /// The calling thread must hold the lock through [`Self::lock_raw`].
    pub(crate) unsafe fn unlock_raw(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed");
    }

    /// Access to the data while the lock is held without a guard.
    ///
    /// # Safety
    /// The calling thread must hold the lock through [`Self::lock_raw`] and
    /// must not let the reference outlive its release.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Discards whatever state the lock was in and makes it unlocked.
    ///
    /// # Safety
    /// Only sound when no other thread can be touching the lock, which holds
    /// in the child right after `fork(2)` since it has a single thread.
    pub(crate) unsafe fn reinit(&self) {
        unsafe { std::ptr::write(self.raw.get(), libc::PTHREAD_MUTEX_INITIALIZER) };
    }
}

impl<T: Default> Default for ForkSafeMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Drop for ForkSafeMutex<T> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
    }
}

impl<T> fmt::Debug for ForkSafeMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkSafeMutex").finish_non_exhaustive()
    }
}

pub(crate) struct ForkSafeMutexGuard<'a, T> {
    mutex: &'a ForkSafeMutex<T>,
}

impl<T> Deref for ForkSafeMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ForkSafeMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ForkSafeMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock_raw() };
    }
}
