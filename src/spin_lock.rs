//! Test-and-test-and-set spin locks for very short critical sections.
//!
//! These never yield to the OS scheduler: a waiter burns its time slice
//! issuing CPU pause hints until the flag clears. Only guard sections that
//! last a few tens of instructions with them. Starvation under heavy
//! contention is possible and accepted.
//!
//! See <https://rigtorp.se/spinlock/>.

use crate::threads::cpu_yield;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A data-less spin lock over a single atomic flag.
///
/// Unlike [`SpinLock`], lock and unlock are plain calls, so the flag can be
/// released by a different thread than the one that took it. The binary
/// semaphore relies on this.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Creates an unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, busy-waiting until it is free.
    pub fn lock(&self) {
        loop {
            // Optimistically assume the lock is free on the first try.
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }

            // Wait on a plain load so the cache line stays shared while locked.
            while self.locked.load(Ordering::Relaxed) {
                cpu_yield();
            }
        }
    }

    /// Releases the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Attempts a single acquisition without waiting.
    pub fn try_lock(&self) -> bool {
        // Relaxed pre-check avoids a cache-line bounce for `while !try_lock()` callers.
        !self.locked.load(Ordering::Relaxed) && !self.locked.swap(true, Ordering::Acquire)
    }

    /// Attempts to acquire the lock for at most `spin_count` iterations.
    pub fn try_lock_spin(&self, spin_count: u32) -> bool {
        match spin_count {
            0 => return false,
            1 => return self.try_lock(),
            _ => {}
        }

        let mut i = 0;
        while i < spin_count {
            if !self.locked.swap(true, Ordering::Acquire) {
                return true;
            }
            i += 1;

            loop {
                cpu_yield();
                i += 1;
                if !self.locked.load(Ordering::Relaxed) || i >= spin_count {
                    break;
                }
            }
        }
        false
    }

    /// Observes the flag. Racy, for diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Acquires the lock and returns a guard releasing it on drop.
    pub fn auto_lock(&self) -> RawSpinLockGuard<'_> {
        self.lock();
        RawSpinLockGuard { lock: self }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Scoped acquisition of a [`RawSpinLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RawSpinLockGuard<'a> {
    lock: &'a RawSpinLock,
}

impl Drop for RawSpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A spin lock protecting a value, handed out through [`SpinLockGuard`].
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable through a guard, and guards are
// exclusive thanks to the atomic flag.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().then_some(SpinLockGuard { lock: self })
    }

    pub fn try_lock_spin(&self, spin_count: u32) -> Option<SpinLockGuard<'_, T>> {
        self.raw
            .try_lock_spin(spin_count)
            .then_some(SpinLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the value of a [`SpinLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while the flag is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while the flag is held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
