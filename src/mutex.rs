//! Hybrid spin-then-block mutex.
//!
//! [`LightweightMutex`] first spins on a [`RawSpinLock`] for a bounded number
//! of iterations and only then falls back to an OS mutex, so short critical
//! sections never pay for a syscall while sustained contention does not burn
//! whole time slices.

use crate::profiling;
use crate::spin_lock::{RawSpinLock, SpinLock};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

/// Default number of spin iterations before escalating to the OS lock.
pub const DEFAULT_SPIN_COUNT: u32 = 4096;

/// OS-blocking lock used once spinning gave up.
///
/// Kept separate from the guarded value so a panicking holder never poisons
/// the data path: the flag is recovered from a poisoned mutex.
struct SystemLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl SystemLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn lock(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
    }

    fn unlock(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

/// Profiler labels attached to a mutex. No effect on locking.
#[derive(Clone, Copy, Default)]
struct LockLabel {
    name: Option<&'static str>,
    mark: Option<&'static Location<'static>>,
}

/// A mutex that spins before blocking.
///
/// The spin flag is the exclusion token on both paths. A thread that gave up
/// spinning queues on the OS lock, so at most one blocked thread competes with
/// the spinners for the flag at any time.
pub struct LightweightMutex<T: ?Sized> {
    spin_lock: RawSpinLock,
    spin_count: u32,
    system: SystemLock,
    /// Whether the current holder also owns `system`. Only touched while the
    /// spin flag is held.
    held_system: AtomicBool,
    label: SpinLock<LockLabel>,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable while the spin flag is held.
unsafe impl<T: ?Sized + Send> Send for LightweightMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for LightweightMutex<T> {}

impl<T> LightweightMutex<T> {
    pub fn new(value: T) -> Self {
        Self::with_spin_count(value, DEFAULT_SPIN_COUNT)
    }

    /// Creates a mutex spinning at most `spin_count` times before blocking.
    pub fn with_spin_count(value: T, spin_count: u32) -> Self {
        Self {
            spin_lock: RawSpinLock::new(),
            spin_count,
            system: SystemLock::new(),
            held_system: AtomicBool::new(false),
            label: SpinLock::new(LockLabel::default()),
            value: UnsafeCell::new(value),
        }
    }

    /// Creates a mutex labelled `name` in profiler captures.
    pub fn with_name(value: T, name: &'static str) -> Self {
        let mutex = Self::new(value);
        mutex.custom_name(name);
        mutex
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> LightweightMutex<T> {
    /// Acquires the lock without producing a guard.
    ///
    /// Pair with [`manual_unlock`](Self::manual_unlock). Prefer [`lock`](Self::lock).
    pub fn manual_lock(&self) {
        if self.spin_lock.try_lock_spin(self.spin_count) {
            return;
        }

        let contended_since = profiling::is_enabled().then(Instant::now);

        self.system.lock();
        // At least one attempt per round, even with spinning disabled.
        while !self.spin_lock.try_lock_spin(self.spin_count.max(1)) {
            thread::yield_now();
        }
        self.held_system.store(true, Ordering::Relaxed);

        if let Some(start) = contended_since {
            let label = *self.label.lock();
            profiling::record_event(
                label.name.unwrap_or("LightweightMutex"),
                profiling::Category::Lock,
                start,
                label.mark,
            );
        }
    }

    /// Releases the lock through whichever path acquired it.
    ///
    /// # Safety
    ///
    /// The calling context must hold the lock, acquired through
    /// [`manual_lock`](Self::manual_lock) or a guard that was forgotten.
    pub unsafe fn manual_unlock(&self) {
        let held_system = self.held_system.swap(false, Ordering::Relaxed);
        self.spin_lock.unlock();
        if held_system {
            self.system.unlock();
        }
    }

    /// Acquires the lock for the lifetime of the returned guard.
    pub fn lock(&self) -> LightweightMutexGuard<'_, T> {
        self.manual_lock();
        LightweightMutexGuard { mutex: self }
    }

    /// Attempts the spin path only. Never blocks the OS thread.
    pub fn try_lock(&self) -> Option<LightweightMutexGuard<'_, T>> {
        self.spin_lock
            .try_lock_spin(self.spin_count.max(1))
            .then_some(LightweightMutexGuard { mutex: self })
    }

    /// Observes the lock state. Racy, for diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.spin_lock.is_locked()
    }

    pub fn spin_count(&self) -> u32 {
        self.spin_count
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Labels the lock in profiler captures.
    pub fn custom_name(&self, name: &'static str) {
        self.label.lock().name = Some(name);
    }

    pub fn name(&self) -> Option<&'static str> {
        self.label.lock().name
    }

    /// Records the caller's source location as the lock's profiler mark.
    #[track_caller]
    pub fn mark(&self) {
        self.label.lock().mark = Some(Location::caller());
    }

    pub fn last_mark(&self) -> Option<&'static Location<'static>> {
        self.label.lock().mark
    }
}

impl<T: Default> Default for LightweightMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for LightweightMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightweightMutex")
            .field("name", &self.name())
            .field("locked", &self.is_locked())
            .field("spin_count", &self.spin_count)
            .finish_non_exhaustive()
    }
}

/// Scoped acquisition of a [`LightweightMutex`]. Unlocks on every exit path,
/// unwinding included.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LightweightMutexGuard<'a, T: ?Sized> {
    mutex: &'a LightweightMutex<T>,
}

impl<T: ?Sized> Deref for LightweightMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for LightweightMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for LightweightMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard proves the lock is held.
        unsafe { self.mutex.manual_unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_default_spin_count() {
        let mutex = LightweightMutex::new(());
        assert_eq!(mutex.spin_count(), 4096);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let mutex = LightweightMutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.try_lock().expect("lock is free"), 1);
    }

    #[test]
    fn test_manual_lock_unlock() {
        let mutex = LightweightMutex::new(());
        mutex.manual_lock();
        assert!(mutex.is_locked());
        unsafe { mutex.manual_unlock() };
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let mutex = Arc::new(LightweightMutex::new(0));
        let remote = mutex.clone();
        let result = thread::spawn(move || {
            let _guard = remote.lock();
            panic!("holder failed");
        })
        .join();

        assert!(result.is_err());
        assert!(!mutex.is_locked());
        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn test_slow_path_blocks_until_release() {
        // A tiny spin budget forces the OS fallback.
        let mutex = Arc::new(LightweightMutex::with_spin_count(Vec::new(), 2));
        let guard = mutex.lock();

        let remote = mutex.clone();
        let waiter = thread::spawn(move || {
            remote.lock().push("waiter");
        });

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
        assert_eq!(*mutex.lock(), vec!["waiter"]);
    }

    #[test]
    fn test_contended_increments() {
        let mutex = Arc::new(LightweightMutex::with_spin_count(0usize, 8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 40_000);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_labels() {
        let mutex = LightweightMutex::with_name((), "resource table");
        assert_eq!(mutex.name(), Some("resource table"));
        assert!(mutex.last_mark().is_none());

        mutex.mark();
        let mark = mutex.last_mark().expect("marked");
        assert!(mark.file().ends_with("mutex.rs"));
    }
}
