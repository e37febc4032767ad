//! Reader-writer spin lock for read-mostly, low-contention data.
//!
//! One atomic word holds a writer bit and a reader count. Readers take the
//! lock with a single `fetch_add` and back out if a writer holds it; a writer
//! needs the whole word to be zero. The lock is unfair: a steady stream of
//! readers can keep a writer waiting.

use crate::threads::cpu_yield;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

const WRITER: u32 = 1;
const ONE_READER: u32 = 1 << 1;

/// Failed attempts spent busy-spinning before issuing pause hints.
const CPU_YIELD_SPIN_COUNT: u32 = 64;
/// Failed attempts before giving up the time slice between tries.
const THREAD_YIELD_SPIN_COUNT: u32 = 96;

fn backoff(spins: &mut u32) {
    *spins = spins.saturating_add(1);
    if *spins >= THREAD_YIELD_SPIN_COUNT {
        thread::yield_now();
    } else if *spins >= CPU_YIELD_SPIN_COUNT {
        cpu_yield();
    }
}

/// A data-less reader-writer spin lock.
pub struct RwSpinLock {
    state: AtomicU32,
}

impl RwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Takes a shared lock, spinning while a writer holds it.
    pub fn read_lock(&self) {
        let mut spins = 0;
        while !self.try_read_lock() {
            backoff(&mut spins);
        }
    }

    /// Takes a shared lock unless a writer holds it.
    pub fn try_read_lock(&self) -> bool {
        // Optimistic: readers rarely meet a writer.
        let previous = self.state.fetch_add(ONE_READER, Ordering::Acquire);
        if previous & WRITER != 0 {
            self.state.fetch_sub(ONE_READER, Ordering::Release);
            return false;
        }
        true
    }

    pub fn read_unlock(&self) {
        let previous = self.state.fetch_sub(ONE_READER, Ordering::Release);
        debug_assert!(
            previous >= ONE_READER && previous & WRITER == 0,
            "read_unlock without a read lock"
        );
    }

    /// Takes the exclusive lock, spinning until no reader or writer holds it.
    pub fn write_lock(&self) {
        let mut spins = 0;
        while !self.try_write_lock() {
            backoff(&mut spins);
        }
    }

    pub fn try_write_lock(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn write_unlock(&self) {
        let previous = self.state.fetch_and(!WRITER, Ordering::Release);
        debug_assert_eq!(previous, WRITER, "write_unlock without the write lock");
    }

    /// Number of readers currently inside. Racy, for diagnostics only.
    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) >> 1
    }

    /// Whether a writer holds the lock. Racy, for diagnostics only.
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    pub fn auto_read_lock(&self) -> RwSpinLockReadGuard<'_> {
        self.read_lock();
        RwSpinLockReadGuard { lock: self }
    }

    pub fn auto_write_lock(&self) -> RwSpinLockWriteGuard<'_> {
        self.write_lock();
        RwSpinLockWriteGuard { lock: self }
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("readers", &self.reader_count())
            .field("write_locked", &self.is_write_locked())
            .finish()
    }
}

/// Shared acquisition of a [`RwSpinLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwSpinLockReadGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for RwSpinLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive acquisition of a [`RwSpinLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwSpinLockWriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for RwSpinLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;

    #[test]
    fn test_readers_share_the_lock() {
        let lock = RwSpinLock::new();
        assert!(lock.try_read_lock());
        assert!(lock.try_read_lock());
        assert_eq!(lock.reader_count(), 2);
        assert!(!lock.try_write_lock());

        lock.read_unlock();
        lock.read_unlock();
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.try_write_lock());
    }

    #[test]
    fn test_writer_excludes_everyone() {
        let lock = RwSpinLock::new();
        assert!(lock.try_write_lock());
        assert!(lock.is_write_locked());
        assert!(!lock.try_write_lock());
        assert!(!lock.try_read_lock());
        // A failed reader leaves no trace in the count.
        assert_eq!(lock.reader_count(), 0);

        lock.write_unlock();
        assert!(!lock.is_write_locked());
        assert!(lock.try_read_lock());
    }

    #[test]
    fn test_guards_release() {
        let lock = RwSpinLock::new();
        {
            let _a = lock.auto_read_lock();
            let _b = lock.auto_read_lock();
            assert_eq!(lock.reader_count(), 2);
        }
        {
            let _w = lock.auto_write_lock();
            assert!(lock.is_write_locked());
        }
        assert!(lock.try_write_lock());
    }

    struct Guarded {
        lock: RwSpinLock,
        pair: UnsafeCell<(u64, u64)>,
    }

    // SAFETY: `pair` is only touched under `lock`.
    unsafe impl Sync for Guarded {}

    #[test]
    fn test_readers_never_see_torn_writes() {
        let shared = Arc::new(Guarded {
            lock: RwSpinLock::new(),
            pair: UnsafeCell::new((0, 0)),
        });

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let _guard = shared.lock.auto_write_lock();
                        // SAFETY: write lock held.
                        let pair = unsafe { &mut *shared.pair.get() };
                        pair.0 += 1;
                        pair.1 += 1;
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let _guard = shared.lock.auto_read_lock();
                        // SAFETY: read lock held, writers excluded.
                        let (a, b) = unsafe { *shared.pair.get() };
                        assert_eq!(a, b);
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        let _guard = shared.lock.auto_read_lock();
        // SAFETY: read lock held.
        assert_eq!(unsafe { *shared.pair.get() }, (4_000, 4_000));
    }
}
