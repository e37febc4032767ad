//! Fiber contexts: a reusable stack plus a suspended execution point.
//!
//! Each context runs a trampoline coroutine that never returns. It starts the
//! job it is handed, switches back to its host with `Finished` once the job
//! returns, and waits there for the next job. Stacks are allocated once, when
//! the pool is built, and switching never allocates.

use crate::counter::Counter;
use crate::job::StartJob;
use crate::spin_lock::SpinLock;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::UnsafeCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::mem::ManuallyDrop;

/// Value passed into a fiber when a host switches to it.
pub(crate) enum FiberInput {
    /// Run a fresh job from its entry point.
    Start(StartJob),
    /// Continue a suspended job where it left off.
    Resume,
}

/// Why a fiber handed control back to its host.
pub(crate) enum SwitchOut {
    /// The job returned (or panicked); the context is ready for reuse.
    Finished,
    /// The job waits for `counter` to drop to `target`.
    Waiting { counter: Counter, target: usize },
}

pub(crate) type JobYielder = Yielder<FiberInput, SwitchOut>;

type Trampoline = Coroutine<FiberInput, SwitchOut, (), DefaultStack>;

/// A fiber stack and the coroutine running on it.
pub(crate) struct FiberContext {
    coroutine: Trampoline,
}

// SAFETY: a context is only resumed by the fiber thread holding the bound
// job's host token, so it is never touched by two threads at once. Job code
// running on it must not rely on thread-local state across a suspension.
unsafe impl Send for FiberContext {}

impl FiberContext {
    /// Maps a stack of at least `stack_size` bytes, with a guard page below
    /// it, and parks the trampoline on it.
    pub(crate) fn new(stack_size: usize) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine: Trampoline =
            Coroutine::with_stack(stack, |yielder: &JobYielder, mut input: FiberInput| loop {
                if let FiberInput::Start(job) = input {
                    job.run(yielder);
                }
                input = yielder.suspend(SwitchOut::Finished);
            });
        Ok(Self { coroutine })
    }

    /// Switches from the host to this fiber until it switches back out.
    pub(crate) fn switch_in(&mut self, input: FiberInput) -> SwitchOut {
        match self.coroutine.resume(input) {
            CoroutineResult::Yield(out) => out,
            // The trampoline loops forever.
            CoroutineResult::Return(()) => SwitchOut::Finished,
        }
    }
}

/// Index of a context in its [`ContextPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ContextId(u16);

impl ContextId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed set of small-stack and big-stack fiber contexts.
///
/// Ids `0..small_count` are small, the rest big. Free ids are handed out
/// lowest first.
pub(crate) struct ContextPool {
    contexts: Box<[UnsafeCell<ManuallyDrop<FiberContext>>]>,
    small_count: usize,
    small_free: SpinLock<BinaryHeap<Reverse<u16>>>,
    big_free: SpinLock<BinaryHeap<Reverse<u16>>>,
}

// SAFETY: a context is reachable only through the id handed out by
// `acquire`, and one id has one owner at a time.
unsafe impl Sync for ContextPool {}
unsafe impl Send for ContextPool {}

impl ContextPool {
    pub(crate) fn new(
        small_count: usize,
        small_stack_size: usize,
        big_count: usize,
        big_stack_size: usize,
    ) -> io::Result<Self> {
        let total = small_count + big_count;
        debug_assert!(total <= u16::MAX as usize);

        let mut contexts = Vec::with_capacity(total);
        for i in 0..total {
            let stack_size = if i < small_count {
                small_stack_size
            } else {
                big_stack_size
            };
            contexts.push(UnsafeCell::new(ManuallyDrop::new(FiberContext::new(stack_size)?)));
        }

        Ok(Self {
            contexts: contexts.into_boxed_slice(),
            small_count,
            small_free: SpinLock::new((0..small_count as u16).map(Reverse).collect()),
            big_free: SpinLock::new((small_count as u16..total as u16).map(Reverse).collect()),
        })
    }

    /// Takes the lowest free context of the requested kind.
    pub(crate) fn acquire(&self, big: bool) -> Option<ContextId> {
        let free = if big { &self.big_free } else { &self.small_free };
        free.lock().pop().map(|Reverse(id)| ContextId(id))
    }

    pub(crate) fn release(&self, id: ContextId) {
        let free = if self.is_big(id) {
            &self.big_free
        } else {
            &self.small_free
        };
        free.lock().push(Reverse(id.0));
    }

    pub(crate) fn is_big(&self, id: ContextId) -> bool {
        id.index() >= self.small_count
    }

    pub(crate) fn available(&self) -> usize {
        self.small_free.lock().len() + self.big_free.lock().len()
    }

    /// # Safety
    ///
    /// `id` must come from [`acquire`](Self::acquire) and the caller must be
    /// its only user (it hosts the job bound to it).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self, id: ContextId) -> &mut FiberContext {
        unsafe { &mut *self.contexts[id.index()].get() }
    }
}

impl Drop for ContextPool {
    fn drop(&mut self) {
        let mut free = vec![false; self.contexts.len()];
        for Reverse(id) in self
            .small_free
            .get_mut()
            .drain()
            .chain(self.big_free.get_mut().drain())
        {
            free[id as usize] = true;
        }

        let mut leaked = 0;
        for (cell, is_free) in self.contexts.iter_mut().zip(free) {
            if is_free {
                // SAFETY: free contexts sit at the trampoline's switch point
                // and are dropped exactly once.
                unsafe { ManuallyDrop::drop(cell.get_mut()) };
            } else {
                // Still holds a suspended job's frames: leak the stack.
                leaked += 1;
            }
        }
        if leaked > 0 {
            log::warn!("{leaked} fiber context(s) still bound to jobs, leaking their stacks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_finishes_on_resume() {
        let mut context = FiberContext::new(64 * 1024).unwrap();
        // No job: the trampoline switches straight back out.
        assert!(matches!(
            context.switch_in(FiberInput::Resume),
            SwitchOut::Finished
        ));
        assert!(matches!(
            context.switch_in(FiberInput::Resume),
            SwitchOut::Finished
        ));
    }

    #[test]
    fn test_pool_hands_out_lowest_id() {
        let pool = ContextPool::new(3, 64 * 1024, 2, 128 * 1024).unwrap();
        assert_eq!(pool.available(), 5);

        let a = pool.acquire(false).unwrap();
        let b = pool.acquire(false).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        pool.release(a);
        assert_eq!(pool.acquire(false).unwrap().index(), 0);

        let big = pool.acquire(true).unwrap();
        assert_eq!(big.index(), 3);
        assert!(pool.is_big(big));
        assert!(!pool.is_big(b));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = ContextPool::new(1, 64 * 1024, 0, 0).unwrap();
        let id = pool.acquire(false).unwrap();
        assert!(pool.acquire(false).is_none());
        assert!(pool.acquire(true).is_none());
        pool.release(id);
        assert_eq!(pool.available(), 1);
    }
}
