//! OS thread helpers used by the fiber threads.
//!
//! Affinity pinning, signal masking and hardware thread-count resolution live
//! here so the scheduler code stays platform agnostic.

use std::thread;

/// Hints the CPU that the caller is in a spin-wait loop.
///
/// Emits `PAUSE` on x86 and `YIELD` on ARM, which lowers contention between
/// hyper-threads sharing a core.
#[inline(always)]
pub fn cpu_yield() {
    std::hint::spin_loop();
}

/// Number of hardware threads reported by the OS, never less than one.
pub fn hardware_thread_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolves a requested fiber thread count into an actual one.
///
/// * a positive value is used as is,
/// * `0` means one thread per hardware thread,
/// * a negative value leaves that many hardware threads free.
///
/// The result is always at least one.
pub fn resolve_thread_count(requested: i32) -> usize {
    resolve_thread_count_for(requested, hardware_thread_count())
}

pub(crate) fn resolve_thread_count_for(requested: i32, hardware_threads: usize) -> usize {
    let hardware_threads = hardware_threads.max(1);
    match requested {
        n if n > 0 => n as usize,
        0 => hardware_threads,
        n => hardware_threads
            .saturating_sub(n.unsigned_abs() as usize)
            .max(1),
    }
}

/// Pins the calling thread to the logical core `core_index`.
///
/// Indices past the number of cores wrap around. Returns `false` when the
/// platform refuses or exposes no core list (macOS, for example).
pub fn set_current_thread_affinity(core_index: usize) -> bool {
    match core_affinity::get_core_ids() {
        Some(core_ids) if !core_ids.is_empty() => {
            let core = core_ids[core_index % core_ids.len()];
            core_affinity::set_for_current(core)
        }
        _ => false,
    }
}

/// Blocks every asynchronous signal on the calling thread.
///
/// Signal handlers would otherwise run on top of whatever fiber stack the
/// thread happens to be hosting.
#[cfg(unix)]
pub fn block_current_thread_signals() -> bool {
    // SAFETY: `mask` is a plain local initialised by `sigfillset` before use.
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        if libc::sigfillset(&mut mask) != 0 {
            return false;
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) == 0
    }
}

/// Blocks every asynchronous signal on the calling thread.
#[cfg(not(unix))]
pub fn block_current_thread_signals() -> bool {
    true
}
