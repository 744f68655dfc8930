//! Best-effort page-residency hints and the background prefetch worker.
//!
//! Prefetching is never load-bearing for correctness: every failure is
//! swallowed, and on platforms without a residency primitive the hint is a
//! no-op that reports `false`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};

use log::trace;

/// Issues a blocking `madvise(MADV_WILLNEED)`-style hint for `[ptr, ptr+bytes)`.
/// Returns whether the kernel accepted the hint.
pub fn advise_willneed(ptr: *const u8, bytes: usize) -> bool {
    if ptr.is_null() || bytes == 0 {
        return false;
    }
    residency::willneed(ptr, bytes)
}

#[cfg(unix)]
mod residency {
    pub(super) fn willneed(ptr: *const u8, bytes: usize) -> bool {
        let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        // madvise requires a page-aligned start address.
        let addr = ptr as usize;
        let start = addr & !(page - 1);
        let len = bytes + (addr - start);
        // SAFETY: rounding down to the containing page keeps the range
        // inside the mapping that holds `ptr`; MADV_WILLNEED does not write.
        unsafe { libc::madvise(start as *mut libc::c_void, len, libc::MADV_WILLNEED) == 0 }
    }
}

#[cfg(not(unix))]
mod residency {
    pub(super) fn willneed(_ptr: *const u8, _bytes: usize) -> bool {
        false
    }
}

struct State {
    queue: VecDeque<(usize, usize)>,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    work_available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-wide prefetch coordinator: an unbounded FIFO of byte ranges
/// drained by a single worker thread. Enqueued ranges receive one
/// best-effort residency hint each; failures are ignored. A range whose
/// mapping has meanwhile gone away degrades to a failed hint — the kernel
/// validates addresses, nothing is dereferenced.
pub struct Prefetcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static PREFETCHER: OnceLock<Prefetcher> = OnceLock::new();

impl Prefetcher {
    /// The lazily started singleton instance.
    pub fn global() -> &'static Prefetcher {
        PREFETCHER.get_or_init(Prefetcher::start)
    }

    fn start() -> Prefetcher {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: true,
            }),
            work_available: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("weight-prefetch".to_string())
            .spawn(move || worker_loop(&worker_shared))
            .ok();
        Prefetcher {
            shared,
            worker: Mutex::new(handle),
        }
    }

    /// Queues one byte range for a background residency hint. Silently does
    /// nothing after `shutdown`.
    pub fn enqueue(&self, ptr: *const u8, bytes: usize) {
        if ptr.is_null() || bytes == 0 {
            return;
        }
        let mut state = self.shared.lock();
        if !state.running {
            return;
        }
        state.queue.push_back((ptr as usize, bytes));
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Stops the worker after it drains the pending queue, then joins it.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.running = false;
        }
        self.shared.work_available.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let item = {
            let mut state = shared.lock();
            loop {
                if let Some(item) = state.queue.pop_front() {
                    break Some(item);
                }
                if !state.running {
                    break None;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        match item {
            Some((addr, bytes)) => {
                let accepted = advise_willneed(addr as *const u8, bytes);
                trace!("prefetch hint for {bytes} bytes at {addr:#x}: accepted={accepted}");
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_drains_queue_before_shutdown() {
        let prefetcher = Prefetcher::start();
        let data = vec![0u8; 8192];
        for chunk in data.chunks(1024) {
            prefetcher.enqueue(chunk.as_ptr(), chunk.len());
        }
        prefetcher.shutdown();
        assert!(prefetcher.shared.lock().queue.is_empty());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let prefetcher = Prefetcher::start();
        prefetcher.shutdown();
        prefetcher.shutdown();
    }

    #[test]
    fn enqueue_after_shutdown_is_ignored() {
        let prefetcher = Prefetcher::start();
        prefetcher.shutdown();
        let data = vec![0u8; 64];
        prefetcher.enqueue(data.as_ptr(), data.len());
        assert!(prefetcher.shared.lock().queue.is_empty());
    }

    #[test]
    fn null_and_empty_ranges_are_rejected() {
        let prefetcher = Prefetcher::start();
        prefetcher.enqueue(std::ptr::null(), 128);
        let data = vec![0u8; 64];
        prefetcher.enqueue(data.as_ptr(), 0);
        assert!(prefetcher.shared.lock().queue.is_empty());
        prefetcher.shutdown();
    }

    #[test]
    fn sync_hint_reports_a_result() {
        let data = vec![0u8; 4096];
        // On Unix this may be accepted or not depending on the allocation;
        // the call must simply not crash and must return for null input.
        let _ = advise_willneed(data.as_ptr(), data.len());
        assert!(!advise_willneed(std::ptr::null(), 4096));
    }
}
