//! Read-ahead prefetching.
//!
//! Each filter instance (one per connection) owns a background worker
//! thread fed through a condition-variable command queue.  Every
//! client read enqueues one cache request for the window following
//! it; the worker issues the `.cache` call so the prefetch overlaps
//! the synchronous read.
//!
//! The window adapts: it doubles while the client consumes past the
//! previous read-ahead, holds on forward progress, and resets to the
//! minimum when the client seeks backwards.
//!
//! The backend must advertise native cache support and the parallel
//! thread model; otherwise the filter stays inert (with a warning)
//! rather than failing.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::backend::{Backend, CacheCapability, Flags, Next, ThreadModel};
use crate::filter::forward_backend;
use crate::Result;

/// Smallest (and initial) read-ahead window.
const READAHEAD_MIN: u64 = 32768;
/// Largest read-ahead window.
const READAHEAD_MAX: u64 = 4 * 1024 * 1024;

/// Commands sent to the background thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Prefetch `[offset, offset + count)`.
    Cache {
        /// Start of the prefetch.
        offset: u64,
        /// Length of the prefetch.
        count: u32,
    },
    /// Finish outstanding work and exit.
    Quit,
}

/// Queue shared between the filter and its worker.
#[derive(Debug, Default)]
struct CommandQueue {
    /// Pending commands.
    commands: Mutex<Vec<Command>>,
    /// Signalled when the queue goes from empty to non-empty.
    cond: Condvar,
}

impl CommandQueue {
    /// Appends a command, waking the worker if it might be sleeping.
    fn send(&self, cmd: Command) {
        let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        commands.push(cmd);
        if commands.len() == 1 {
            self.cond.notify_one();
        }
    }

    /// Blocks until a command is available and takes the oldest one.
    fn recv(&self) -> Command {
        let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if !commands.is_empty() {
                return commands.remove(0);
            }
            commands = self.cond.wait(commands).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Read-ahead window state.
#[derive(Debug)]
struct Window {
    /// Current window size in bytes.
    window: u64,
    /// Offset of the last client read.
    last_offset: u64,
    /// End of the last issued read-ahead.
    last_readahead: u64,
}

/// The read-ahead filter.
pub struct ReadaheadFilter {
    /// The underlying backend.
    next: Next,
    /// Whether the chain supports prefetching at all.
    working: bool,
    /// Adaptive window, shared across requests on this connection.
    window: Mutex<Window>,
    /// Commands for the worker.
    queue: std::sync::Arc<CommandQueue>,
    /// The worker thread, joined on drop.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReadaheadFilter {
    /// Creates the filter and starts its background worker.
    pub fn new(next: Next) -> Result<Self> {
        let queue = std::sync::Arc::new(CommandQueue::default());
        let worker_queue = std::sync::Arc::clone(&queue);
        let worker_next = std::sync::Arc::clone(&next);
        let worker = std::thread::Builder::new()
            .name("readahead".to_owned())
            .spawn(move || worker_loop(&*worker_next, &worker_queue))?;
        // The backend must offer native cache support and tolerate
        // parallel requests; otherwise stay inert rather than fail.
        let working = next.can_cache().is_ok_and(|c| c == CacheCapability::Native)
            && next.thread_model() == ThreadModel::Parallel;
        if !working {
            tracing::warn!(
                "readahead: backend does not support cache requests or the parallel \
                 thread model, the filter will do nothing"
            );
        }
        Ok(Self {
            next,
            working,
            window: Mutex::new(Window {
                window: READAHEAD_MIN,
                last_offset: 0,
                last_readahead: 0,
            }),
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Locks the window state.
    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReadaheadFilter {
    fn drop(&mut self) {
        self.queue.send(Command::Quit);
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ReadaheadFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadaheadFilter").finish_non_exhaustive()
    }
}

/// The worker: executes cache commands until told to quit.
fn worker_loop(next: &dyn Backend, queue: &CommandQueue) {
    loop {
        match queue.recv() {
            Command::Quit => return,
            Command::Cache { offset, count } => {
                // Errors are ignored: there is nobody to report them
                // to, and read-ahead is only advisory.
                let _ = next.cache(count, offset, Flags::NONE);
            }
        }
    }
}

impl Backend for ReadaheadFilter {
    fn name(&self) -> &'static str {
        "readahead"
    }

    forward_backend!(
        next: preconnect, prepare,
        finalize,
        get_size,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_write,
        can_flush,
        can_trim,
        can_zero,
        can_fast_zero,
        can_extents,
        can_fua,
        can_cache,
        can_multi_conn,
        pwrite,
        flush,
        trim,
        zero,
        extents,
        cache,
    );

    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
        if self.working
            && let Ok(size) = self.next.get_size()
        {
            let command = {
                let mut w = self.window();
                // The window following this read.
                let ra_offset = offset + buf.len() as u64;
                let command = if ra_offset < size {
                    let count =
                        u32::try_from(w.window.min(size - ra_offset)).unwrap_or(u32::MAX);
                    Some(Command::Cache { offset: ra_offset, count })
                } else {
                    None
                };
                // Adapt the window: double while the client has moved
                // past the previous read-ahead, hold on any forward
                // progress, reset on a seek backwards.
                if w.last_readahead < offset {
                    w.window = (w.window * 2).min(READAHEAD_MAX);
                } else if w.last_offset < offset {
                    // Forward progress: keep the window.
                } else {
                    w.window = READAHEAD_MIN;
                }
                w.last_offset = offset;
                w.last_readahead = match command {
                    Some(Command::Cache { offset, count }) => offset + u64::from(count),
                    _ => ra_offset,
                };
                command
            };
            if let Some(cmd) = command {
                self.queue.send(cmd);
            }
        }
        // The synchronous read proceeds regardless.
        self.next.pread(buf, offset, flags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::Result;
    use crate::plugin::memory::MemoryPlugin;

    /// Memory plugin that records cache requests.
    #[derive(Debug)]
    struct CacheCounting {
        inner: MemoryPlugin,
        cached_bytes: AtomicU64,
        cache_calls: AtomicU64,
    }

    impl Backend for CacheCounting {
        fn name(&self) -> &'static str {
            "cache-counting"
        }

        fn get_size(&self) -> Result<u64> {
            self.inner.get_size()
        }

        fn can_cache(&self) -> Result<CacheCapability> {
            Ok(CacheCapability::Native)
        }

        fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
            self.inner.pread(buf, offset, flags)
        }

        fn cache(&self, count: u32, _offset: u64, _flags: Flags) -> Result<()> {
            self.cached_bytes.fetch_add(u64::from(count), Ordering::Relaxed);
            self.cache_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn wait_for_calls(plugin: &CacheCounting, n: u64) {
        for _ in 0..500 {
            if plugin.cache_calls.load(Ordering::Relaxed) >= n {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    #[test]
    fn sequential_reads_prefetch_ahead() {
        let plugin = Arc::new(CacheCounting {
            inner: MemoryPlugin::new("sparse", 64 << 20).unwrap(),
            cached_bytes: AtomicU64::new(0),
            cache_calls: AtomicU64::new(0),
        });
        let f = ReadaheadFilter::new((Arc::clone(&plugin) as Arc<dyn Backend>)).unwrap();
        let mut buf = vec![0u8; 65536];
        let mut offset = 0;
        for _ in 0..4 {
            f.pread(&mut buf, offset, Flags::NONE).unwrap();
            offset += buf.len() as u64;
        }
        wait_for_calls(&plugin, 4);
        assert!(plugin.cache_calls.load(Ordering::Relaxed) >= 4);
        assert!(plugin.cached_bytes.load(Ordering::Relaxed) >= u64::from(u32::try_from(READAHEAD_MIN).unwrap()));
        drop(f); // joins the worker
    }

    #[test]
    fn window_doubles_and_resets() {
        let plugin = Arc::new(CacheCounting {
            inner: MemoryPlugin::new("sparse", 64 << 20).unwrap(),
            cached_bytes: AtomicU64::new(0),
            cache_calls: AtomicU64::new(0),
        });
        let f = ReadaheadFilter::new((Arc::clone(&plugin) as Arc<dyn Backend>)).unwrap();
        let mut buf = vec![0u8; 1 << 20];
        // Consuming far past each read-ahead doubles the window.
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
        f.pread(&mut buf, 4 << 20, Flags::NONE).unwrap();
        assert!(f.window().window > READAHEAD_MIN);
        // A backwards seek resets it.
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(f.window().window, READAHEAD_MIN);
    }

    #[test]
    fn inert_without_native_cache() {
        // The plain memory plugin advertises native cache, so force
        // the opposite with a wrapper.
        #[derive(Debug)]
        struct NoCache(MemoryPlugin);
        impl Backend for NoCache {
            fn name(&self) -> &'static str {
                "nocache"
            }
            fn get_size(&self) -> Result<u64> {
                self.0.get_size()
            }
            fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
                self.0.pread(buf, offset, flags)
            }
        }
        let plugin = Arc::new(NoCache(MemoryPlugin::new("sparse", 1 << 20).unwrap()));
        let f = ReadaheadFilter::new(plugin).unwrap();
        let mut buf = [0u8; 512];
        // Reads still work; no prefetch is attempted.
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
    }
}
