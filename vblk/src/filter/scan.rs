//! Background scanning prefetcher.
//!
//! A worker thread sweeps the image issuing cache requests from
//! offset 0 upward in `scan_size` steps.  When the client reads ahead
//! of the sweep, a notification skips the cursor forward rather than
//! replaying the past; a process-wide clock optionally lets later
//! connections resume where earlier ones stopped.
//!
//! Scanning only runs on the default export, and only when the
//! backend advertises native cache support and the parallel thread
//! model; otherwise the filter is inert.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::backend::{Backend, CacheCapability, Flags, Next, ThreadModel};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// Where a later connection's sweep resumes from.
static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Configuration for [`ScanFilter`].
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    /// Skip the sweep ahead when the client reads faster than it.
    pub ahead: bool,
    /// Resume from the shared clock instead of offset 0.
    pub clock: bool,
    /// Restart from the beginning after completing a sweep.
    pub forever: bool,
    /// Bytes prefetched per step; a power of two in 512..=32M.
    pub size: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { ahead: true, clock: true, forever: false, size: 2 * 1024 * 1024 }
    }
}

/// Commands sent to the sweeping thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// The client read up to this offset; skip ahead if behind.
    NotifyRead {
        /// End offset of the client read.
        offset: u64,
    },
    /// Exit.
    Quit,
}

/// The scan filter.
pub struct ScanFilter {
    /// The underlying backend.
    next: Next,
    /// Whether the sweep is running for this connection.
    running: bool,
    /// Skip-ahead enabled.
    ahead: bool,
    /// Pending commands; polled by the sweep between prefetches.
    commands: Arc<Mutex<Vec<Command>>>,
    /// The sweeping thread, joined on finalize/drop.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanFilter {
    /// Creates the filter and starts the sweep when the chain
    /// supports it.
    pub fn new(next: Next, config: &ScanConfig) -> Result<Self> {
        if !(512..=32 * 1024 * 1024).contains(&config.size) || !config.size.is_power_of_two() {
            return Err(Error::invalid("scan-size parameter should be [512..32M] and a power of two"));
        }
        let supported = next.thread_model() == ThreadModel::Parallel
            && next.can_cache().is_ok_and(|c| c == CacheCapability::Native);
        if !supported {
            tracing::warn!(
                "scan: backend does not support cache requests or the parallel thread \
                 model, not scanning"
            );
        }
        let commands = Arc::new(Mutex::new(Vec::new()));
        let worker = if supported {
            let next = Arc::clone(&next);
            let commands = Arc::clone(&commands);
            let config = *config;
            Some(
                std::thread::Builder::new()
                    .name("scan".to_owned())
                    .spawn(move || sweep(next.as_ref(), &commands, &config))?,
            )
        } else {
            None
        };
        Ok(Self {
            next,
            running: supported,
            ahead: config.ahead,
            commands,
            worker: Mutex::new(worker),
        })
    }

    /// Sends a command to the sweep.
    fn send(&self, cmd: Command) {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).push(cmd);
    }

    /// Stops the sweep and joins the thread.
    fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            self.send(Command::Quit);
            let _ = handle.join();
        }
    }
}

impl Drop for ScanFilter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ScanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanFilter").field("running", &self.running).finish_non_exhaustive()
    }
}

/// The sweep: prefetch from the starting offset upward, draining
/// commands between steps.
fn sweep(next: &dyn Backend, commands: &Mutex<Vec<Command>>, config: &ScanConfig) {
    // Without the size there is nothing useful to do.
    let Ok(size) = next.get_size() else {
        return;
    };
    let step = u64::from(config.size);
    loop {
        let mut offset = if config.clock { CLOCK.load(Ordering::Relaxed) } else { 0 };
        while offset < size {
            // Execute any queued commands.
            for cmd in commands.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
                match cmd {
                    Command::Quit => {
                        tracing::debug!("scan: exiting on connection close");
                        return;
                    }
                    Command::NotifyRead { offset: client } => {
                        // The client is ahead of us: skip forward
                        // rather than replay the past.
                        if offset < client {
                            offset = client;
                        }
                    }
                }
            }
            CLOCK.fetch_max(offset, Ordering::Relaxed);
            if offset < size {
                let n = u32::try_from(step.min(size - offset)).unwrap_or(u32::MAX);
                // Prefetch errors are advisory only.
                let _ = next.cache(n, offset, Flags::NONE);
            }
            offset += step;
        }
        if !config.forever {
            break;
        }
        CLOCK.store(0, Ordering::Relaxed);
    }
    tracing::debug!("scan: finished scanning");
}

impl Backend for ScanFilter {
    fn name(&self) -> &'static str {
        "scan"
    }

    forward_backend!(
        next: preconnect, prepare,
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

    fn finalize(&self) -> Result<()> {
        self.stop();
        self.next.finalize()
    }

    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
        if self.ahead && self.running {
            self.send(Command::NotifyRead { offset: offset + buf.len() as u64 });
        }
        self.next.pread(buf, offset, flags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    /// Memory plugin recording the highest prefetched offset.
    #[derive(Debug)]
    struct Watcher {
        inner: MemoryPlugin,
        max_cached_end: AtomicU64,
    }

    impl Backend for Watcher {
        fn name(&self) -> &'static str {
            "watcher"
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

        fn cache(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
            self.max_cached_end.fetch_max(offset + u64::from(count), Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn sweep_covers_the_image() {
        CLOCK.store(0, Ordering::Relaxed);
        let plugin = Arc::new(Watcher {
            inner: MemoryPlugin::new("sparse", 8 << 20).unwrap(),
            max_cached_end: AtomicU64::new(0),
        });
        let config = ScanConfig { clock: false, ..ScanConfig::default() };
        let f = ScanFilter::new((Arc::clone(&plugin) as Arc<dyn Backend>), &config).unwrap();
        // Wait for the sweep to pass the end of the image.
        for _ in 0..1000 {
            if plugin.max_cached_end.load(Ordering::Relaxed) >= 8 << 20 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(plugin.max_cached_end.load(Ordering::Relaxed), 8 << 20);
        drop(f);
    }

    #[test]
    fn rejects_bad_scan_size() {
        let plugin = Arc::new(Watcher {
            inner: MemoryPlugin::new("sparse", 1 << 20).unwrap(),
            max_cached_end: AtomicU64::new(0),
        });
        let bad = ScanConfig { size: 1000, ..ScanConfig::default() };
        assert!(ScanFilter::new(plugin, &bad).is_err());
    }
}
