//! Caching filter with write-through/write-back modes and LRU
//! reclamation.
//!
//! Reads and writes are staged in an anonymous scratch file at block
//! granularity:
//!
//! - `writethrough` — writes go to both the cache and the backend.
//! - `writeback` (the default) — writes land in the cache as dirty;
//!   `flush` writes all dirty blocks back, then flushes the backend.
//!   FUA writes go straight through.
//! - `unsafe` — like writeback but `flush` is a no-op; only for
//!   throwaway data.
//!
//! With `max_size` configured, a three-state reclaim machine punches
//! least-recently-used blocks out of the scratch file whenever
//! allocated space crosses the high threshold, stopping below the low
//! threshold.

mod blk;
mod lru;
mod reclaim;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use blk::CacheStore;
use vblk_alloc::util::{parse_bool, round_up};

use crate::backend::{Backend, CacheCapability, Flags, FuaCapability, Next};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// Write policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Writes land in the cache and the backend; blocks stay clean.
    Writethrough,
    /// Writes land in the cache only; flush writes dirty blocks back.
    #[default]
    Writeback,
    /// Writeback with a no-op flush.
    Unsafe,
}

impl FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "writethrough" => Ok(Self::Writethrough),
            "writeback" => Ok(Self::Writeback),
            "unsafe" => Ok(Self::Unsafe),
            _ => Err(Error::invalid(
                "invalid cache parameter, should be writeback|writethrough|unsafe",
            )),
        }
    }
}

/// When reads populate the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CacheOnRead {
    /// Never (the default).
    #[default]
    Off,
    /// Always.
    On,
    /// Only while the given path exists, probed per request.
    WhenPathExists(PathBuf),
}

impl FromStr for CacheOnRead {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(Self::WhenPathExists(PathBuf::from(s)));
        }
        Ok(if parse_bool(s)? { Self::On } else { Self::Off })
    }
}

/// Cache size limit and reclaim thresholds.
#[derive(Debug, Clone, Copy)]
pub(super) struct ReclaimConfig {
    /// Maximum allocated bytes in the scratch file; `None` disables
    /// reclamation.
    pub max_size: Option<u64>,
    /// Percentage of `max_size` where reclaiming starts.
    pub hi_thresh: u32,
    /// Percentage of `max_size` where reclaiming stops.
    pub lo_thresh: u32,
}

/// Configuration for [`CacheFilter`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Write policy.
    pub mode: CacheMode,
    /// Lower bound for the cache block size; a power of two, at least
    /// 4096.  The actual block size is at least the scratch
    /// filesystem's block size.
    pub min_block_size: u64,
    /// Maximum space the cache may keep allocated; `None` (default)
    /// disables reclamation.
    pub max_size: Option<u64>,
    /// Percentage of `max_size` where reclaim begins.
    pub hi_thresh: u32,
    /// Percentage of `max_size` where reclaim ends.
    pub lo_thresh: u32,
    /// Whether plain reads populate the cache.
    pub on_read: CacheOnRead,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Writeback,
            min_block_size: 65536,
            max_size: None,
            hi_thresh: 95,
            lo_thresh: 80,
            on_read: CacheOnRead::Off,
        }
    }
}

/// The caching filter.
#[derive(Debug)]
pub struct CacheFilter {
    /// The underlying backend.
    next: Next,
    /// Write policy.
    mode: CacheMode,
    /// Read-population mode.
    on_read: CacheOnRead,
    /// Block store; this one lock covers the bitmap and the cache
    /// file.  I/O happens while holding it, which is acceptable
    /// because the cache file is local.
    store: Mutex<CacheStore>,
}

impl CacheFilter {
    /// Creates the filter over `next`.
    pub fn new(next: Next, config: &CacheConfig) -> Result<Self> {
        if config.min_block_size < 4096
            || !config.min_block_size.is_power_of_two()
            || config.min_block_size > u64::from(u32::MAX)
        {
            return Err(Error::invalid(
                "cache-min-block-size is not a power of 2, or is too small or too large",
            ));
        }
        if let Some(max) = config.max_size {
            if max < 1024 * 1024 {
                return Err(Error::invalid("cache-max-size is too small"));
            }
            if config.lo_thresh == 0 || config.hi_thresh == 0 {
                return Err(Error::invalid("cache thresholds must be greater than zero"));
            }
            if config.lo_thresh >= config.hi_thresh {
                return Err(Error::invalid(
                    "cache-low-threshold must be less than cache-high-threshold",
                ));
            }
        }
        let limits = ReclaimConfig {
            max_size: config.max_size,
            hi_thresh: config.hi_thresh,
            lo_thresh: config.lo_thresh,
        };
        Ok(Self {
            next,
            mode: config.mode,
            on_read: config.on_read.clone(),
            store: Mutex::new(CacheStore::new(config.min_block_size, limits)?),
        })
    }

    /// Locks the store, recovering from poisoning.
    fn store(&self) -> MutexGuard<'_, CacheStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether cache-on-read is active right now.
    fn cache_on_read(&self) -> bool {
        match &self.on_read {
            CacheOnRead::Off => false,
            CacheOnRead::On => true,
            CacheOnRead::WhenPathExists(path) => path.exists(),
        }
    }

    /// Whether a FUA write must be converted into a trailing flush.
    fn fua_needs_flush(&self, flags: Flags) -> Result<bool> {
        Ok(flags.fua
            && (self.mode == CacheMode::Unsafe || self.next.can_fua()? == FuaCapability::Emulate))
    }

    /// Writes all dirty blocks through to the backend, then flushes
    /// it.  The first failure is reported, later ones are counted.
    fn flush_dirty(&self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        let mut errors = 0u32;
        {
            let mut store = self.store();
            let blksize = store.blksize();
            let mut block = vec![0u8; blksize as usize];
            let mut blk = 0;
            // In writethrough mode there should be no dirty blocks,
            // but walk the map anyway to be sure.
            while let Some(dirty) = store.next_dirty(blk) {
                let r = match store.read_cached(dirty, &mut block) {
                    Ok(()) => {
                        store.write_through(self.next.as_ref(), dirty, &block, Flags::NONE)
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = r {
                    tracing::debug!(block = dirty, error = %e, "cache: flush of block failed");
                    errors += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                blk = dirty + 1;
            }
        }
        // Now ask the underlying backend to persist.
        if let Err(e) = self.next.flush(Flags::NONE) {
            errors += 1;
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => {
                if errors > 1 {
                    tracing::debug!(errors, "cache: flush saw multiple errors");
                }
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl Backend for CacheFilter {
    fn name(&self) -> &'static str {
        "cache"
    }

    forward_backend!(
        next: preconnect, block_size,
        list_exports,
        default_export,
        thread_model,
        finalize,
        can_write,
        can_trim,
        can_extents,
        trim,
        extents,
    );

    fn prepare(&self, readonly: bool) -> Result<()> {
        self.next.prepare(readonly)?;
        // Set the cache file and bitmap sizes before any I/O.
        self.get_size()?;
        Ok(())
    }

    fn get_size(&self) -> Result<u64> {
        let size = self.next.get_size()?;
        tracing::debug!(size, "cache: underlying size");
        self.store().set_size(size)?;
        Ok(size)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        // The caching happens here; the host must not add its own.
        Ok(CacheCapability::Native)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        // Advertise support even though fast-zero is always rejected.
        Ok(true)
    }

    fn can_flush(&self) -> Result<bool> {
        if self.mode == CacheMode::Unsafe {
            return Ok(true);
        }
        self.next.can_flush()
    }

    fn can_fua(&self) -> Result<FuaCapability> {
        if self.mode == CacheMode::Unsafe {
            return Ok(FuaCapability::Native);
        }
        self.next.can_fua()
    }

    fn can_multi_conn(&self) -> Result<bool> {
        // Unsafe: the no-op flush is trivially consistent.  Writeback:
        // one flush writes back every connection's dirty blocks, so a
        // single flush suffices for all.  Writethrough: we are at the
        // mercy of the backend.
        if self.mode == CacheMode::Writethrough {
            return self.next.can_multi_conn();
        }
        Ok(true)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _flags: Flags) -> Result<()> {
        let cor = self.cache_on_read();
        let mut store = self.store();
        let blksize = store.blksize();
        let mut buf = buf;
        let mut blknum = offset / blksize;
        let blkoffs = offset % blksize;

        // Unaligned head.
        if blkoffs != 0 {
            let n = ((blksize - blkoffs) as usize).min(buf.len());
            let mut block = vec![0u8; blksize as usize];
            store.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            buf[..n].copy_from_slice(&block[blkoffs as usize..blkoffs as usize + n]);
            buf = &mut buf[n..];
            blknum += 1;
        }

        // Aligned body.
        let nrblocks = buf.len() as u64 / blksize;
        if nrblocks > 0 {
            let n = (nrblocks * blksize) as usize;
            store.read_multiple(self.next.as_ref(), blknum, nrblocks, &mut buf[..n], cor)?;
            buf = &mut buf[n..];
            blknum += nrblocks;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            let n = buf.len();
            let mut block = vec![0u8; blksize as usize];
            store.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            buf.copy_from_slice(&block[..n]);
        }
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
        let mut flags = flags;
        let need_flush = self.fua_needs_flush(flags)?;
        if need_flush {
            flags.fua = false;
        }
        let cor = self.cache_on_read();
        {
            let mut store = self.store();
            let blksize = store.blksize();
            let mut buf = buf;
            let mut blknum = offset / blksize;
            let blkoffs = offset % blksize;

            // Unaligned head: read-modify-write under the store lock.
            if blkoffs != 0 {
                let n = ((blksize - blkoffs) as usize).min(buf.len());
                let mut block = vec![0u8; blksize as usize];
                store.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
                block[blkoffs as usize..blkoffs as usize + n].copy_from_slice(&buf[..n]);
                store.write_block(self.next.as_ref(), blknum, &block, flags, self.mode)?;
                buf = &buf[n..];
                blknum += 1;
            }

            // Aligned body.
            while buf.len() as u64 >= blksize {
                store.write_block(
                    self.next.as_ref(),
                    blknum,
                    &buf[..blksize as usize],
                    flags,
                    self.mode,
                )?;
                buf = &buf[blksize as usize..];
                blknum += 1;
            }

            // Unaligned tail.
            if !buf.is_empty() {
                let mut block = vec![0u8; blksize as usize];
                store.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
                block[..buf.len()].copy_from_slice(buf);
                store.write_block(self.next.as_ref(), blknum, &block, flags, self.mode)?;
            }
        }
        if need_flush {
            return self.flush(Flags::NONE);
        }
        Ok(())
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        // next.zero is deliberately avoided, so a zero request is
        // never faster than plain writes.
        if flags.fast_zero {
            return Err(Error::Unsupported("fast zero"));
        }
        let mut flags = Flags { may_trim: false, ..flags };
        let need_flush = self.fua_needs_flush(flags)?;
        if need_flush {
            flags.fua = false;
        }
        let cor = self.cache_on_read();
        {
            let mut store = self.store();
            let blksize = store.blksize();
            let mut count = u64::from(count);
            let mut blknum = offset / blksize;
            let blkoffs = offset % blksize;
            let mut block = vec![0u8; blksize as usize];

            // Unaligned head: read-modify-write.
            if blkoffs != 0 {
                let n = (blksize - blkoffs).min(count);
                store.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
                block[blkoffs as usize..(blkoffs + n) as usize].fill(0);
                store.write_block(self.next.as_ref(), blknum, &block, flags, self.mode)?;
                count -= n;
                blknum += 1;
            }

            // Aligned body.
            if count >= blksize {
                block.fill(0);
            }
            while count >= blksize {
                store.write_block(self.next.as_ref(), blknum, &block, flags, self.mode)?;
                count -= blksize;
                blknum += 1;
            }

            // Unaligned tail.
            if count > 0 {
                store.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
                block[..count as usize].fill(0);
                store.write_block(self.next.as_ref(), blknum, &block, flags, self.mode)?;
            }
        }
        if need_flush {
            return self.flush(Flags::NONE);
        }
        Ok(())
    }

    fn flush(&self, _flags: Flags) -> Result<()> {
        if self.mode == CacheMode::Unsafe {
            return Ok(());
        }
        self.flush_dirty()
    }

    fn cache(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        let mut store = self.store();
        let blksize = store.blksize();
        let blkoffs = offset % blksize;
        // Round out to whole blocks; rounding can exceed 32 bits.
        let mut remaining = round_up(u64::from(count) + blkoffs, blksize);
        let mut blknum = (offset - blkoffs) / blksize;
        let mut scratch = vec![0u8; blksize as usize];
        while remaining > 0 {
            store.cache_block(self.next.as_ref(), blknum, &mut scratch)?;
            remaining -= blksize;
            blknum += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    /// A memory-backed plugin that counts writes and flushes.
    #[derive(Debug)]
    struct CountingPlugin {
        inner: MemoryPlugin,
        writes: AtomicU64,
        flushes: AtomicU64,
    }

    impl CountingPlugin {
        fn new(size: u64) -> Self {
            Self {
                inner: MemoryPlugin::new("sparse", size).unwrap(),
                writes: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
            }
        }
    }

    impl Backend for CountingPlugin {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn get_size(&self) -> Result<u64> {
            self.inner.get_size()
        }

        fn can_write(&self) -> Result<bool> {
            Ok(true)
        }

        fn can_flush(&self) -> Result<bool> {
            Ok(true)
        }

        fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
            self.inner.pread(buf, offset, flags)
        }

        fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.inner.pwrite(buf, offset, flags)
        }

        fn flush(&self, _flags: Flags) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn filter(mode: CacheMode, plugin: &Arc<CountingPlugin>) -> CacheFilter {
        let config = CacheConfig { mode, min_block_size: 4096, ..CacheConfig::default() };
        let f = CacheFilter::new((Arc::clone(plugin) as Arc<dyn Backend>), &config).unwrap();
        f.prepare(false).unwrap();
        f
    }

    #[test]
    fn writeback_defers_until_flush() {
        // Three writes to distinct blocks must not touch the backend;
        // one flush writes all three back plus exactly one backend
        // flush.
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        let f = filter(CacheMode::Writeback, &plugin);
        let blksize = f.store().blksize();
        for i in 0..3 {
            f.pwrite(&vec![i as u8 + 1; blksize as usize], i * blksize, Flags::NONE).unwrap();
        }
        assert_eq!(plugin.writes.load(Ordering::Relaxed), 0);

        f.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.writes.load(Ordering::Relaxed), 3);
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 1);

        // The data reached the backend.
        let mut buf = vec![0u8; blksize as usize];
        plugin.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
    }

    #[test]
    fn writethrough_writes_immediately() {
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        let f = filter(CacheMode::Writethrough, &plugin);
        let blksize = f.store().blksize();
        f.pwrite(&vec![7u8; blksize as usize], 0, Flags::NONE).unwrap();
        assert_eq!(plugin.writes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsafe_mode_never_flushes() {
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        let f = filter(CacheMode::Unsafe, &plugin);
        let blksize = f.store().blksize();
        f.pwrite(&vec![7u8; blksize as usize], 0, Flags::NONE).unwrap();
        f.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.writes.load(Ordering::Relaxed), 0);
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reads_are_served_from_cache_after_write() {
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        let f = filter(CacheMode::Writeback, &plugin);
        let data = vec![0x5Au8; 10_000];
        f.pwrite(&data, 12345, Flags::NONE).unwrap();
        let mut back = vec![0u8; data.len()];
        f.pread(&mut back, 12345, Flags::NONE).unwrap();
        assert_eq!(back, data);
        // The backend never saw the write.
        assert_eq!(plugin.writes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fua_write_in_writeback_goes_through() {
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        let f = filter(CacheMode::Writeback, &plugin);
        let blksize = f.store().blksize();
        // A FUA write under writeback is written straight through.
        f.pwrite(&vec![9u8; blksize as usize], 0, Flags { fua: true, ..Flags::NONE }).unwrap();
        assert_eq!(plugin.writes.load(Ordering::Relaxed), 1);
        let mut buf = vec![0u8; blksize as usize];
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 9));
    }

    #[test]
    fn zero_rejects_fast_zero() {
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        let f = filter(CacheMode::Writeback, &plugin);
        let err = f.zero(4096, 0, Flags { fast_zero: true, ..Flags::NONE }).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn unaligned_write_preserves_surroundings() {
        let plugin = Arc::new(CountingPlugin::new(1 << 20));
        plugin.inner.pwrite(&[3u8; 8192], 0, Flags::NONE).unwrap();
        let f = filter(CacheMode::Writeback, &plugin);
        f.pwrite(&[8u8; 10], 100, Flags::NONE).unwrap();
        let mut buf = [0u8; 200];
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(&buf[..100], &[3u8; 100][..]);
        assert_eq!(&buf[100..110], &[8u8; 10][..]);
        assert_eq!(&buf[110..], &[3u8; 90][..]);
    }
}
