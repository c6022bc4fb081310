//! The cache block store.
//!
//! An unlinked scratch file holds cached blocks; a 2-bit state per
//! block records whether it is absent (0), cached and clean (1), or
//! cached and dirty (3 — the remaining encoding is reserved).  All
//! operations here work on whole blocks of the store's block size,
//! which is the larger of the configured minimum and the scratch
//! filesystem's block size so that hole punching actually releases
//! space.

use std::fs::File;
use std::os::unix::fs::FileExt;

use vblk_alloc::Bitmap;
use vblk_alloc::util::round_up;

use super::lru::Lru;
use super::reclaim::Reclaim;
use super::{CacheMode, ReclaimConfig};
use crate::backend::{Backend, Flags};
use crate::{Result, scratch};

/// Per-block cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlockState {
    /// Not in the cache.
    NotCached,
    /// Cached, in sync with the backend.
    Clean,
    /// Cached, newer than the backend.
    Dirty,
}

impl BlockState {
    /// Decodes the 2-bit encoding.
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Clean,
            3 => Self::Dirty,
            _ => Self::NotCached,
        }
    }

    /// The 2-bit encoding.  `NotCached` must be zero: the reclaim
    /// scan treats any non-zero state as "present".
    const fn bits(self) -> u8 {
        match self {
            Self::NotCached => 0,
            Self::Clean => 1,
            Self::Dirty => 3,
        }
    }
}

/// The scratch file plus all cache bookkeeping.  The owning filter
/// wraps this in one mutex held across bitmap and file operations.
#[derive(Debug)]
pub(super) struct CacheStore {
    /// The unlinked cache file.
    file: File,
    /// Cache block size in bytes.
    blksize: u64,
    /// 2-bit block states.
    bitmap: Bitmap,
    /// Recently-accessed tracking.
    lru: Lru,
    /// Eviction state machine.
    reclaim: Reclaim,
    /// Reclaim thresholds.
    limits: ReclaimConfig,
    /// Size of the underlying device in bytes.
    size: u64,
}

impl CacheStore {
    /// Creates the store, picking the block size.
    ///
    /// A small block size keeps bitmap memory down, but it must be at
    /// least the filesystem block size for hole punching to reclaim
    /// real space.
    pub fn new(min_block_size: u64, limits: ReclaimConfig) -> Result<Self> {
        let file = scratch::scratch_file()?;
        let blksize = min_block_size.max(fs_block_size(&file));
        tracing::debug!(blksize, "cache: block size");
        Ok(Self {
            file,
            blksize,
            bitmap: Bitmap::new(blksize, 2),
            lru: Lru::new(blksize),
            reclaim: Reclaim::new(),
            limits,
            size: 0,
        })
    }

    /// Cache block size in bytes.
    pub const fn blksize(&self) -> u64 {
        self.blksize
    }

    /// Resizes the bitmap, LRU and scratch file for a device of
    /// `new_size` bytes.
    pub fn set_size(&mut self, new_size: u64) -> Result<()> {
        self.size = new_size;
        self.bitmap.resize(new_size);
        self.file.set_len(round_up(new_size, self.blksize))?;
        self.lru.set_size(new_size, self.blksize, self.limits.max_size);
        Ok(())
    }

    /// State of one block.
    pub fn state(&self, blknum: u64) -> BlockState {
        BlockState::from_bits(self.bitmap.get_block(blknum, 0))
    }

    /// Runs a reclaim step; called on every path that can grow the
    /// cache file.
    pub fn reclaim(&mut self) {
        self.reclaim.run(
            &self.file,
            &mut self.bitmap,
            &self.lru,
            self.blksize,
            self.limits.max_size,
            self.limits.hi_thresh,
            self.limits.lo_thresh,
        );
    }

    /// Reads `nrblocks` whole blocks starting at `blknum` into `buf`,
    /// fetching runs of uncached blocks from the backend in one read.
    /// With `cache_on_read`, fetched data is stored and marked clean.
    pub fn read_multiple(
        &mut self,
        next: &dyn Backend,
        blknum: u64,
        nrblocks: u64,
        buf: &mut [u8],
        cache_on_read: bool,
    ) -> Result<()> {
        self.reclaim();
        self.read_multiple_inner(next, blknum, nrblocks, buf, cache_on_read)
    }

    /// As [`CacheStore::read_multiple`] without the reclaim step.
    fn read_multiple_inner(
        &mut self,
        next: &dyn Backend,
        blknum: u64,
        nrblocks: u64,
        buf: &mut [u8],
        cache_on_read: bool,
    ) -> Result<()> {
        let mut blknum = blknum;
        let mut nrblocks = nrblocks;
        let mut buf = buf;
        while nrblocks > 0 {
            // How many of the following blocks share this block's
            // cached/uncached state?  Process the run in one go.
            let not_cached = self.state(blknum) == BlockState::NotCached;
            let mut runblocks = 1;
            while runblocks < nrblocks
                && (self.state(blknum + runblocks) == BlockState::NotCached) == not_cached
            {
                runblocks += 1;
            }
            let offset = blknum * self.blksize;
            let runbytes = (runblocks * self.blksize) as usize;
            let (chunk, rest) = buf.split_at_mut(runbytes);
            tracing::trace!(blknum, runblocks, not_cached, "cache read run");

            if not_cached {
                // Read the backend, zero-filling the partial block at
                // the very end of the device.
                let n = runbytes.min(self.size.saturating_sub(offset) as usize);
                next.pread(&mut chunk[..n], offset, Flags::NONE)?;
                chunk[n..].fill(0);
                if cache_on_read {
                    self.file.write_all_at(chunk, offset)?;
                    for b in 0..runblocks {
                        self.bitmap.set_block(blknum + b, BlockState::Clean.bits());
                        self.lru.touch(blknum + b);
                    }
                }
            } else {
                self.file.read_exact_at(chunk, offset)?;
                for b in 0..runblocks {
                    self.lru.touch(blknum + b);
                }
            }

            blknum += runblocks;
            nrblocks -= runblocks;
            buf = rest;
        }
        Ok(())
    }

    /// Reads one whole block.
    pub fn read_block(
        &mut self,
        next: &dyn Backend,
        blknum: u64,
        buf: &mut [u8],
        cache_on_read: bool,
    ) -> Result<()> {
        self.read_multiple(next, blknum, 1, buf, cache_on_read)
    }

    /// Writes one whole block to both the cache and the backend,
    /// marking it clean.  The backend write is clipped at the device
    /// size (the cache always stores whole blocks).
    pub fn write_through(
        &mut self,
        next: &dyn Backend,
        blknum: u64,
        buf: &[u8],
        flags: Flags,
    ) -> Result<()> {
        let offset = blknum * self.blksize;
        self.reclaim();
        tracing::trace!(blknum, "cache: writethrough");
        self.file.write_all_at(buf, offset)?;
        let n = buf.len().min(self.size.saturating_sub(offset) as usize);
        next.pwrite(&buf[..n], offset, flags)?;
        self.bitmap.set_block(blknum, BlockState::Clean.bits());
        self.lru.touch(blknum);
        Ok(())
    }

    /// Writes one whole block according to the cache mode: through to
    /// the backend for writethrough (and FUA writes under writeback),
    /// else into the cache only, marking the block dirty.
    pub fn write_block(
        &mut self,
        next: &dyn Backend,
        blknum: u64,
        buf: &[u8],
        flags: Flags,
        mode: CacheMode,
    ) -> Result<()> {
        if mode == CacheMode::Writethrough || (mode == CacheMode::Writeback && flags.fua) {
            return self.write_through(next, blknum, buf, flags);
        }
        let offset = blknum * self.blksize;
        self.reclaim();
        tracing::trace!(blknum, "cache: writeback");
        self.file.write_all_at(buf, offset)?;
        self.bitmap.set_block(blknum, BlockState::Dirty.bits());
        self.lru.touch(blknum);
        Ok(())
    }

    /// Handles a cache (prefetch) request for one block: fetch and
    /// store uncached blocks regardless of cache-on-read, touch
    /// already-cached blocks.
    pub fn cache_block(
        &mut self,
        next: &dyn Backend,
        blknum: u64,
        scratch: &mut [u8],
    ) -> Result<()> {
        self.reclaim();
        let offset = blknum * self.blksize;
        let state = self.state(blknum);
        tracing::trace!(blknum, ?state, "cache: prefetch");
        if state == BlockState::NotCached {
            let n = scratch.len().min(self.size.saturating_sub(offset) as usize);
            next.pread(&mut scratch[..n], offset, Flags::NONE)?;
            scratch[n..].fill(0);
            self.file.write_all_at(scratch, offset)?;
            self.bitmap.set_block(blknum, BlockState::Clean.bits());
        }
        self.lru.touch(blknum);
        Ok(())
    }

    /// The next block at or after `from` that is cached and dirty.
    pub fn next_dirty(&self, from: u64) -> Option<u64> {
        let mut blk = from;
        while let Some(found) = self.bitmap.next_nonzero(blk) {
            if self.state(found) == BlockState::Dirty {
                return Some(found);
            }
            blk = found + 1;
        }
        None
    }

    /// Reads one block straight from the cache file (the block must
    /// be cached).
    pub fn read_cached(&self, blknum: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, blknum * self.blksize)?;
        Ok(())
    }
}

/// The block size of the filesystem holding the scratch file.
#[cfg(unix)]
fn fs_block_size(file: &File) -> u64 {
    match nix::sys::statvfs::fstatvfs(file) {
        Ok(vfs) => u64::from(vfs.block_size()),
        Err(e) => {
            tracing::debug!(error = %e, "cache: fstatvfs failed, assuming 4096");
            4096
        }
    }
}

#[cfg(not(unix))]
fn fs_block_size(_file: &File) -> u64 {
    4096
}
