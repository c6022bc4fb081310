//! The overlay block store behind the cow filter.
//!
//! A large sparse scratch file the size of the underlying device
//! holds every block that has diverged from the origin.  A 2-bit
//! state per block records whether the block is:
//!
//! - `NotAllocated` (0) — read through to the origin,
//! - `Allocated` (1) — served from the overlay,
//! - `Trimmed` (3) — reads as zeroes, no backing.
//!
//! These operations always work on whole, aligned blocks; callers
//! turn smaller requests into read-modify-write cycles.  The origin
//! is assumed to return the same immutable data for every read of the
//! same range, which is what makes the state run batching below safe.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use vblk_alloc::Bitmap;
use vblk_alloc::util::round_up;

use crate::backend::{Backend, CacheCapability, Flags};
use crate::{Result, scratch};

/// Per-block overlay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlockState {
    /// Not present in the overlay; reads go to the origin.
    NotAllocated,
    /// Present in the overlay.
    Allocated,
    /// Trimmed: reads as zeroes.
    Trimmed,
}

impl BlockState {
    /// Decodes the 2-bit encoding (the `2` pattern is reserved).
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Allocated,
            3 => Self::Trimmed,
            _ => Self::NotAllocated,
        }
    }

    /// The 2-bit encoding.
    const fn bits(self) -> u8 {
        match self {
            Self::NotAllocated => 0,
            Self::Allocated => 1,
            Self::Trimmed => 3,
        }
    }
}

/// What a cache (prefetch) request should do per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CacheMode {
    /// Do nothing.
    Ignore,
    /// Forward the cache request to the origin.
    Passthrough,
    /// Read the origin (populating OS caches), discard the data.
    Read,
    /// Read the origin and store the block in the overlay.
    Cow,
}

/// Bitmap and size, guarded together.
#[derive(Debug)]
struct State {
    /// 2 bits per block.
    bitmap: Bitmap,
    /// Size of the underlying device in bytes.
    size: u64,
}

/// The overlay scratch file plus block state.
#[derive(Debug)]
pub(super) struct Overlay {
    /// Block size in bytes.
    blksize: u64,
    /// The unlinked scratch file.
    file: File,
    /// Block state; this lock is held only for bitmap access, never
    /// across origin I/O.
    state: Mutex<State>,
}

impl Overlay {
    /// Creates an empty overlay with the given block size.
    pub fn new(blksize: u64) -> Result<Self> {
        Ok(Self {
            blksize,
            file: scratch::scratch_file()?,
            state: Mutex::new(State { bitmap: Bitmap::new(blksize, 2), size: 0 }),
        })
    }

    /// Block size in bytes.
    pub const fn blksize(&self) -> u64 {
        self.blksize
    }

    /// Locks the block state, recovering from poisoning.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resizes the overlay file and bitmap for a device of
    /// `new_size` bytes.
    pub fn set_size(&self, new_size: u64) -> Result<()> {
        let mut state = self.lock();
        state.size = new_size;
        state.bitmap.resize(new_size);
        self.file.set_len(round_up(new_size, self.blksize))?;
        Ok(())
    }

    /// State of one block, for extent reporting.
    pub fn status(&self, blknum: u64) -> BlockState {
        BlockState::from_bits(self.lock().bitmap.get_block(blknum, 0))
    }

    /// Reads `nrblocks` whole blocks starting at `blknum` into `buf`.
    ///
    /// Consecutive blocks in the same state are handled as one run:
    /// one origin read, one overlay read, or one memset.  With
    /// `cow_on_read`, origin data is also written to the overlay and
    /// the blocks flip to `Allocated`.
    ///
    /// The state may change under a concurrent writer while an origin
    /// read is in flight, returning the older data; a read issued
    /// after a write returns always sees the new data.
    pub fn read_blocks(
        &self,
        next: &dyn Backend,
        blknum: u64,
        nrblocks: u64,
        buf: &mut [u8],
        cow_on_read: bool,
    ) -> Result<()> {
        let mut blknum = blknum;
        let mut nrblocks = nrblocks;
        let mut buf = buf;
        while nrblocks > 0 {
            let (state, runblocks, size) = {
                let guard = self.lock();
                let state = BlockState::from_bits(guard.bitmap.get_block(blknum, 0));
                let mut run = 1;
                while run < nrblocks
                    && BlockState::from_bits(guard.bitmap.get_block(blknum + run, 0)) == state
                {
                    run += 1;
                }
                (state, run, guard.size)
            };
            let offset = blknum * self.blksize;
            let runbytes = (runblocks * self.blksize) as usize;
            let (chunk, rest) = buf.split_at_mut(runbytes);
            tracing::trace!(blknum, runblocks, ?state, "cow read run");

            match state {
                BlockState::NotAllocated => {
                    // The tail block past the end of the device reads
                    // as zero.
                    let n = runbytes.min(size.saturating_sub(offset) as usize);
                    next.pread(&mut chunk[..n], offset, Flags::NONE)?;
                    chunk[n..].fill(0);
                    if cow_on_read {
                        self.file.write_all_at(chunk, offset)?;
                        let mut guard = self.lock();
                        for b in 0..runblocks {
                            guard.bitmap.set_block(blknum + b, BlockState::Allocated.bits());
                        }
                    }
                }
                BlockState::Allocated => self.file.read_exact_at(chunk, offset)?,
                BlockState::Trimmed => chunk.fill(0),
            }

            blknum += runblocks;
            nrblocks -= runblocks;
            buf = rest;
        }
        Ok(())
    }

    /// Reads one whole block.
    pub fn read_block(
        &self,
        next: &dyn Backend,
        blknum: u64,
        buf: &mut [u8],
        cow_on_read: bool,
    ) -> Result<()> {
        self.read_blocks(next, blknum, 1, buf, cow_on_read)
    }

    /// Writes one whole block to the overlay, marking it allocated.
    pub fn write_block(&self, blknum: u64, buf: &[u8]) -> Result<()> {
        let offset = blknum * self.blksize;
        self.file.write_all_at(buf, offset)?;
        self.lock().bitmap.set_block(blknum, BlockState::Allocated.bits());
        Ok(())
    }

    /// Marks one whole block trimmed; it reads as zeroes afterwards.
    pub fn trim_block(&self, blknum: u64) {
        self.lock().bitmap.set_block(blknum, BlockState::Trimmed.bits());
    }

    /// Handles a cache (prefetch) request for one block.
    pub fn cache_block(
        &self,
        next: &dyn Backend,
        blknum: u64,
        scratch: &mut [u8],
        mode: CacheMode,
    ) -> Result<()> {
        let offset = blknum * self.blksize;
        let (state, size) = {
            let guard = self.lock();
            (BlockState::from_bits(guard.bitmap.get_block(blknum, 0)), guard.size)
        };
        if state != BlockState::NotAllocated {
            // Already in the overlay (or trimmed): nothing to fetch.
            return Ok(());
        }
        let n = (self.blksize as usize).min(size.saturating_sub(offset) as usize);
        match mode {
            CacheMode::Ignore => Ok(()),
            CacheMode::Passthrough => next.cache(n as u32, offset, Flags::NONE),
            CacheMode::Read => next.pread(&mut scratch[..n], offset, Flags::NONE),
            CacheMode::Cow => {
                next.pread(&mut scratch[..n], offset, Flags::NONE)?;
                scratch[n..].fill(0);
                self.file.write_all_at(scratch, offset)?;
                self.lock().bitmap.set_block(blknum, BlockState::Allocated.bits());
                Ok(())
            }
        }
    }
}

/// Maps the origin's cache capability to the per-block action.
pub(super) fn cache_mode_for(capability: CacheCapability, cow_on_cache: bool) -> CacheMode {
    if cow_on_cache {
        return CacheMode::Cow;
    }
    match capability {
        CacheCapability::None => CacheMode::Ignore,
        CacheCapability::Emulate => CacheMode::Read,
        CacheCapability::Native => CacheMode::Passthrough,
    }
}
