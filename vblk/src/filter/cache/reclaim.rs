//! Cache space reclamation.
//!
//! When the scratch file's allocated size exceeds the high threshold
//! of the configured maximum, blocks are evicted by punching holes
//! until the allocated size drops below the low threshold.  Eviction
//! prefers blocks that are not recently used (`ReclaimingLru`); once
//! a full scan finds nothing but recently-used blocks, any block goes
//! (`ReclaimingAny`).  Each call reclaims at most two blocks so the
//! cost is spread across ordinary cache operations.

use std::fs::File;

use vblk_alloc::Bitmap;

use super::lru::Lru;

/// The reclaim state machine's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Below the high threshold.
    NotReclaiming,
    /// Evicting least-recently-used blocks.
    ReclaimingLru,
    /// The LRU scan wrapped; evicting anything.
    ReclaimingAny,
}

/// Reclaim bookkeeping.
#[derive(Debug)]
pub(super) struct Reclaim {
    /// Current phase.
    phase: Phase,
    /// The last block examined; scanning resumes after it.
    cursor: u64,
}

impl Reclaim {
    /// Initial state: not reclaiming.
    pub const fn new() -> Self {
        Self { phase: Phase::NotReclaiming, cursor: 0 }
    }

    /// Runs one reclaim step: checks thresholds and evicts up to two
    /// cache blocks.  Failures are logged, not propagated — reclaim
    /// is best-effort and the cache stays correct without it.
    pub fn run(
        &mut self,
        file: &File,
        bitmap: &mut Bitmap,
        lru: &Lru,
        blksize: u64,
        max_size: Option<u64>,
        hi_thresh: u32,
        lo_thresh: u32,
    ) {
        // Without a configured maximum there is nothing to do.
        let Some(max_size) = max_size else {
            return;
        };

        let allocated = match allocated_size(file) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "cache: cannot stat scratch file");
                return;
            }
        };

        if self.phase == Phase::NotReclaiming {
            if allocated < max_size / 100 * u64::from(hi_thresh) {
                return;
            }
            tracing::debug!(allocated, "cache: start reclaiming");
            self.phase = Phase::ReclaimingLru;
        } else if allocated < max_size / 100 * u64::from(lo_thresh) {
            tracing::debug!(allocated, "cache: stop reclaiming");
            self.phase = Phase::NotReclaiming;
            return;
        }

        // Reclaim up to two blocks per entry point.
        self.reclaim_one(file, bitmap, lru, blksize);
        self.reclaim_one(file, bitmap, lru, blksize);
    }

    /// Evicts a single block according to the current phase.
    fn reclaim_one(&mut self, file: &File, bitmap: &mut Bitmap, lru: &Lru, blksize: u64) {
        if self.phase == Phase::ReclaimingLru {
            self.reclaim_lru(file, bitmap, lru, blksize);
        } else {
            self.reclaim_any(file, bitmap, blksize);
        }
    }

    /// Scans forward for a cached block that is not recently used.
    /// If the scan wraps to its starting point, falls over to
    /// reclaiming any block.
    fn reclaim_lru(&mut self, file: &File, bitmap: &mut Bitmap, lru: &Lru, blksize: u64) {
        let start = match self.next_cached(bitmap, self.cursor + 1) {
            Some(blk) => blk,
            None => match self.next_cached(bitmap, 0) {
                Some(blk) => blk,
                None => {
                    tracing::debug!("cache: run out of blocks to reclaim");
                    return;
                }
            },
        };
        self.cursor = start;
        loop {
            if !lru.recently_accessed(self.cursor) {
                self.evict(file, bitmap, blksize);
                return;
            }
            self.cursor = match self.next_cached(bitmap, self.cursor + 1) {
                Some(blk) => blk,
                None => match self.next_cached(bitmap, 0) {
                    Some(blk) => blk,
                    None => return,
                },
            };
            if self.cursor == start {
                // Everything cached is recently used.
                tracing::debug!("cache: reclaiming any blocks");
                self.phase = Phase::ReclaimingAny;
                self.reclaim_any(file, bitmap, blksize);
                return;
            }
        }
    }

    /// Evicts the next cached block, wrapping at the end.
    fn reclaim_any(&mut self, file: &File, bitmap: &mut Bitmap, blksize: u64) {
        let blk = self
            .next_cached(bitmap, self.cursor + 1)
            .or_else(|| self.next_cached(bitmap, 0));
        match blk {
            Some(blk) => {
                self.cursor = blk;
                self.evict(file, bitmap, blksize);
            }
            None => tracing::debug!("cache: run out of blocks to reclaim"),
        }
    }

    /// The next block at or after `from` present in the cache.
    fn next_cached(&self, bitmap: &Bitmap, from: u64) -> Option<u64> {
        bitmap.next_nonzero(from)
    }

    /// Punches the block at the cursor out of the scratch file and
    /// clears its bitmap entry.
    fn evict(&self, file: &File, bitmap: &mut Bitmap, blksize: u64) {
        tracing::debug!(block = self.cursor, "cache: reclaiming block");
        if let Err(e) = punch_hole(file, self.cursor * blksize, blksize) {
            tracing::debug!(error = %e, "cache: punching hole failed");
            return;
        }
        bitmap.set_block(self.cursor, 0);
    }
}

/// Bytes of real storage allocated to the scratch file.
#[cfg(unix)]
fn allocated_size(file: &File) -> std::io::Result<u64> {
    let st = nix::sys::stat::fstat(file)?;
    #[allow(clippy::cast_sign_loss)]
    Ok(st.st_blocks as u64 * 512)
}

#[cfg(not(unix))]
fn allocated_size(file: &File) -> std::io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Releases `[offset, offset + len)` of the file back to the
/// filesystem while keeping the file size.
#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, len: u64) -> std::io::Result<()> {
    use nix::fcntl::{FallocateFlags, fallocate};
    fallocate(
        file,
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        i64::try_from(offset).unwrap_or(i64::MAX),
        i64::try_from(len).unwrap_or(i64::MAX),
    )?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _offset: u64, _len: u64) -> std::io::Result<()> {
    // No hole punching on this platform; reclaim degrades to only
    // clearing bitmap entries.
    Ok(())
}
