//! Approximate LRU tracking over cache blocks.
//!
//! Two 1-bit bitmaps answer in O(1): "was this block among the last
//! ~N distinct blocks accessed?"  A touch sets the block in `bm[0]`;
//! when `bm[0]` accumulates N/2 bits the bitmaps rotate and `bm[0]`
//! is cleared.  A block counts as recently accessed when set in
//! either bitmap, so in truth between N/2 and N blocks are tracked —
//! `bm[1]` is the last chance for blocks about to age out.  A finer
//! estimate would need more bitmaps; this is a heuristic, so memory
//! use wins.
//!
//! ```text
//!    bm[0]
//! ┌───────────────────────┐
//! │  X    XX   X   XXX    │ c0 bits set
//! └───────────────────────┘
//!    bm[1]
//! ┌───────────────────────┐
//! │   X    XX  X   X      │
//! └───────────────────────┘
//! ```

use vblk_alloc::Bitmap;

/// The rotating-bitmap LRU structure.
#[derive(Debug)]
pub(super) struct Lru {
    /// `bm[0]` collects current accesses, `bm[1]` holds the previous
    /// window.
    bm: [Bitmap; 2],
    /// Bits set in `bm[0]`.
    c0: u64,
    /// Window size N.
    window: u64,
}

impl Lru {
    /// Creates the structure for the given cache block size.
    pub fn new(blksize: u64) -> Self {
        Self { bm: [Bitmap::new(blksize, 1), Bitmap::new(blksize, 1)], c0: 0, window: 100 }
    }

    /// Resizes for a disk of `disk_size` bytes and recomputes the
    /// window: about a quarter of the maximum cache size (or of the
    /// whole disk when no maximum is set), at least 100 blocks.
    pub fn set_size(&mut self, disk_size: u64, blksize: u64, max_size: Option<u64>) {
        self.bm[0].resize(disk_size);
        self.bm[1].resize(disk_size);
        let budget = max_size.unwrap_or(disk_size);
        self.window = (budget / blksize / 4).max(100);
    }

    /// Records an access to `blk`.
    pub fn touch(&mut self, blk: u64) {
        // Already counted in the current window.
        if self.bm[0].get_block(blk, 0) != 0 {
            return;
        }
        self.bm[0].set_block(blk, 1);
        self.c0 += 1;

        // Rotate: swapping moves the allocation, not the bits, and
        // the fresh bm[0] is cleared immediately after.
        if self.c0 >= self.window / 2 {
            self.bm.swap(0, 1);
            self.bm[0].clear();
            self.c0 = 0;
        }
    }

    /// Whether `blk` was accessed within the current tracking window.
    pub fn recently_accessed(&self, blk: u64) -> bool {
        self.bm[0].get_block(blk, 0) != 0 || self.bm[1].get_block(blk, 0) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_and_query() {
        let mut lru = Lru::new(4096);
        lru.set_size(1000 * 4096, 4096, None);
        assert!(!lru.recently_accessed(5));
        lru.touch(5);
        assert!(lru.recently_accessed(5));
    }

    #[test]
    fn old_blocks_age_out_after_two_rotations() {
        let mut lru = Lru::new(4096);
        lru.set_size(10_000 * 4096, 4096, Some(4096 * 400)); // window = 100
        lru.touch(1);
        // 50 distinct touches rotate once; 100 rotate twice.
        for blk in 100..200 {
            lru.touch(blk);
        }
        assert!(!lru.recently_accessed(1));
        // Recent blocks from the last window are still tracked.
        assert!(lru.recently_accessed(199));
    }
}
