//! Deterministic pseudo-random sparse disk.
//!
//! Generates a random-looking layout of data and hole blocks that
//! resembles a real virtual machine image: runs of data separated by
//! runs of holes.  The layout is a two-state Markov chain over 4 KiB
//! blocks.  In state DATA the chain flips to HOLE after each block
//! with probability `P(dh)`, and in state HOLE it flips to DATA with
//! probability `P(hd)`; choosing
//!
//! ```text
//! P(dh) = 1 / runlength_blocks
//! P(hd) = percent · P(dh) / (1 − percent)
//! ```
//!
//! hits the requested percentage of data and mean run length:
//! `% data = P(hd) / (P(hd) + P(dh))`, `mean run = 1 / P(dh)`.
//!
//! Content is deterministic for a given seed: each block's bytes come
//! from a PRNG seeded with `seed + offset`.  Writes verify that the
//! data matches what a read would return, failing with an I/O error
//! otherwise — which makes the plugin a copy-fidelity checker: a copy
//! from one instance into another configured identically must succeed
//! byte for byte.

use vblk_alloc::util::is_zero;
use vblk_alloc::{Bitmap, ExtentFlags, Extents};

use crate::backend::{Backend, CacheCapability, Flags};
use crate::{Error, Result};

/// Layout granularity.  1 bit per 4 KiB block keeps the map at 32 MiB
/// per TiB of virtual disk.
const BLOCK_SIZE: u64 = 4096;

/// Configuration for [`SparseRandomPlugin`].
#[derive(Debug, Clone, Copy)]
pub struct SparseRandomConfig {
    /// Virtual disk size in bytes.
    pub size: u64,
    /// PRNG seed; equal seeds give equal disks.
    pub seed: u32,
    /// Percentage of the disk that is data (0..=100).
    pub percent: f64,
    /// Expected mean length of a data run in bytes.
    pub runlength: u64,
    /// Fully random block contents instead of one repeated byte.
    pub random_content: bool,
}

impl Default for SparseRandomConfig {
    fn default() -> Self {
        Self {
            size: 0,
            seed: 0,
            percent: 10.0,
            runlength: 16 * 1024 * 1024,
            random_content: false,
        }
    }
}

/// xoshiro256** — a small, fast, seedable generator; splitmix64
/// expands the seed into the initial state.
#[derive(Debug, Clone)]
struct Xoshiro256 {
    /// Generator state, never all zero.
    s: [u64; 4],
}

impl Xoshiro256 {
    /// Seeds the state via splitmix64.
    fn new(seed: u64) -> Self {
        let mut x = seed;
        let mut next = || {
            x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = x;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^ (z >> 31)
        };
        Self { s: [next(), next(), next(), next()] }
    }

    /// The next 64 random bits.
    fn next_u64(&mut self) -> u64 {
        let result = self.s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }
}

/// The sparse-random plugin.
#[derive(Debug)]
pub struct SparseRandomPlugin {
    /// Virtual disk size.
    size: u64,
    /// Content seed.
    seed: u32,
    /// Random content per byte, or one byte repeated per block.
    random_content: bool,
    /// 1 bit per block: data (1) or hole (0).  Computed once, then
    /// immutable.
    layout: Bitmap,
}

impl SparseRandomPlugin {
    /// Creates the plugin, generating the block layout.
    pub fn new(config: &SparseRandomConfig) -> Result<Self> {
        if !(0.0..=100.0).contains(&config.percent) {
            return Err(Error::invalid("percent must be between 0 and 100"));
        }
        if config.runlength == 0 {
            return Err(Error::invalid("runlength parameter must be > 0"));
        }
        let mut layout = Bitmap::new(BLOCK_SIZE, 1);
        layout.resize(config.size);

        let blocks = layout.block_count();
        if config.percent == 100.0 {
            for blk in 0..blocks {
                layout.set_block(blk, 1);
            }
        } else if config.percent > 0.0 {
            let p_dh = 1.0 / (config.runlength as f64 / BLOCK_SIZE as f64);
            let fraction = config.percent / 100.0;
            let p_hd = fraction * p_dh / (1.0 - fraction);
            tracing::debug!(p_dh, p_hd, "sparse-random: transition probabilities");

            let mut rng = Xoshiro256::new(u64::from(config.seed));
            let mut state_data = false;
            for blk in 0..blocks {
                if state_data {
                    layout.set_block(blk, 1);
                }
                // Probability of leaving the current state.
                let p = if state_data { p_dh } else { p_hd };
                if (rng.next_u64() as f64) <= p * u64::MAX as f64 {
                    state_data = !state_data;
                }
            }
        }

        Ok(Self {
            size: config.size,
            seed: config.seed,
            random_content: config.random_content,
            layout,
        })
    }

    /// Fills `block` with the deterministic contents of the block at
    /// `offset` (which must be block-aligned).
    fn read_block(&self, blknum: u64, offset: u64, block: &mut [u8]) {
        if self.layout.get_block(blknum, 0) == 0 {
            block.fill(0);
            return;
        }
        let mut rng = Xoshiro256::new(u64::from(self.seed).wrapping_add(offset));
        if self.random_content {
            // Repeatable per offset because reads are whole blocks.
            for b in block.iter_mut() {
                *b = rng.next_u64() as u8;
            }
        } else {
            let mut byte = (rng.next_u64() & 255) as u8;
            if byte == 0 {
                byte = 1;
            }
            block.fill(byte);
        }
    }

    /// The expected contents of one block, via the caller's scratch.
    fn expected<'a>(&self, blknum: u64, offset: u64, scratch: &'a mut [u8]) -> &'a [u8] {
        self.read_block(blknum, offset, scratch);
        scratch
    }
}

impl Backend for SparseRandomPlugin {
    fn name(&self) -> &'static str {
        "sparse-random"
    }

    fn get_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn can_write(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_flush(&self) -> Result<bool> {
        // Nothing is stored, but copy tools want to flush.
        Ok(true)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_extents(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        // Everything is computed; there is nothing to prefetch.
        Ok(CacheCapability::Native)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _flags: Flags) -> Result<()> {
        let mut buf = buf;
        let mut offset = offset;
        let mut blknum = offset / BLOCK_SIZE;
        let blkoffs = (offset % BLOCK_SIZE) as usize;
        let mut block = vec![0u8; BLOCK_SIZE as usize];

        // Unaligned head.
        if blkoffs != 0 {
            let n = (BLOCK_SIZE as usize - blkoffs).min(buf.len());
            self.read_block(blknum, offset - blkoffs as u64, &mut block);
            buf[..n].copy_from_slice(&block[blkoffs..blkoffs + n]);
            buf = &mut buf[n..];
            offset += n as u64;
            blknum += 1;
        }

        // Aligned body.
        while buf.len() >= BLOCK_SIZE as usize {
            let (chunk, rest) = buf.split_at_mut(BLOCK_SIZE as usize);
            self.read_block(blknum, offset, chunk);
            buf = rest;
            offset += BLOCK_SIZE;
            blknum += 1;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            self.read_block(blknum, offset, &mut block);
            let n = buf.len();
            buf.copy_from_slice(&block[..n]);
        }
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, _flags: Flags) -> Result<()> {
        let mismatch = || Error::Io(std::io::Error::other("data written does not match expected"));
        let mut buf = buf;
        let mut offset = offset;
        let mut blknum = offset / BLOCK_SIZE;
        let blkoffs = (offset % BLOCK_SIZE) as usize;
        let mut block = vec![0u8; BLOCK_SIZE as usize];

        // Unaligned head.
        if blkoffs != 0 {
            let n = (BLOCK_SIZE as usize - blkoffs).min(buf.len());
            let expected = self.expected(blknum, offset - blkoffs as u64, &mut block);
            if buf[..n] != expected[blkoffs..blkoffs + n] {
                return Err(mismatch());
            }
            buf = &buf[n..];
            offset += n as u64;
            blknum += 1;
        }

        // Aligned body.
        while buf.len() >= BLOCK_SIZE as usize {
            let (chunk, rest) = buf.split_at(BLOCK_SIZE as usize);
            // Holes compare faster with a plain zero scan.
            if self.layout.get_block(blknum, 0) == 0 {
                if !is_zero(chunk) {
                    return Err(mismatch());
                }
            } else {
                let expected = self.expected(blknum, offset, &mut block);
                if chunk != expected {
                    return Err(mismatch());
                }
            }
            buf = rest;
            offset += BLOCK_SIZE;
            blknum += 1;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            let expected = self.expected(blknum, offset, &mut block);
            if buf != &expected[..buf.len()] {
                return Err(mismatch());
            }
        }
        Ok(())
    }

    fn flush(&self, _flags: Flags) -> Result<()> {
        Ok(())
    }

    fn extents(&self, count: u32, offset: u64, _flags: Flags, out: &mut Extents) -> Result<()> {
        let mut remaining = u64::from(count);
        let mut offset = offset;
        while remaining > 0 {
            let blknum = offset / BLOCK_SIZE;
            let in_block = offset % BLOCK_SIZE;
            let n = remaining.min(BLOCK_SIZE - in_block);
            let flags = if self.layout.get_block(blknum, 0) == 0 {
                ExtentFlags::HOLE_ZERO
            } else {
                ExtentFlags::DATA
            };
            out.append(offset, n, flags)?;
            remaining -= n;
            offset += n;
        }
        Ok(())
    }
}
