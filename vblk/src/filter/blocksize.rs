//! Block-size adapter.
//!
//! Lets clients issue requests of any size and alignment against a
//! backend that requires a minimum block size.  Upstream it
//! advertises `minimum = 1`, `maximum = 2³² − 1`; downstream every
//! request is split into an optional unaligned head, aligned middle
//! requests capped at `maxdata` (or `maxlen` for trim/zero), and an
//! optional unaligned tail.
//!
//! Unaligned pieces go through a single process-wide 64 KiB bounce
//! buffer.  The buffer's reader/writer lock is held exclusively while
//! the bounce buffer is in use and shared for aligned writes, so an
//! aligned write cannot land between the read and write halves of a
//! bounced read-modify-write.

use std::sync::{PoisonError, RwLock};

use vblk_alloc::Extents;
use vblk_alloc::util::{round_down, round_up};

use crate::backend::{Backend, BlockSizeConstraints, Flags, FuaCapability, Next, extents_full};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// Largest permitted `minblock`, and the bounce buffer size.
const MINBLOCK_LIMIT: u32 = 64 * 1024;

/// The process-wide bounce buffer for unaligned heads and tails.
static BOUNCE: RwLock<[u8; MINBLOCK_LIMIT as usize]> = RwLock::new([0; MINBLOCK_LIMIT as usize]);

/// Configuration for [`BlocksizeFilter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BlocksizeConfig {
    /// Minimum block size forced on the backend; a power of two up to
    /// 64 KiB.  Zero derives it from the backend's constraints.
    pub minblock: u32,
    /// Maximum size of a single read/write passed down; zero means
    /// 64 MiB.
    pub maxdata: u32,
    /// Maximum size of a single trim/zero passed down; zero means the
    /// largest multiple of `minblock` fitting in 32 bits.
    pub maxlen: u32,
}

/// The block-size adapter.
#[derive(Debug)]
pub struct BlocksizeFilter {
    /// The underlying backend.
    next: Next,
    /// Effective minimum block size.
    minblock: u32,
    /// Effective read/write cap.
    maxdata: u32,
    /// Effective trim/zero cap.
    maxlen: u32,
}

impl BlocksizeFilter {
    /// Creates the filter, clamping the configured values against the
    /// backend's reported constraints.
    pub fn new(next: Next, config: &BlocksizeConfig) -> Result<Self> {
        if config.minblock != 0 {
            if !config.minblock.is_power_of_two() {
                return Err(Error::invalid("minblock must be a power of 2"));
            }
            if config.minblock > MINBLOCK_LIMIT {
                return Err(Error::invalid(format!("minblock must not exceed {MINBLOCK_LIMIT}")));
            }
        }
        if config.maxdata != 0 && config.minblock != 0 && config.maxdata % config.minblock != 0 {
            return Err(Error::invalid("maxdata must be a multiple of minblock"));
        }
        if config.maxlen != 0 && config.minblock != 0 && config.maxlen % config.minblock != 0 {
            return Err(Error::invalid("maxlen must be a multiple of minblock"));
        }

        let constraints = next.block_size()?;
        let minblock = config.minblock.max(1).max(constraints.minimum);
        if minblock > MINBLOCK_LIMIT {
            return Err(Error::invalid(format!(
                "backend minimum block size {minblock} exceeds the supported limit"
            )));
        }
        let mut maxdata = match (config.maxdata, config.maxlen) {
            (0, 0) => 64 * 1024 * 1024,
            (0, maxlen) => maxlen.min(64 * 1024 * 1024),
            (maxdata, _) => maxdata,
        };
        if constraints.maximum != 0 {
            maxdata = maxdata.min(constraints.maximum);
        }
        maxdata = round_down(u64::from(maxdata), u64::from(minblock)) as u32;
        let maxlen = if config.maxlen == 0 {
            // The largest multiple of minblock that fits in 32 bits.
            0u32.wrapping_sub(minblock)
        } else {
            round_down(u64::from(config.maxlen), u64::from(minblock)) as u32
        };
        tracing::debug!(minblock, maxdata, maxlen, "blocksize: effective values");
        Ok(Self { next, minblock, maxdata, maxlen })
    }

    /// The effective minimum block size.
    pub const fn minblock(&self) -> u32 {
        self.minblock
    }

    /// Offset of `offs` within its block.
    const fn in_block(&self, offs: u64) -> u32 {
        (offs % self.minblock as u64) as u32
    }
}

impl Backend for BlocksizeFilter {
    fn name(&self) -> &'static str {
        "blocksize"
    }

    forward_backend!(
        next: preconnect, prepare,
        finalize,
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
        flush,
    );

    fn get_size(&self) -> Result<u64> {
        // Round down so the tail partial block is invisible upstream.
        let size = self.next.get_size()?;
        Ok(round_down(size, u64::from(self.minblock)))
    }

    fn block_size(&self) -> Result<BlockSizeConstraints> {
        // Clients may send any size; this filter adapts.
        let c = self.next.block_size()?;
        Ok(BlockSizeConstraints {
            minimum: 1,
            preferred: c.preferred.max(4096).max(self.minblock),
            maximum: u32::MAX,
        })
    }

    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
        let minblock = u64::from(self.minblock);
        let mut buf = buf;
        let mut offs = offset;

        // Unaligned head.
        let lead = self.in_block(offs) as usize;
        if lead != 0 {
            let mut bounce = BOUNCE.write().unwrap_or_else(PoisonError::into_inner);
            let keep = (self.minblock as usize - lead).min(buf.len());
            self.next.pread(&mut bounce[..self.minblock as usize], offs - lead as u64, flags)?;
            buf[..keep].copy_from_slice(&bounce[lead..lead + keep]);
            buf = &mut buf[keep..];
            offs += keep as u64;
        }

        // Aligned body.
        while buf.len() as u64 >= minblock {
            let keep =
                (self.maxdata as usize).min(round_down(buf.len() as u64, minblock) as usize);
            self.next.pread(&mut buf[..keep], offs, flags)?;
            buf = &mut buf[keep..];
            offs += keep as u64;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            let mut bounce = BOUNCE.write().unwrap_or_else(PoisonError::into_inner);
            self.next.pread(&mut bounce[..self.minblock as usize], offs, flags)?;
            let n = buf.len();
            buf.copy_from_slice(&bounce[..n]);
        }
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
        let minblock = u64::from(self.minblock);
        let mut flags = flags;
        let mut need_flush = false;
        if flags.fua && self.next.can_fua()? == FuaCapability::Emulate {
            flags.fua = false;
            need_flush = true;
        }
        let mut buf = buf;
        let mut offs = offset;

        // Unaligned head: read-modify-write through the bounce buffer
        // under the exclusive lock.
        let lead = self.in_block(offs) as usize;
        if lead != 0 {
            let mut bounce = BOUNCE.write().unwrap_or_else(PoisonError::into_inner);
            let keep = (self.minblock as usize - lead).min(buf.len());
            let base = offs - lead as u64;
            self.next.pread(&mut bounce[..self.minblock as usize], base, Flags::NONE)?;
            bounce[lead..lead + keep].copy_from_slice(&buf[..keep]);
            self.next.pwrite(&bounce[..self.minblock as usize], base, flags)?;
            buf = &buf[keep..];
            offs += keep as u64;
        }

        // Aligned body, under the shared lock so it cannot interleave
        // with a bounced read-modify-write.
        while buf.len() as u64 >= minblock {
            let keep =
                (self.maxdata as usize).min(round_down(buf.len() as u64, minblock) as usize);
            {
                let _shared = BOUNCE.read().unwrap_or_else(PoisonError::into_inner);
                self.next.pwrite(&buf[..keep], offs, flags)?;
            }
            buf = &buf[keep..];
            offs += keep as u64;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            let mut bounce = BOUNCE.write().unwrap_or_else(PoisonError::into_inner);
            self.next.pread(&mut bounce[..self.minblock as usize], offs, Flags::NONE)?;
            bounce[..buf.len()].copy_from_slice(buf);
            self.next.pwrite(&bounce[..self.minblock as usize], offs, flags)?;
        }

        if need_flush {
            return self.next.flush(Flags::NONE);
        }
        Ok(())
    }

    fn trim(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let mut flags = flags;
        let mut need_flush = false;
        if flags.fua && self.next.can_fua()? == FuaCapability::Emulate {
            flags.fua = false;
            need_flush = true;
        }
        let mut count = u64::from(count);
        let mut offs = offset;

        // Unaligned head and tail are simply ignored: trimming less
        // than requested is always allowed.
        let lead = u64::from(self.in_block(offs));
        if lead != 0 {
            let keep = (u64::from(self.minblock) - lead).min(count);
            offs += keep;
            count -= keep;
        }
        count = round_down(count, u64::from(self.minblock));

        while count > 0 {
            let _shared = BOUNCE.read().unwrap_or_else(PoisonError::into_inner);
            let keep = count.min(u64::from(self.maxlen)) as u32;
            self.next.trim(keep, offs, flags)?;
            offs += u64::from(keep);
            count -= u64::from(keep);
        }
        if need_flush {
            return self.next.flush(Flags::NONE);
        }
        Ok(())
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        if flags.fast_zero {
            // If the transaction would be split, a late ENOTSUP would
            // be needlessly delayed behind earlier calls: declare
            // anything that cannot be done in one backend call not
            // fast.
            let misaligned = (offset | u64::from(count)) % u64::from(self.minblock) != 0;
            if misaligned || count > self.maxlen {
                return Err(Error::Unsupported("fast zero would require splitting"));
            }
        }
        let mut flags = flags;
        let mut need_flush = false;
        if flags.fua && self.next.can_fua()? == FuaCapability::Emulate {
            flags.fua = false;
            need_flush = true;
        }
        let mut count = u64::from(count);
        let mut offs = offset;

        // Unaligned head: read-modify-write zeroes through the bounce
        // buffer.  MAY_TRIM is dropped because we write explicit data.
        let lead = self.in_block(offs) as usize;
        if lead != 0 {
            let mut bounce = BOUNCE.write().unwrap_or_else(PoisonError::into_inner);
            let keep = ((self.minblock as usize - lead) as u64).min(count) as usize;
            let base = offs - lead as u64;
            self.next.pread(&mut bounce[..self.minblock as usize], base, Flags::NONE)?;
            bounce[lead..lead + keep].fill(0);
            self.next.pwrite(
                &bounce[..self.minblock as usize],
                base,
                Flags { may_trim: false, ..flags },
            )?;
            offs += keep as u64;
            count -= keep as u64;
        }

        // Aligned body.
        while count >= u64::from(self.minblock) {
            let _shared = BOUNCE.read().unwrap_or_else(PoisonError::into_inner);
            let keep = count
                .min(u64::from(self.maxlen))
                .min(round_down(count, u64::from(self.minblock))) as u32;
            self.next.zero(keep, offs, flags)?;
            offs += u64::from(keep);
            count -= u64::from(keep);
        }

        // Unaligned tail.
        if count > 0 {
            let mut bounce = BOUNCE.write().unwrap_or_else(PoisonError::into_inner);
            self.next.pread(&mut bounce[..self.minblock as usize], offs, Flags::NONE)?;
            bounce[..count as usize].fill(0);
            self.next.pwrite(
                &bounce[..self.minblock as usize],
                offs,
                Flags { may_trim: false, ..flags },
            )?;
        }

        if need_flush {
            return self.next.flush(Flags::NONE);
        }
        Ok(())
    }

    fn extents(&self, count: u32, offset: u64, flags: Flags, out: &mut Extents) -> Result<()> {
        // Ask the backend for aligned data; copying into the caller's
        // collector truncates the unaligned ends.  Querying at most
        // maxlen is fine since partial progress is allowed.
        let minblock = u64::from(self.minblock);
        let aligned_offset = round_down(offset, minblock);
        let aligned_count = round_up(offset + u64::from(count), minblock) - aligned_offset;
        let aligned_count =
            u32::try_from(aligned_count.min(u64::from(self.maxlen))).unwrap_or(self.maxlen);
        let sub = extents_full(self.next.as_ref(), aligned_count, aligned_offset, flags)?;
        for e in sub {
            out.append(e.offset, e.length, e.flags)?;
        }
        Ok(())
    }

    fn cache(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let minblock = u64::from(self.minblock);
        // Round the request out to whole blocks; this can exceed
        // 32 bits.
        let head = u64::from(self.in_block(offset));
        let mut offs = offset - head;
        let mut remaining = round_up(u64::from(count) + head, minblock);
        while remaining > 0 {
            let limit = remaining.min(u64::from(self.maxdata)) as u32;
            self.next.cache(limit, offs, flags)?;
            offs += u64::from(limit);
            remaining -= u64::from(limit);
        }
        Ok(())
    }
}
