//! Copy-on-write overlay filter.
//!
//! Opens the underlying backend read-only and layers a scratch-file
//! overlay over it: reads fall through to the origin until a block is
//! written, written blocks live in the overlay, trimmed blocks read
//! as zero.  The overlay is anonymous and evaporates on exit, so FUA
//! and flush are deliberately no-ops.
//!
//! Block-aligned requests touch the bitmap briefly; requests with
//! unaligned edges do a read-modify-write serialized by a dedicated
//! lock, which should be rare for well-behaved clients.

mod blk;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use blk::{BlockState, Overlay};
use vblk_alloc::util::{parse_bool, round_down, round_up};
use vblk_alloc::{ExtentFlags, Extents};

use crate::backend::{
    Backend, BlockSizeConstraints, CacheCapability, Flags, FuaCapability, Next, extents_full,
};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// When reads populate the overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CowOnRead {
    /// Never (the default): reads do not mutate overlay state.
    #[default]
    Off,
    /// Always.
    On,
    /// Only while the given path exists, probed per request.
    WhenPathExists(PathBuf),
}

impl FromStr for CowOnRead {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(Self::WhenPathExists(PathBuf::from(s)));
        }
        Ok(if parse_bool(s)? { Self::On } else { Self::Off })
    }
}

/// Configuration for [`CowFilter`].
#[derive(Debug, Clone)]
pub struct CowConfig {
    /// Overlay block size; a power of two, at least 4096.
    pub block_size: u64,
    /// Whether reads populate the overlay.
    pub on_read: CowOnRead,
    /// Whether cache (prefetch) requests populate the overlay.
    pub on_cache: bool,
}

impl Default for CowConfig {
    fn default() -> Self {
        Self { block_size: 65536, on_read: CowOnRead::Off, on_cache: false }
    }
}

/// The copy-on-write filter.
#[derive(Debug)]
pub struct CowFilter {
    /// The read-only origin.
    next: Next,
    /// Overlay file and block state.
    overlay: Overlay,
    /// Read-population mode.
    on_read: CowOnRead,
    /// Prefetch-population mode.
    on_cache: bool,
    /// Serializes read-modify-write sequences on unaligned edges.
    rmw_lock: Mutex<()>,
}

impl CowFilter {
    /// Creates the filter over `next`.
    pub fn new(next: Next, config: &CowConfig) -> Result<Self> {
        let blksize = config.block_size;
        if !(4096..=u64::from(u32::MAX)).contains(&blksize) || !blksize.is_power_of_two() {
            return Err(Error::invalid(
                "cow-block-size is out of range (4096..2G) or not a power of 2",
            ));
        }
        Ok(Self {
            next,
            overlay: Overlay::new(blksize)?,
            on_read: config.on_read.clone(),
            on_cache: config.on_cache,
            rmw_lock: Mutex::new(()),
        })
    }

    /// Whether cow-on-read is active right now.
    fn cow_on_read(&self) -> bool {
        match &self.on_read {
            CowOnRead::Off => false,
            CowOnRead::On => true,
            CowOnRead::WhenPathExists(path) => path.exists(),
        }
    }

    /// Overlay block size.
    fn blksize(&self) -> u64 {
        self.overlay.blksize()
    }
}

impl Backend for CowFilter {
    fn name(&self) -> &'static str {
        "cow"
    }

    forward_backend!(next: preconnect, list_exports, default_export, thread_model, finalize);

    fn prepare(&self, _readonly: bool) -> Result<()> {
        // The origin is always opened read-only; every change lives in
        // the overlay.
        self.next.prepare(true)?;
        // Force an early size query so the overlay file and bitmap are
        // sized before any other operation.
        self.get_size()?;
        Ok(())
    }

    fn get_size(&self) -> Result<u64> {
        let size = self.next.get_size()?;
        tracing::debug!(size, "cow: underlying size");
        self.overlay.set_size(size)?;
        Ok(size)
    }

    fn block_size(&self) -> Result<BlockSizeConstraints> {
        let mut c = self.next.block_size()?;
        if c.minimum == 0 {
            // No constraints from the origin.
            return Ok(BlockSizeConstraints {
                minimum: 1,
                preferred: u32::try_from(self.blksize()).unwrap_or(u32::MAX),
                maximum: u32::MAX,
            });
        }
        if u64::from(c.maximum) >= self.blksize() {
            c.preferred = c.preferred.max(u32::try_from(self.blksize()).unwrap_or(u32::MAX));
        }
        Ok(c)
    }

    fn can_write(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_trim(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_extents(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_flush(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_fua(&self) -> Result<FuaCapability> {
        // Nothing is durable here by design, so FUA is a free no-op.
        Ok(FuaCapability::Native)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        // Probe the origin now so later cache calls cannot fail, even
        // though the answer is overridden.
        self.next.can_cache()?;
        Ok(CacheCapability::Native)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        // The overlay is shared, so connections are consistent.
        Ok(true)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        // Advertise support even though every fast-zero is rejected.
        Ok(true)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _flags: Flags) -> Result<()> {
        let blksize = self.blksize();
        let mut buf = buf;
        let mut blknum = offset / blksize;
        let blkoffs = offset % blksize;
        let cor = self.cow_on_read();

        // Unaligned head.
        if blkoffs != 0 {
            let n = ((blksize - blkoffs) as usize).min(buf.len());
            let mut block = vec![0u8; blksize as usize];
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            buf[..n].copy_from_slice(&block[blkoffs as usize..blkoffs as usize + n]);
            buf = &mut buf[n..];
            blknum += 1;
        }

        // Aligned body.
        let nrblocks = buf.len() as u64 / blksize;
        if nrblocks > 0 {
            let n = (nrblocks * blksize) as usize;
            self.overlay.read_blocks(self.next.as_ref(), blknum, nrblocks, &mut buf[..n], cor)?;
            buf = &mut buf[n..];
            blknum += nrblocks;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            let n = buf.len();
            let mut block = vec![0u8; blksize as usize];
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            buf.copy_from_slice(&block[..n]);
        }
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, _flags: Flags) -> Result<()> {
        // The FUA flag is deliberately ignored: the overlay is scratch.
        let blksize = self.blksize();
        let mut buf = buf;
        let mut blknum = offset / blksize;
        let blkoffs = offset % blksize;
        let cor = self.cow_on_read();

        // Unaligned head: read-modify-write under the RMW lock.
        if blkoffs != 0 {
            let n = ((blksize - blkoffs) as usize).min(buf.len());
            let _rmw = self.rmw_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut block = vec![0u8; blksize as usize];
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            block[blkoffs as usize..blkoffs as usize + n].copy_from_slice(&buf[..n]);
            self.overlay.write_block(blknum, &block)?;
            buf = &buf[n..];
            blknum += 1;
        }

        // Aligned body.
        while buf.len() as u64 >= blksize {
            self.overlay.write_block(blknum, &buf[..blksize as usize])?;
            buf = &buf[blksize as usize..];
            blknum += 1;
        }

        // Unaligned tail.
        if !buf.is_empty() {
            let _rmw = self.rmw_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut block = vec![0u8; blksize as usize];
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            block[..buf.len()].copy_from_slice(buf);
            self.overlay.write_block(blknum, &block)?;
        }
        Ok(())
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        // next.zero is never consulted, so a zero request is never
        // faster than plain writes.
        if flags.fast_zero {
            return Err(Error::Unsupported("fast zero"));
        }
        let blksize = self.blksize();
        let mut count = u64::from(count);
        let mut blknum = offset / blksize;
        let blkoffs = offset % blksize;
        let cor = self.cow_on_read();
        let mut block = vec![0u8; blksize as usize];

        // Unaligned head: read-modify-write.
        if blkoffs != 0 {
            let n = (blksize - blkoffs).min(count);
            let _rmw = self.rmw_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            block[blkoffs as usize..(blkoffs + n) as usize].fill(0);
            self.overlay.write_block(blknum, &block)?;
            count -= n;
            blknum += 1;
        }

        // Aligned body: write whole zero blocks.
        if count >= blksize {
            block.fill(0);
        }
        while count >= blksize {
            self.overlay.write_block(blknum, &block)?;
            count -= blksize;
            blknum += 1;
        }

        // Unaligned tail.
        if count > 0 {
            let _rmw = self.rmw_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            block[..count as usize].fill(0);
            self.overlay.write_block(blknum, &block)?;
        }
        Ok(())
    }

    fn trim(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        let blksize = self.blksize();
        let mut count = u64::from(count);
        let mut blknum = offset / blksize;
        let blkoffs = offset % blksize;
        let cor = self.cow_on_read();
        let mut block = vec![0u8; blksize as usize];

        // Unaligned head: zero via read-modify-write.
        if blkoffs != 0 {
            let n = (blksize - blkoffs).min(count);
            let _rmw = self.rmw_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            block[blkoffs as usize..(blkoffs + n) as usize].fill(0);
            self.overlay.write_block(blknum, &block)?;
            count -= n;
            blknum += 1;
        }

        // Aligned body: flip whole blocks to trimmed.
        while count >= blksize {
            self.overlay.trim_block(blknum);
            count -= blksize;
            blknum += 1;
        }

        // Unaligned tail: zero via read-modify-write.
        if count > 0 {
            let _rmw = self.rmw_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.overlay.read_block(self.next.as_ref(), blknum, &mut block, cor)?;
            block[..count as usize].fill(0);
            self.overlay.write_block(blknum, &block)?;
        }
        Ok(())
    }

    fn flush(&self, _flags: Flags) -> Result<()> {
        // Deliberately ignored: the overlay never survives the process.
        Ok(())
    }

    fn cache(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        let blksize = self.blksize();
        let mode = blk::cache_mode_for(self.next.can_cache()?, self.on_cache);
        let blkoffs = offset % blksize;
        // Round the range out to whole blocks; rounding can exceed
        // 32 bits, so track the remainder in 64.
        let mut remaining = round_up(u64::from(count) + blkoffs, blksize);
        let mut blknum = (offset - blkoffs) / blksize;
        let mut scratch = vec![0u8; blksize as usize];
        while remaining > 0 {
            self.overlay.cache_block(self.next.as_ref(), blknum, &mut scratch, mode)?;
            remaining -= blksize;
            blknum += 1;
        }
        Ok(())
    }

    fn extents(&self, count: u32, offset: u64, flags: Flags, out: &mut Extents) -> Result<()> {
        let blksize = self.blksize();
        let can_extents = self.next.can_extents()?;
        // Align the query to whole blocks; count is at most 32 bits so
        // rounding up cannot overflow.
        let end = round_up(offset + u64::from(count), blksize);
        let mut offset = round_down(offset, blksize);
        let mut count = end - offset;
        let mut blknum = offset / blksize;

        while count > 0 {
            let state = self.overlay.status(blknum);
            match state {
                // Present in the overlay.
                BlockState::Allocated | BlockState::Trimmed => {
                    let flags = if state == BlockState::Trimmed {
                        ExtentFlags::HOLE_ZERO
                    } else {
                        ExtentFlags::DATA
                    };
                    out.append(offset, blksize, flags)?;
                    blknum += 1;
                    offset += blksize;
                    count -= blksize;
                }
                // Not present, but the origin can tell us.  Batch as
                // many consecutive not-allocated blocks as possible
                // into one query: per-block queries are pathological
                // for slow origins.
                BlockState::NotAllocated if can_extents => {
                    let range_offset = offset;
                    let mut range_count: u64 = 0;
                    loop {
                        if range_count >= u64::from(u32::MAX) - blksize + 1 {
                            break;
                        }
                        blknum += 1;
                        offset += blksize;
                        count -= blksize;
                        range_count += blksize;
                        if count == 0 {
                            break;
                        }
                        if self.overlay.status(blknum) != BlockState::NotAllocated {
                            break;
                        }
                    }
                    // Don't ask past the end of the origin.
                    let size = self.next.get_size()?;
                    let range_count = range_count.min(size.saturating_sub(range_offset));
                    if range_count > 0 {
                        let sub = extents_full(
                            self.next.as_ref(),
                            u32::try_from(range_count).unwrap_or(u32::MAX),
                            range_offset,
                            flags,
                        )?;
                        for e in sub {
                            out.append(e.offset, e.length, e.flags)?;
                        }
                    }
                }
                // Otherwise assume the block is non-sparse.
                BlockState::NotAllocated => {
                    out.append(offset, blksize, ExtentFlags::DATA)?;
                    blknum += 1;
                    offset += blksize;
                    count -= blksize;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    fn cow_over_memory(size: u64) -> CowFilter {
        let mem = Arc::new(MemoryPlugin::new("sparse", size).unwrap());
        let cow = CowFilter::new(mem, &CowConfig::default()).unwrap();
        cow.prepare(false).unwrap();
        cow
    }

    #[test]
    fn write_read_round_trip() {
        let cow = cow_over_memory(1 << 20);
        let data = vec![0xA5u8; 100_000];
        cow.pwrite(&data, 12345, Flags::NONE).unwrap();
        let mut back = vec![0u8; data.len()];
        cow.pread(&mut back, 12345, Flags::NONE).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn reads_fall_through_to_origin() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        mem.pwrite(&[7u8; 1000], 500, Flags::NONE).unwrap();
        let cow = CowFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), &CowConfig::default()).unwrap();
        cow.prepare(false).unwrap();
        let mut buf = [0u8; 1000];
        cow.pread(&mut buf, 500, Flags::NONE).unwrap();
        assert_eq!(buf, [7u8; 1000]);
    }

    #[test]
    fn writes_do_not_touch_the_origin() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        let cow = CowFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), &CowConfig::default()).unwrap();
        cow.prepare(false).unwrap();
        cow.pwrite(&[9u8; 4096], 0, Flags::NONE).unwrap();
        let mut origin = [0xFFu8; 4096];
        mem.pread(&mut origin, 0, Flags::NONE).unwrap();
        assert_eq!(origin, [0u8; 4096]);
    }

    #[test]
    fn trim_then_write_scenario() {
        // Trim a 64 KiB block, then write 16 KiB of 0xAB at its start:
        // the block must read as 16 KiB of 0xAB then 48 KiB of zero.
        let cow = cow_over_memory(1 << 20);
        cow.pwrite(&vec![0x11u8; 65536], 0, Flags::NONE).unwrap();
        cow.trim(65536, 0, Flags::NONE).unwrap();
        cow.pwrite(&vec![0xABu8; 16384], 0, Flags::NONE).unwrap();
        let mut buf = vec![0u8; 65536];
        cow.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf[..16384].iter().all(|&b| b == 0xAB));
        assert!(buf[16384..].iter().all(|&b| b == 0));
    }

    #[test]
    fn trim_then_read_is_zero() {
        let cow = cow_over_memory(1 << 20);
        let mem_data = vec![0x55u8; 65536];
        cow.pwrite(&mem_data, 0, Flags::NONE).unwrap();
        cow.trim(65536, 0, Flags::NONE).unwrap();
        let mut buf = vec![0xFFu8; 65536];
        cow.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn unaligned_write_preserves_neighbours() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        mem.pwrite(&[3u8; 200], 0, Flags::NONE).unwrap();
        let cow = CowFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), &CowConfig::default()).unwrap();
        cow.prepare(false).unwrap();
        cow.pwrite(&[8u8; 10], 50, Flags::NONE).unwrap();
        let mut buf = [0u8; 200];
        cow.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(&buf[..50], &[3u8; 50][..]);
        assert_eq!(&buf[50..60], &[8u8; 10][..]);
        assert_eq!(&buf[60..200], &[3u8; 140][..]);
    }

    #[test]
    fn reads_without_cow_on_read_do_not_allocate() {
        let cow = cow_over_memory(1 << 20);
        let mut buf = [0u8; 4096];
        cow.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(cow.overlay.status(0), BlockState::NotAllocated);
    }

    #[test]
    fn cow_on_read_allocates() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        let cow = CowFilter::new(
            mem,
            &CowConfig { on_read: CowOnRead::On, ..CowConfig::default() },
        )
        .unwrap();
        cow.prepare(false).unwrap();
        let mut buf = [0u8; 65536];
        cow.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(cow.overlay.status(0), BlockState::Allocated);
    }

    #[test]
    fn extents_reflect_overlay_state() {
        let cow = cow_over_memory(1 << 20);
        cow.pwrite(&vec![1u8; 65536], 0, Flags::NONE).unwrap();
        cow.trim(65536, 65536, Flags::NONE).unwrap();
        let mut out = Extents::new(3 * 65536, 0);
        cow.extents(3 * 65536, 0, Flags::NONE, &mut out).unwrap();
        let v = out.into_vec();
        // Written block, then the trimmed block coalesced with the
        // untouched block behind it (both report as holes).
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].flags, ExtentFlags::DATA);
        assert_eq!(v[0].length, 65536);
        assert_eq!(v[1].flags, ExtentFlags::HOLE_ZERO);
        assert_eq!(v[1].length, 2 * 65536);
    }

    #[test]
    fn fast_zero_is_rejected() {
        let cow = cow_over_memory(1 << 20);
        let err = cow.zero(4096, 0, Flags { fast_zero: true, ..Flags::NONE }).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn tail_past_end_of_image_reads_zero() {
        // Image smaller than a cow block: the tail must be zero-filled.
        let cow = cow_over_memory(1000);
        let mut buf = vec![0xEEu8; 1000];
        cow.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
