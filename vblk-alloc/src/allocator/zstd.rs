//! The compressed allocator: the sparse directory topology with each
//! materialized page held zstd-compressed.
//!
//! The directory works exactly like the sparse allocator's (32 KiB
//! pages, 4096-slot L2 directories, an ordered binary-searched L1),
//! but a non-empty L2 slot points at a compressed payload whose
//! inflated size is always one page.  Reads and partial writes go
//! through a scratch page: look up, inflate (or zero-fill) into the
//! scratch, modify, compress back.  Zeroing releases pages that
//! become entirely zero, as in the sparse allocator.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use zstd::bulk::{Compressor, Decompressor};

use crate::allocator::{Allocator, assert_distinct};
use crate::extent::{ExtentFlags, Extents};
use crate::util::is_zero;
use crate::{Error, Result};

/// Bytes per (uncompressed) page.
const PAGE_SIZE: u64 = 32768;
/// Pages per L2 directory.
const L2_SIZE: usize = 4096;
/// Virtual bytes spanned by one L1 entry (128 MiB).
const L1_SPAN: u64 = PAGE_SIZE * L2_SIZE as u64;

/// An L1 directory entry: a 128 MiB-aligned span and its L2 directory
/// of compressed payloads.
struct L1Entry {
    /// Virtual offset of this entry (a multiple of [`L1_SPAN`]).
    offset: u64,
    /// `L2_SIZE` optional compressed pages.
    l2: Box<[Option<Vec<u8>>]>,
}

impl L1Entry {
    /// A fresh entry whose pages all read as zero.
    fn new(offset: u64) -> Self {
        Self { offset, l2: std::iter::repeat_with(|| None).take(L2_SIZE).collect() }
    }
}

/// Directory and codec state, guarded by the allocator's mutex.
struct Inner {
    /// L1 entries ordered by offset.
    l1: Vec<L1Entry>,
    /// Compression context, reused across pages.
    compressor: Compressor<'static>,
    /// Decompression context, reused across pages.
    decompressor: Decompressor<'static>,
    /// Total bytes handed to the compressor.
    uncompressed_bytes: u64,
    /// Total bytes the compressor produced.
    compressed_bytes: u64,
}

impl Inner {
    /// Binary-searches the L1 directory for the entry covering
    /// `offset`; `Err` carries the insertion point.
    fn l1_index(&self, offset: u64) -> std::result::Result<usize, usize> {
        self.l1.binary_search_by(|e| {
            if offset < e.offset {
                Ordering::Greater
            } else if offset >= e.offset + L1_SPAN {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
    }

    /// The L2 slot covering `offset`, if an L1 entry exists.
    fn slot_mut(&mut self, offset: u64) -> Option<&mut Option<Vec<u8>>> {
        let i = self.l1_index(offset).ok()?;
        let entry = &mut self.l1[i];
        let slot = ((offset - entry.offset) / PAGE_SIZE) as usize;
        Some(&mut entry.l2[slot])
    }

    /// Inflates the page containing `offset` into `scratch`, or
    /// zero-fills it when the page is not materialized.  Cannot fail
    /// on unmapped pages; a mapped page that does not inflate to
    /// exactly one page is corrupt.
    fn lookup_decompress(&mut self, offset: u64, scratch: &mut [u8]) -> Result<()> {
        let Ok(i) = self.l1_index(offset) else {
            scratch.fill(0);
            return Ok(());
        };
        let entry = &self.l1[i];
        let slot = ((offset - entry.offset) / PAGE_SIZE) as usize;
        match &entry.l2[slot] {
            Some(payload) => {
                let n = self
                    .decompressor
                    .decompress_to_buffer(payload, scratch)
                    .map_err(|source| Error::Compression { op: "decompress", source })?;
                if n != PAGE_SIZE as usize {
                    return Err(Error::CorruptPage { got: n, expected: PAGE_SIZE as usize });
                }
            }
            None => scratch.fill(0),
        }
        Ok(())
    }

    /// Compresses `scratch` back into the L2 slot for `offset`,
    /// materializing the L1 entry as needed.
    fn compress(&mut self, offset: u64, scratch: &[u8]) -> Result<()> {
        let i = match self.l1_index(offset) {
            Ok(i) => i,
            Err(i) => {
                let entry_offset = offset & !(L1_SPAN - 1);
                tracing::debug!(offset = entry_offset, index = i, "inserting L1 entry");
                self.l1.insert(i, L1Entry::new(entry_offset));
                i
            }
        };
        // Size the buffer by the compressor's worst-case bound.
        let mut payload = Vec::with_capacity(zstd::zstd_safe::compress_bound(scratch.len()));
        self.compressor
            .compress_to_buffer(scratch, &mut payload)
            .map_err(|source| Error::Compression { op: "compress", source })?;
        payload.shrink_to_fit();
        self.uncompressed_bytes += scratch.len() as u64;
        self.compressed_bytes += payload.len() as u64;
        let entry = &mut self.l1[i];
        let slot = ((offset - entry.offset) / PAGE_SIZE) as usize;
        entry.l2[slot] = Some(payload);
        Ok(())
    }
}

/// A sparse array allocator holding every page compressed.
pub struct ZstdArray {
    /// Directory, codec contexts and statistics behind one mutex.
    inner: Mutex<Inner>,
}

impl ZstdArray {
    /// Creates an empty compressed array.
    pub fn new() -> Result<Self> {
        let compressor = Compressor::new(zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(|source| Error::Compression { op: "create compressor", source })?;
        let decompressor = Decompressor::new()
            .map_err(|source| Error::Compression { op: "create decompressor", source })?;
        Ok(Self {
            inner: Mutex::new(Inner {
                l1: Vec::new(),
                compressor,
                decompressor,
                uncompressed_bytes: 0,
                compressed_bytes: 0,
            }),
        })
    }

    /// Locks the state, recovering from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ZstdArray {
    fn drop(&mut self) {
        let inner = self.lock();
        if inner.compressed_bytes > 0 {
            tracing::debug!(
                ratio = inner.uncompressed_bytes as f64 / inner.compressed_bytes as f64,
                "zstd compression ratio"
            );
        }
    }
}

impl std::fmt::Debug for ZstdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZstdArray").field("l1_entries", &self.lock().l1.len()).finish()
    }
}

impl Allocator for ZstdArray {
    fn type_name(&self) -> &'static str {
        "zstd"
    }

    fn set_size_hint(&self, _size: u64) -> Result<()> {
        Ok(())
    }

    fn read(&self, buf: &mut [u8], offset: u64) {
        let mut inner = self.lock();
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = buf.len().min(PAGE_SIZE as usize - in_page);
            let (chunk, rest) = buf.split_at_mut(n);
            // Only pages this allocator compressed are ever inflated,
            // so failure here means internal corruption; surface it as
            // zeroes rather than poisoning the read path.
            if inner.lookup_decompress(offset, &mut scratch).is_err() {
                scratch.fill(0);
            }
            chunk.copy_from_slice(&scratch[in_page..in_page + n]);
            buf = rest;
            offset += n as u64;
        }
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut inner = self.lock();
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = buf.len().min(PAGE_SIZE as usize - in_page);
            inner.lookup_decompress(offset, &mut scratch)?;
            scratch[in_page..in_page + n].copy_from_slice(&buf[..n]);
            inner.compress(offset, &scratch)?;
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn fill(&self, byte: u8, count: u64, offset: u64) -> Result<()> {
        if byte == 0 {
            self.zero(count, offset);
            return Ok(());
        }
        let mut inner = self.lock();
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = count.min(PAGE_SIZE - in_page as u64) as usize;
            inner.lookup_decompress(offset, &mut scratch)?;
            scratch[in_page..in_page + n].fill(byte);
            inner.compress(offset, &scratch)?;
            count -= n as u64;
            offset += n as u64;
        }
        Ok(())
    }

    fn zero(&self, count: u64, offset: u64) {
        let mut inner = self.lock();
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = count.min(PAGE_SIZE - in_page as u64) as usize;
            if n as u64 == PAGE_SIZE {
                // Whole page covered: release it without inflating.
                if let Some(slot) = inner.slot_mut(offset) {
                    *slot = None;
                }
            } else if inner.slot_mut(offset).is_some_and(|slot| slot.is_some()) {
                if inner.lookup_decompress(offset, &mut scratch).is_err() {
                    scratch.fill(0);
                }
                scratch[in_page..in_page + n].fill(0);
                if is_zero(&scratch) {
                    if let Some(slot) = inner.slot_mut(offset) {
                        tracing::debug!(offset, "freeing zero page");
                        *slot = None;
                    }
                } else if inner.compress(offset, &scratch).is_err() {
                    // Zero cannot fail; leave the old page in place.
                    tracing::debug!(offset, "recompression after zero failed");
                }
            }
            count -= n as u64;
            offset += n as u64;
        }
    }

    fn blit(
        &self,
        src: &dyn Allocator,
        count: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        assert_distinct(src, self);
        let mut inner = self.lock();
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        let mut count = count;
        let mut src_offset = src_offset;
        let mut dst_offset = dst_offset;
        while count > 0 {
            let in_page = (dst_offset % PAGE_SIZE) as usize;
            let n = count.min(PAGE_SIZE - in_page as u64) as usize;
            inner.lookup_decompress(dst_offset, &mut scratch)?;
            src.read(&mut scratch[in_page..in_page + n], src_offset);
            if is_zero(&scratch) {
                if let Some(slot) = inner.slot_mut(dst_offset) {
                    *slot = None;
                }
            } else {
                inner.compress(dst_offset, &scratch)?;
            }
            count -= n as u64;
            src_offset += n as u64;
            dst_offset += n as u64;
        }
        Ok(())
    }

    fn extents(&self, count: u64, offset: u64, out: &mut Extents) -> Result<()> {
        let mut inner = self.lock();
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let in_page = offset % PAGE_SIZE;
            let n = count.min(PAGE_SIZE - in_page);
            let mapped = inner.slot_mut(offset).is_some_and(|slot| slot.is_some());
            let flags = if mapped {
                inner.lookup_decompress(offset, &mut scratch)?;
                if is_zero(&scratch[in_page as usize..(in_page + n) as usize]) {
                    ExtentFlags::ZERO
                } else {
                    ExtentFlags::DATA
                }
            } else {
                ExtentFlags::HOLE_ZERO
            };
            out.append(offset, n, flags)?;
            count -= n;
            offset += n;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn compressed_round_trip() {
        let a = ZstdArray::new().unwrap();
        let data: Vec<u8> = (0u32..100_000).map(|i| (i * 7 % 253) as u8).collect();
        a.write(&data, 12345).unwrap();
        let mut back = vec![0u8; data.len()];
        a.read(&mut back, 12345);
        assert_eq!(back, data);
    }

    #[test]
    fn zero_releases_pages() {
        let a = ZstdArray::new().unwrap();
        a.write(&vec![0xABu8; PAGE_SIZE as usize], 0).unwrap();
        {
            let mut inner = a.lock();
            assert!(inner.slot_mut(0).unwrap().is_some());
        }
        a.zero(PAGE_SIZE, 0);
        {
            let mut inner = a.lock();
            assert!(inner.slot_mut(0).unwrap().is_none());
        }
        let mut buf = vec![1u8; PAGE_SIZE as usize];
        a.read(&mut buf, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_zero_keeps_remaining_data() {
        let a = ZstdArray::new().unwrap();
        a.write(&[0xCD; 1000], 0).unwrap();
        a.zero(500, 0);
        let mut buf = [0u8; 1000];
        a.read(&mut buf, 0);
        assert!(buf[..500].iter().all(|&b| b == 0));
        assert!(buf[500..].iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn extents_distinguish_holes_and_data() {
        let a = ZstdArray::new().unwrap();
        a.write(&[1u8; 16], 0).unwrap();
        let mut out = Extents::new(2 * PAGE_SIZE, 0);
        a.extents(2 * PAGE_SIZE, 0, &mut out).unwrap();
        let v = out.into_vec();
        assert_eq!(v[0].flags, ExtentFlags::DATA);
        assert_eq!(v[1].flags, ExtentFlags::HOLE_ZERO);
    }

    #[test]
    fn incompressible_data_survives() {
        // A pseudo-random page exercises the compress-bound sizing.
        let mut data = vec![0u8; PAGE_SIZE as usize];
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        for b in &mut data {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *b = x as u8;
        }
        let a = ZstdArray::new().unwrap();
        a.write(&data, 0).unwrap();
        let mut back = vec![0u8; data.len()];
        a.read(&mut back, 0);
        assert_eq!(back, data);
    }
}
