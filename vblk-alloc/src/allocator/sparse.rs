//! The sparse allocator: a two-level page directory supporting disks
//! up to 2⁶³−1 bytes while materializing only the written pages.
//!
//! The L1 directory is an ordered vector of `(offset, L2 directory)`
//! entries, binary-searched on lookup.  Each L1 entry spans
//! `PAGE_SIZE * L2_SIZE` = 128 MiB of the virtual disk; its L2
//! directory holds one optional page per 32 KiB page slot, where
//! `None` means "reads as zero".  Inserting an L1 entry shifts the
//! tail of the vector, but that happens at most once per 128 MiB
//! span.
//!
//! ```text
//! ┌────────────────────┐
//! │ L1 directory       │       ┌────────────────────┐
//! │ offset, entry 0 ─────────▶ │ L2 directory       │
//! │ offset, entry 1    │       │ page 0          ─────────▶ page
//! │ offset, entry 2    │       │ page 1             │ (None = zeroes)
//! │ ...                │       │ ...                │
//! └────────────────────┘       └────────────────────┘
//! ```

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::Result;
use crate::allocator::{Allocator, assert_distinct};
use crate::extent::{ExtentFlags, Extents};
use crate::util::is_zero;

/// Bytes per page.
const PAGE_SIZE: u64 = 32768;
/// Pages per L2 directory.
const L2_SIZE: usize = 4096;
/// Virtual bytes spanned by one L1 entry (128 MiB).
const L1_SPAN: u64 = PAGE_SIZE * L2_SIZE as u64;

/// One materialized 32 KiB page.
type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Allocates a zero-filled page on the heap.
fn new_page() -> Page {
    match vec![0u8; PAGE_SIZE as usize].into_boxed_slice().try_into() {
        Ok(page) => page,
        Err(_) => unreachable!("length matches PAGE_SIZE"),
    }
}

/// An L1 directory entry: a 128 MiB-aligned span and its L2 directory.
struct L1Entry {
    /// Virtual offset of this entry (a multiple of [`L1_SPAN`]).
    offset: u64,
    /// `L2_SIZE` optional pages.
    l2: Box<[Option<Page>]>,
}

impl L1Entry {
    /// A fresh entry whose pages all read as zero.
    fn new(offset: u64) -> Self {
        Self { offset, l2: std::iter::repeat_with(|| None).take(L2_SIZE).collect() }
    }
}

/// Directory state, guarded by the allocator's mutex.
#[derive(Default)]
struct Dir {
    /// L1 entries ordered by offset.
    l1: Vec<L1Entry>,
}

impl Dir {
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

    /// The page containing `offset`, if materialized.
    fn page(&self, offset: u64) -> Option<&[u8; PAGE_SIZE as usize]> {
        let i = self.l1_index(offset).ok()?;
        let entry = &self.l1[i];
        let slot = ((offset - entry.offset) / PAGE_SIZE) as usize;
        entry.l2[slot].as_deref()
    }

    /// The L2 slot covering `offset`, if an L1 entry exists.
    fn slot_mut(&mut self, offset: u64) -> Option<&mut Option<Page>> {
        let i = self.l1_index(offset).ok()?;
        let entry = &mut self.l1[i];
        let slot = ((offset - entry.offset) / PAGE_SIZE) as usize;
        Some(&mut entry.l2[slot])
    }

    /// The page containing `offset`, materializing the L1 entry and
    /// the page as needed.
    fn page_mut(&mut self, offset: u64) -> &mut [u8; PAGE_SIZE as usize] {
        let i = match self.l1_index(offset) {
            Ok(i) => i,
            Err(i) => {
                let entry_offset = offset & !(L1_SPAN - 1);
                tracing::debug!(offset = entry_offset, index = i, "inserting L1 entry");
                self.l1.insert(i, L1Entry::new(entry_offset));
                i
            }
        };
        let entry = &mut self.l1[i];
        let slot = ((offset - entry.offset) / PAGE_SIZE) as usize;
        entry.l2[slot].get_or_insert_with(new_page)
    }
}

/// A sparse array allocator.
///
/// A single mutex covers the L1 directory, every L2 directory and
/// every page: one accessor at a time.
pub struct SparseArray {
    /// The page directory.
    dir: Mutex<Dir>,
}

impl SparseArray {
    /// Creates an empty sparse array.
    pub fn new() -> Self {
        Self { dir: Mutex::new(Dir::default()) }
    }

    /// Locks the directory, recovering from a poisoned lock (the
    /// directory stays structurally valid across unwinds).
    fn lock(&self) -> MutexGuard<'_, Dir> {
        self.dir.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of L1 directory entries (test introspection).
    #[cfg(test)]
    fn l1_len(&self) -> usize {
        self.lock().l1.len()
    }

    /// Whether the page containing `offset` is materialized
    /// (test introspection).
    #[cfg(test)]
    fn page_present(&self, offset: u64) -> bool {
        self.lock().page(offset).is_some()
    }
}

impl Default for SparseArray {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SparseArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseArray").field("l1_entries", &self.lock().l1.len()).finish()
    }
}

impl Allocator for SparseArray {
    fn type_name(&self) -> &'static str {
        "sparse"
    }

    fn set_size_hint(&self, _size: u64) -> Result<()> {
        Ok(())
    }

    fn read(&self, buf: &mut [u8], offset: u64) {
        let dir = self.lock();
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = buf.len().min(PAGE_SIZE as usize - in_page);
            let (chunk, rest) = buf.split_at_mut(n);
            match dir.page(offset) {
                Some(page) => chunk.copy_from_slice(&page[in_page..in_page + n]),
                None => chunk.fill(0),
            }
            buf = rest;
            offset += n as u64;
        }
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut dir = self.lock();
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = buf.len().min(PAGE_SIZE as usize - in_page);
            let page = dir.page_mut(offset);
            page[in_page..in_page + n].copy_from_slice(&buf[..n]);
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
        let mut dir = self.lock();
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = count.min(PAGE_SIZE - in_page as u64) as usize;
            let page = dir.page_mut(offset);
            page[in_page..in_page + n].fill(byte);
            count -= n as u64;
            offset += n as u64;
        }
        Ok(())
    }

    fn zero(&self, count: u64, offset: u64) {
        let mut dir = self.lock();
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let in_page = (offset % PAGE_SIZE) as usize;
            let n = count.min(PAGE_SIZE - in_page as u64) as usize;
            if let Some(slot) = dir.slot_mut(offset) {
                let release = match slot.as_mut() {
                    None => false,
                    // Whole page covered: release without scanning.
                    Some(_) if n as u64 == PAGE_SIZE => true,
                    Some(page) => {
                        page[in_page..in_page + n].fill(0);
                        is_zero(&page[..])
                    }
                };
                if release {
                    tracing::debug!(offset, "freeing zero page");
                    *slot = None;
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
        let mut dir = self.lock();
        let mut count = count;
        let mut src_offset = src_offset;
        let mut dst_offset = dst_offset;
        while count > 0 {
            let in_page = (dst_offset % PAGE_SIZE) as usize;
            let n = count.min(PAGE_SIZE - in_page as u64) as usize;
            let page = dir.page_mut(dst_offset);
            // Read the source directly into the destination page.
            src.read(&mut page[in_page..in_page + n], src_offset);
            if is_zero(&page[..]) {
                if let Some(slot) = dir.slot_mut(dst_offset) {
                    tracing::debug!(offset = dst_offset, "freeing zero page");
                    *slot = None;
                }
            }
            count -= n as u64;
            src_offset += n as u64;
            dst_offset += n as u64;
        }
        Ok(())
    }

    fn extents(&self, count: u64, offset: u64, out: &mut Extents) -> Result<()> {
        let dir = self.lock();
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let in_page = offset % PAGE_SIZE;
            let n = count.min(PAGE_SIZE - in_page);
            let flags = match dir.page(offset) {
                // No backing page: a hole.
                None => ExtentFlags::HOLE_ZERO,
                Some(page) => {
                    if is_zero(&page[in_page as usize..(in_page + n) as usize]) {
                        ExtentFlags::ZERO
                    } else {
                        ExtentFlags::DATA
                    }
                }
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
    fn write_spanning_pages() {
        let a = SparseArray::new();
        let data = vec![7u8; 3 * PAGE_SIZE as usize];
        a.write(&data, PAGE_SIZE / 2).unwrap();
        let mut back = vec![0u8; data.len()];
        a.read(&mut back, PAGE_SIZE / 2);
        assert_eq!(back, data);
        assert_eq!(a.l1_len(), 1);
    }

    #[test]
    fn zero_releases_whole_pages() {
        let a = SparseArray::new();
        a.write(&vec![1u8; PAGE_SIZE as usize], 0).unwrap();
        assert_eq!(a.l1_len(), 1);
        assert!(a.page_present(0));

        a.zero(PAGE_SIZE, 0);
        // The L1 entry survives, the page is released.
        assert_eq!(a.l1_len(), 1);
        assert!(!a.page_present(0));

        let mut buf = vec![0xFFu8; PAGE_SIZE as usize];
        a.read(&mut buf, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_zero_releases_once_page_is_clean() {
        let a = SparseArray::new();
        a.write(&[9u8; 100], 10).unwrap();
        a.zero(50, 10);
        assert!(a.page_present(0));
        a.zero(PAGE_SIZE / 2, 0);
        assert!(!a.page_present(0));
    }

    #[test]
    fn l1_entries_stay_ordered() {
        let a = SparseArray::new();
        // Touch three spans out of order.
        a.write(&[1], 5 * L1_SPAN).unwrap();
        a.write(&[2], 0).unwrap();
        a.write(&[3], 2 * L1_SPAN + 17).unwrap();
        assert_eq!(a.l1_len(), 3);
        let mut b = [0u8; 1];
        a.read(&mut b, 5 * L1_SPAN);
        assert_eq!(b[0], 1);
        a.read(&mut b, 0);
        assert_eq!(b[0], 2);
        a.read(&mut b, 2 * L1_SPAN + 17);
        assert_eq!(b[0], 3);
    }

    #[test]
    fn extents_classification() {
        let a = SparseArray::new();
        a.write(&[1u8; 10], 0).unwrap(); // page 0: data
        a.write(&[0u8; 10], PAGE_SIZE).unwrap(); // page 1: materialized zeroes

        let mut out = Extents::new(3 * PAGE_SIZE, 0);
        a.extents(3 * PAGE_SIZE, 0, &mut out).unwrap();
        let v = out.into_vec();
        assert_eq!(v.len(), 3);
        assert_eq!(v[0].flags, ExtentFlags::DATA);
        assert_eq!(v[1].flags, ExtentFlags::ZERO);
        assert_eq!(v[2].flags, ExtentFlags::HOLE_ZERO);
        assert_eq!(v[2].length, PAGE_SIZE);
    }

    #[test]
    fn extents_of_empty_region_is_single_hole() {
        let a = SparseArray::new();
        let mut out = Extents::new(1 << 30, 1 << 20);
        a.extents(1 << 30, 1 << 20, &mut out).unwrap();
        let v = out.into_vec();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].offset, 1 << 20);
        assert_eq!(v[0].length, 1 << 30);
        assert_eq!(v[0].flags, ExtentFlags::HOLE_ZERO);
    }

    #[test]
    fn blit_releases_zero_pages_in_destination() {
        let src = SparseArray::new();
        let dst = SparseArray::new();
        dst.write(&[5u8; 100], 0).unwrap();
        // Source reads as zero, so blitting a full page of it over the
        // destination page leaves the page all-zero and released.
        dst.blit(&src, PAGE_SIZE, 0, 0).unwrap();
        assert!(!dst.page_present(0));
    }
}
