//! The malloc allocator: a direct-mapped, non-sparse RAM disk backed
//! by a single growable byte buffer, with optional memory locking.
//!
//! A reader/writer lock arbitrates the buffer's *structure*: accesses
//! that stay inside the current capacity take the read lock — reads
//! and in-place writes proceed in parallel — while growth takes the
//! write lock for the reallocation.  Concurrent overlapping writes are
//! left unordered, which is the block-protocol contract.  When `mlock`
//! is requested the buffer is unlocked before any reallocation (the
//! memory may move) and locked again afterwards.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use store::Disk;

use crate::allocator::{Allocator, assert_distinct};
use crate::extent::{ExtentFlags, Extents};
use crate::{Error, Result};

/// The raw byte store and the memory-locking syscalls.  All `unsafe`
/// in the crate is confined to this module.
#[allow(unsafe_code)]
mod store {
    use std::cell::UnsafeCell;
    use std::io;
    use std::ptr;

    /// Interior-mutable backing store for the RAM disk.
    ///
    /// The `RwLock` wrapping every `Disk` arbitrates structure: shared
    /// holders may read anywhere and write anywhere inside the current
    /// length, exclusive holders may reallocate.  `UnsafeCell` grants
    /// the byte-level mutability; every raw access lives in the
    /// methods below.
    #[derive(Debug, Default)]
    pub struct Disk {
        /// Disk contents.  The length is the high-water mark;
        /// everything beyond it reads as zero.
        bytes: UnsafeCell<Vec<u8>>,
    }

    // SAFETY: concurrent access is arbitrated by the RwLock around
    // every Disk (see the struct docs); overlapping writes under the
    // shared lock are unordered by the block-protocol contract.
    unsafe impl Sync for Disk {}

    impl Disk {
        /// Current high-water mark in bytes.
        pub fn len(&self) -> usize {
            // SAFETY: reading the length races only with `grow`, which
            // requires the exclusive lock.
            unsafe { (*self.bytes.get()).len() }
        }

        /// Copies from the store into `buf`.  Caller holds at least
        /// the shared lock; `offset + buf.len() <= len()`.
        pub fn read_at(&self, buf: &mut [u8], offset: usize) {
            debug_assert!(offset + buf.len() <= self.len());
            // SAFETY: in-bounds per the contract above; the allocation
            // cannot move while the shared lock is held.
            unsafe {
                ptr::copy_nonoverlapping(
                    (*self.bytes.get()).as_ptr().add(offset),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
        }

        /// Copies `buf` into the store at `offset`.  Caller holds at
        /// least the shared lock; `offset + buf.len() <= len()`.
        pub fn write_at(&self, buf: &[u8], offset: usize) {
            debug_assert!(offset + buf.len() <= self.len());
            // SAFETY: as in `read_at`.
            unsafe {
                ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    (*self.bytes.get()).as_mut_ptr().add(offset),
                    buf.len(),
                );
            }
        }

        /// Sets `count` bytes at `offset` to `byte`.  Caller holds at
        /// least the shared lock; the range is within `len()`.
        pub fn fill_at(&self, byte: u8, count: usize, offset: usize) {
            debug_assert!(offset + count <= self.len());
            // SAFETY: as in `read_at`.
            unsafe {
                ptr::write_bytes((*self.bytes.get()).as_mut_ptr().add(offset), byte, count);
            }
        }

        /// Grows the store to `new_len` bytes, zero-filling.  Requires
        /// `&mut`, i.e. the exclusive lock.
        pub fn grow(&mut self, new_len: usize) {
            self.bytes.get_mut().resize(new_len, 0);
        }

        /// The whole buffer, for mlock/madvise.  Requires `&mut`.
        pub fn as_slice(&mut self) -> &[u8] {
            self.bytes.get_mut().as_slice()
        }
    }

    /// Locks `buf` into RAM.
    #[cfg(unix)]
    pub fn mlock(buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        // SAFETY: the pointer/length pair denotes a live allocation
        // owned by the caller for the duration of the call.
        if unsafe { libc::mlock(buf.as_ptr().cast(), buf.len()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Unlocks `buf`.  Failure is ignored; the region may simply not
    /// have been locked.
    #[cfg(unix)]
    pub fn munlock(buf: &[u8]) {
        if !buf.is_empty() {
            // SAFETY: as in `mlock`.
            unsafe {
                libc::munlock(buf.as_ptr().cast(), buf.len());
            }
        }
    }

    /// Advises the kernel about the disk buffer's access pattern.
    /// These are hints; failures are ignored.
    #[cfg(unix)]
    pub fn advise(buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let advices = [
            libc::MADV_RANDOM,
            libc::MADV_WILLNEED,
            #[cfg(target_os = "linux")]
            libc::MADV_DONTFORK,
            #[cfg(target_os = "linux")]
            libc::MADV_DONTDUMP,
        ];
        for advice in advices {
            // SAFETY: as in `mlock`.
            unsafe {
                libc::madvise(buf.as_ptr().cast_mut().cast(), buf.len(), advice);
            }
        }
    }

    #[cfg(not(unix))]
    pub fn mlock(_buf: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "mlock is not supported on this platform"))
    }

    #[cfg(not(unix))]
    pub fn munlock(_buf: &[u8]) {}

    #[cfg(not(unix))]
    pub fn advise(_buf: &[u8]) {}
}

/// A dense allocator over one growable byte buffer.
#[derive(Debug)]
pub struct MallocArray {
    /// Lock the disk buffer into RAM.
    use_mlock: bool,
    /// The disk bytes behind the reader/writer lock.
    disk: RwLock<Disk>,
}

impl MallocArray {
    /// Creates an empty array.  With `use_mlock`, every byte the array
    /// grows to cover is locked into RAM.
    pub fn new(use_mlock: bool) -> Self {
        Self { use_mlock, disk: RwLock::new(Disk::default()) }
    }

    /// Takes the shared lock, recovering from poisoning.
    fn shared(&self) -> RwLockReadGuard<'_, Disk> {
        self.disk.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the exclusive lock, recovering from poisoning.
    fn exclusive(&self) -> RwLockWriteGuard<'_, Disk> {
        self.disk.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grows the buffer to hold at least `new_size` bytes, under the
    /// exclusive lock.  With `mlock`, the old range is unlocked first
    /// (the allocation may move) and the new range locked afterwards;
    /// an mlock failure reports resource exhaustion.
    fn extend(&self, new_size: u64) -> Result<()> {
        let new_size = usize::try_from(new_size)
            .map_err(|_| Error::invalid(format!("size {new_size} exceeds addressable memory")))?;
        let mut disk = self.exclusive();
        if disk.len() >= new_size {
            return Ok(());
        }
        if self.use_mlock {
            store::munlock(disk.as_slice());
        }
        disk.grow(new_size);
        store::advise(disk.as_slice());
        if self.use_mlock {
            store::mlock(disk.as_slice())
                .map_err(|source| Error::System { op: "mlock", source })?;
        }
        Ok(())
    }
}

impl Allocator for MallocArray {
    fn type_name(&self) -> &'static str {
        "malloc"
    }

    fn set_size_hint(&self, size: u64) -> Result<()> {
        // Reserve the expected size up front.  Especially important
        // with mlock, where RAM exhaustion then surfaces at start-up.
        self.extend(size)
    }

    fn read(&self, buf: &mut [u8], offset: u64) {
        let disk = self.shared();
        let len = disk.len() as u64;
        if offset >= len {
            buf.fill(0);
            return;
        }
        let offset = offset as usize;
        let available = disk.len() - offset;
        if buf.len() > available {
            let (head, tail) = buf.split_at_mut(available);
            disk.read_at(head, offset);
            tail.fill(0);
        } else {
            disk.read_at(buf, offset);
        }
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::invalid("write wraps the address space"))?;
        self.extend(end)?;
        // Only the shared lock is needed for the copy itself: the
        // exclusive lock protects the buffer structure, and `extend`
        // has already grown it past `end`.
        let disk = self.shared();
        disk.write_at(buf, offset as usize);
        Ok(())
    }

    fn fill(&self, byte: u8, count: u64, offset: u64) -> Result<()> {
        if byte == 0 {
            self.zero(count, offset);
            return Ok(());
        }
        let end = offset
            .checked_add(count)
            .ok_or_else(|| Error::invalid("fill wraps the address space"))?;
        self.extend(end)?;
        let disk = self.shared();
        disk.fill_at(byte, count as usize, offset as usize);
        Ok(())
    }

    fn zero(&self, count: u64, offset: u64) {
        let disk = self.shared();
        // Avoid extending: the unallocated tail already reads as zero,
        // so zeroing past the high-water mark is deliberately a no-op.
        let len = disk.len() as u64;
        if offset >= len {
            return;
        }
        let end = len.min(offset.saturating_add(count));
        disk.fill_at(0, (end - offset) as usize, offset as usize);
    }

    fn blit(
        &self,
        src: &dyn Allocator,
        count: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        assert_distinct(src, self);
        let end = dst_offset
            .checked_add(count)
            .ok_or_else(|| Error::invalid("blit wraps the address space"))?;
        self.extend(end)?;
        let disk = self.shared();
        // Read the source directly into the destination buffer.
        let mut chunk = vec![0u8; count as usize];
        src.read(&mut chunk, src_offset);
        disk.write_at(&chunk, dst_offset as usize);
        Ok(())
    }

    fn extents(&self, count: u64, offset: u64, out: &mut Extents) -> Result<()> {
        // The array is always fully allocated.
        out.append(offset, count, ExtentFlags::DATA)
    }
}
