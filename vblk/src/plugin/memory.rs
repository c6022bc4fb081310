//! RAM-disk plugin backed by an allocator.
//!
//! The allocator strategy is selected textually (`sparse` by default,
//! or `malloc`, `malloc,mlock=true`, `zstd`), and the configured size
//! is passed to the allocator as a hint so that mlock failures show
//! up at start-up rather than mid-write.

use vblk_alloc::{Allocator, Extents, create_allocator};

use crate::backend::{Backend, CacheCapability, Flags, FuaCapability};
use crate::{Error, Result};

/// The memory plugin.
pub struct MemoryPlugin {
    /// Backing storage.
    allocator: Box<dyn Allocator>,
    /// Virtual disk size in bytes.
    size: u64,
}

impl MemoryPlugin {
    /// Creates a RAM disk of `size` bytes using the allocator
    /// described by `allocator_spec` (see
    /// [`create_allocator`]).
    pub fn new(allocator_spec: &str, size: u64) -> Result<Self> {
        let allocator = create_allocator(allocator_spec)?;
        allocator.set_size_hint(size)?;
        Ok(Self { allocator, size })
    }

    /// Bounds-checks a request against the virtual size.
    fn check_range(&self, count: u64, offset: u64) -> Result<()> {
        if offset.checked_add(count).is_none_or(|end| end > self.size) {
            return Err(Error::OutOfRange(format!(
                "request [{offset}, +{count}) beyond end of disk ({})",
                self.size
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPlugin")
            .field("allocator", &self.allocator.type_name())
            .field("size", &self.size)
            .finish()
    }
}

impl Backend for MemoryPlugin {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn can_write(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_flush(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_trim(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_zero(&self) -> Result<crate::ZeroCapability> {
        Ok(crate::ZeroCapability::Native)
    }

    fn can_fua(&self) -> Result<FuaCapability> {
        // Nothing to persist, so FUA is trivially honoured.
        Ok(FuaCapability::Native)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_extents(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        // Everything is already in memory; nothing to prefetch.
        Ok(CacheCapability::Native)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        // The allocator's zero releases pages, beating writes.
        Ok(true)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _flags: Flags) -> Result<()> {
        self.check_range(buf.len() as u64, offset)?;
        self.allocator.read(buf, offset);
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, _flags: Flags) -> Result<()> {
        self.check_range(buf.len() as u64, offset)?;
        self.allocator.write(buf, offset)?;
        Ok(())
    }

    fn flush(&self, _flags: Flags) -> Result<()> {
        Ok(())
    }

    fn trim(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        self.check_range(u64::from(count), offset)?;
        self.allocator.zero(u64::from(count), offset);
        Ok(())
    }

    fn zero(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        self.check_range(u64::from(count), offset)?;
        self.allocator.zero(u64::from(count), offset);
        Ok(())
    }

    fn extents(&self, count: u32, offset: u64, _flags: Flags, out: &mut Extents) -> Result<()> {
        self.allocator.extents(u64::from(count), offset, out)?;
        Ok(())
    }

    fn cache(&self, _count: u32, _offset: u64, _flags: Flags) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vblk_alloc::ExtentFlags;

    use super::*;

    #[test]
    fn round_trip_on_every_allocator() {
        for spec in ["sparse", "malloc", "zstd"] {
            let m = MemoryPlugin::new(spec, 1 << 20).unwrap();
            let data = vec![0x42u8; 70_000];
            m.pwrite(&data, 1234, Flags::NONE).unwrap();
            let mut back = vec![0u8; data.len()];
            m.pread(&mut back, 1234, Flags::NONE).unwrap();
            assert_eq!(back, data, "allocator {spec}");
        }
    }

    #[test]
    fn requests_beyond_the_disk_fail() {
        let m = MemoryPlugin::new("sparse", 4096).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            m.pread(&mut buf, 4090, Flags::NONE),
            Err(Error::OutOfRange(_))
        ));
        assert!(m.pwrite(&buf, 4095, Flags::NONE).is_err());
        assert!(m.zero(2, 4095, Flags::NONE).is_err());
    }

    #[test]
    fn trim_and_zero_release_and_read_back_zero() {
        let m = MemoryPlugin::new("sparse", 1 << 20).unwrap();
        m.pwrite(&[1u8; 65536], 0, Flags::NONE).unwrap();
        m.trim(65536, 0, Flags::NONE).unwrap();
        let mut buf = vec![0xFFu8; 65536];
        m.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn extents_delegate_to_the_allocator() {
        let m = MemoryPlugin::new("sparse", 1 << 20).unwrap();
        m.pwrite(&[1u8; 16], 0, Flags::NONE).unwrap();
        let mut out = Extents::new(1 << 20, 0);
        m.extents(1 << 20, 0, Flags::NONE, &mut out).unwrap();
        let v = out.into_vec();
        assert_eq!(v[0].flags, ExtentFlags::DATA);
        assert_eq!(v.last().unwrap().flags, ExtentFlags::HOLE_ZERO);
    }

    #[test]
    fn unknown_allocator_is_rejected() {
        assert!(MemoryPlugin::new("tmpfile", 4096).is_err());
    }
}
