//! Write-verification filter.
//!
//! Turns the backend into a copy-fidelity checker: the plugin is
//! opened read-only, every write-like capability is advertised, and
//! writes verify that the data being "written" matches what the
//! backend already contains.  Trim and zero verify that the covered
//! range already reads as zero, using the extent map to skip known
//! holes when available.  Mismatches fail with an I/O error.
//!
//! Sparseness need not match exactly: copying tools may either add
//! sparseness or fully allocate the target, and both are valid.

use vblk_alloc::util::is_zero;

use crate::backend::{Backend, Flags, FuaCapability, Next, ZeroCapability, extents_full};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// Largest single verification read.
const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024;

/// The checkwrite filter.
#[derive(Debug)]
pub struct CheckwriteFilter {
    /// The underlying backend.
    next: Next,
}

impl CheckwriteFilter {
    /// Creates the filter over `next`.
    pub fn new(next: Next) -> Self {
        Self { next }
    }

    /// The error every mismatch produces.
    fn data_does_not_match() -> Error {
        Error::Io(std::io::Error::other("data written does not match expected"))
    }

    /// Verifies that `[offset, offset + count)` reads as zero,
    /// reading in bounded chunks.
    fn check_zero_by_reading(&self, count: u64, offset: u64) -> Result<()> {
        let mut count = count;
        let mut offset = offset;
        while count > 0 {
            let n = count.min(u64::from(MAX_REQUEST_SIZE)) as usize;
            let mut buf = vec![0u8; n];
            self.next.pread(&mut buf, offset, Flags::NONE)?;
            if !is_zero(&buf) {
                return Err(Self::data_does_not_match());
            }
            count -= n as u64;
            offset += n as u64;
        }
        Ok(())
    }

    /// Trim and zero are the same operation here: verify the range is
    /// already zero.
    fn check_trim_zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        if self.next.can_extents()? {
            // Use the extent map to skip ranges known to read as zero.
            let extents = extents_full(self.next.as_ref(), count, offset, Flags::NONE)?;
            let mut count = u64::from(count);
            let mut offset = offset;
            for e in extents {
                if count == 0 {
                    break;
                }
                let extent_end = e.offset + e.length;
                if e.flags.is_zero() {
                    let n = count.min(extent_end - offset);
                    offset += n;
                    count -= n;
                    continue;
                }
                // Allocated data: it must actually read as zero, which
                // is never "fast".
                if flags.fast_zero {
                    return Err(Error::Unsupported("fast zero"));
                }
                let n = count.min(extent_end - offset);
                self.check_zero_by_reading(n, offset)?;
                offset += n;
                count -= n;
            }
            debug_assert_eq!(count, 0, "extent map did not cover the request");
            Ok(())
        } else {
            // No extent map: read everything.
            if flags.fast_zero {
                return Err(Error::Unsupported("fast zero"));
            }
            self.check_zero_by_reading(u64::from(count), offset)
        }
    }
}

impl Backend for CheckwriteFilter {
    fn name(&self) -> &'static str {
        "checkwrite"
    }

    forward_backend!(
        next: preconnect, finalize,
        get_size,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_extents,
        can_cache,
        pread,
        extents,
        cache,
    );

    fn prepare(&self, _readonly: bool) -> Result<()> {
        // The plugin only ever needs to serve reads.
        self.next.prepare(true)
    }

    // Whatever the plugin can or cannot do, all the write-like
    // operations are accepted (and verified).

    fn can_write(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_flush(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_fua(&self) -> Result<FuaCapability> {
        Ok(FuaCapability::Native)
    }

    fn can_trim(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_zero(&self) -> Result<ZeroCapability> {
        Ok(ZeroCapability::Native)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        // Better to advertise support even though attempts fail when
        // the plugin lacks an extent map.
        Ok(true)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        Ok(true)
    }

    fn pwrite(&self, buf: &[u8], offset: u64, _flags: Flags) -> Result<()> {
        let mut expected = vec![0u8; buf.len()];
        self.next.pread(&mut expected, offset, Flags::NONE)?;
        if expected != buf {
            return Err(Self::data_does_not_match());
        }
        Ok(())
    }

    fn flush(&self, _flags: Flags) -> Result<()> {
        // Nothing to persist; supported so copy tools can call it.
        Ok(())
    }

    fn trim(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.check_trim_zero(count, offset, flags)
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.check_trim_zero(count, offset, flags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    fn checker(fill: &[u8]) -> CheckwriteFilter {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        mem.pwrite(fill, 0, Flags::NONE).unwrap();
        CheckwriteFilter::new(mem)
    }

    #[test]
    fn matching_writes_pass() {
        let f = checker(&[7u8; 1000]);
        f.pwrite(&[7u8; 1000], 0, Flags::NONE).unwrap();
        f.pwrite(&[7u8; 100], 500, Flags::NONE).unwrap();
    }

    #[test]
    fn mismatched_writes_fail_with_io() {
        let f = checker(&[7u8; 1000]);
        let err = f.pwrite(&[8u8; 1000], 0, Flags::NONE).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn zero_over_holes_passes() {
        let f = checker(&[]);
        // Nothing was written: the sparse plugin reports holes.
        f.zero(65536, 0, Flags::NONE).unwrap();
        f.trim(65536, 65536, Flags::NONE).unwrap();
    }

    #[test]
    fn zero_over_data_fails() {
        let f = checker(&[1u8; 512]);
        let err = f.zero(512, 0, Flags::NONE).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn zero_over_explicit_zeroes_passes() {
        // Data that was written as zeroes reads as zero even though
        // it may be allocated.
        let f = checker(&[0u8; 4096]);
        f.zero(4096, 0, Flags::NONE).unwrap();
    }

    #[test]
    fn capabilities_are_forced_on() {
        let f = checker(&[]);
        assert!(f.can_write().unwrap());
        assert!(f.can_trim().unwrap());
        assert_eq!(f.can_fua().unwrap(), FuaCapability::Native);
        f.flush(Flags::NONE).unwrap();
    }
}
