//! The backend interface: the operation set every filter and plugin
//! implements.
//!
//! A chain is built by composition: each filter owns its `next`
//! backend behind an [`Arc`], and the tail of the chain is a plugin.
//! Requests enter at the head; each layer answers locally or
//! delegates to `next` with possibly transformed arguments.
//!
//! All methods take `&self`: a backend must be prepared for parallel
//! calls and enforce its own synchronization.

use std::fmt;
use std::sync::Arc;

use vblk_alloc::{Extent, ExtentFlags, Extents};

use crate::{Error, Result};

/// A backend further down the chain.
pub type Next = Arc<dyn Backend>;

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

/// Per-request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Force unit access: the data must be durable before returning.
    pub fua: bool,
    /// The zero operation may punch a hole instead of writing.
    pub may_trim: bool,
    /// The zero operation must be cheaper than writing, else fail
    /// with [`Error::Unsupported`].
    pub fast_zero: bool,
    /// The extents query wants only the first extent.
    pub req_one: bool,
}

impl Flags {
    /// No flags set.
    pub const NONE: Self =
        Self { fua: false, may_trim: false, fast_zero: false, req_one: false };
}

/// Tri-state capability for zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroCapability {
    /// Zero requests must be rejected.
    None,
    /// The host should emulate zero with writes.
    Emulate,
    /// The backend implements zero itself.
    Native,
}

/// Tri-state capability for FUA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuaCapability {
    /// FUA is not honoured.
    None,
    /// FUA is honoured by issuing a flush after the write.
    Emulate,
    /// The backend honours FUA natively.
    Native,
}

/// Tri-state capability for cache (prefetch) requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCapability {
    /// Cache requests must be rejected.
    None,
    /// The host should emulate cache with a throwaway read.
    Emulate,
    /// The backend implements cache itself (or needs no caching).
    Native,
}

/// How much parallelism a backend tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadModel {
    /// Only one connection at a time.
    SerializeConnections,
    /// Requests across all connections are serialized.
    SerializeAllRequests,
    /// Requests within a connection are serialized.
    SerializeRequests,
    /// Fully parallel.
    Parallel,
}

/// Block-size constraints advertised to clients.
///
/// `minimum == 0` means the backend imposes no constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSizeConstraints {
    /// Smallest request the backend accepts.
    pub minimum: u32,
    /// Preferred I/O granularity.
    pub preferred: u32,
    /// Largest single request.
    pub maximum: u32,
}

/// The uniform operation set over a virtual block device.
///
/// Capability defaults mirror whether a typical implementation
/// provides the corresponding operation: everything is read-only and
/// feature-free until overridden.  Filters forward the queries they
/// do not shape themselves.
pub trait Backend: Send + Sync {
    /// Short name for diagnostics, e.g. `"cow"` or `"memory"`.
    fn name(&self) -> &'static str;

    /// Cheap early check that a connection could be served at all,
    /// before any expensive negotiation.
    fn preconnect(&self, readonly: bool) -> Result<()> {
        let _ = readonly;
        Ok(())
    }

    /// Called once before serving I/O; filters must forward to `next`
    /// and may snapshot sizes or set up scratch state here.
    fn prepare(&self, readonly: bool) -> Result<()> {
        let _ = readonly;
        Ok(())
    }

    /// Called when a connection finishes; filters forward to `next`.
    fn finalize(&self) -> Result<()> {
        Ok(())
    }

    /// Size of the virtual disk in bytes.
    fn get_size(&self) -> Result<u64>;

    /// Block-size constraints; the default imposes none.
    fn block_size(&self) -> Result<BlockSizeConstraints> {
        Ok(BlockSizeConstraints::default())
    }

    /// Export names this backend can serve.
    fn list_exports(&self) -> Result<Vec<String>> {
        Ok(vec![String::new()])
    }

    /// The export served when a client does not name one.
    fn default_export(&self) -> Result<String> {
        Ok(String::new())
    }

    /// Whether writes are accepted.
    fn can_write(&self) -> Result<bool> {
        Ok(false)
    }

    /// Whether flush is supported.
    fn can_flush(&self) -> Result<bool> {
        Ok(false)
    }

    /// Whether trim is supported.
    fn can_trim(&self) -> Result<bool> {
        Ok(false)
    }

    /// Zero capability; by default the host writes zeroes.
    fn can_zero(&self) -> Result<ZeroCapability> {
        Ok(ZeroCapability::Emulate)
    }

    /// Whether fast-zero requests may be attempted.
    fn can_fast_zero(&self) -> Result<bool> {
        Ok(false)
    }

    /// Whether extents queries are supported.
    fn can_extents(&self) -> Result<bool> {
        Ok(false)
    }

    /// FUA capability.
    fn can_fua(&self) -> Result<FuaCapability> {
        Ok(FuaCapability::None)
    }

    /// Cache (prefetch) capability.
    fn can_cache(&self) -> Result<CacheCapability> {
        Ok(CacheCapability::None)
    }

    /// Whether multiple connections observe a consistent image.
    fn can_multi_conn(&self) -> Result<bool> {
        Ok(false)
    }

    /// Parallelism tolerated by this backend.
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    /// Reads `buf.len()` bytes at `offset`.
    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()>;

    /// Writes `buf` at `offset`.
    fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
        let _ = (buf, offset, flags);
        Err(Error::Unsupported("pwrite"))
    }

    /// Makes prior writes durable.
    fn flush(&self, flags: Flags) -> Result<()> {
        let _ = flags;
        Err(Error::Unsupported("flush"))
    }

    /// Discards `[offset, offset + count)`; the range reads back as
    /// unspecified data (usually zero).
    fn trim(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let _ = (count, offset, flags);
        Err(Error::Unsupported("trim"))
    }

    /// Writes zeroes over `[offset, offset + count)`.
    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let _ = (count, offset, flags);
        Err(Error::Unsupported("zero"))
    }

    /// Appends extents describing `[offset, offset + count)` to `out`.
    /// The default reports plain allocated data.
    fn extents(&self, count: u32, offset: u64, flags: Flags, out: &mut Extents) -> Result<()> {
        let _ = flags;
        out.append(offset, u64::from(count), ExtentFlags::DATA)?;
        Ok(())
    }

    /// Advises the backend that a range will be read soon.
    fn cache(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let _ = (count, offset, flags);
        Ok(())
    }
}

/// Queries `next` repeatedly until the whole of
/// `[offset, offset + count)` is covered by extents.
///
/// Backends are allowed to return short extent lists as long as they
/// make forward progress; consumers that need the full map use this.
pub fn extents_full(
    next: &dyn Backend,
    count: u32,
    offset: u64,
    flags: Flags,
) -> Result<Vec<Extent>> {
    let mut out = Extents::new(u64::from(count), offset);
    while !out.is_complete() {
        let pos = out.progress();
        let remaining = u32::try_from(out.range_end() - pos).unwrap_or(u32::MAX);
        next.extents(remaining, pos, Flags { req_one: false, ..flags }, &mut out)?;
        if out.progress() == pos {
            return Err(Error::invalid(format!(
                "backend {} made no progress reporting extents at {pos}",
                next.name()
            )));
        }
    }
    Ok(out.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A backend whose extents arrive one block per call.
    struct OneBlockAtATime;

    impl Backend for OneBlockAtATime {
        fn name(&self) -> &'static str {
            "one-block"
        }

        fn get_size(&self) -> Result<u64> {
            Ok(4096 * 4)
        }

        fn pread(&self, buf: &mut [u8], _offset: u64, _flags: Flags) -> Result<()> {
            buf.fill(0);
            Ok(())
        }

        fn can_extents(&self) -> Result<bool> {
            Ok(true)
        }

        fn extents(
            &self,
            _count: u32,
            offset: u64,
            _flags: Flags,
            out: &mut Extents,
        ) -> Result<()> {
            let flags =
                if (offset / 4096) % 2 == 0 { ExtentFlags::DATA } else { ExtentFlags::HOLE_ZERO };
            out.append(offset, 4096 - offset % 4096, flags)?;
            Ok(())
        }
    }

    #[test]
    fn extents_full_collects_whole_range() {
        let b = OneBlockAtATime;
        let v = extents_full(&b, 4 * 4096, 0, Flags::NONE).unwrap_or_default();
        assert_eq!(v.len(), 4);
        assert_eq!(v[0].flags, ExtentFlags::DATA);
        assert_eq!(v[1].flags, ExtentFlags::HOLE_ZERO);
        assert_eq!(v.iter().map(|e| e.length).sum::<u64>(), 4 * 4096);
    }

    #[test]
    fn defaults_are_read_only() {
        let b = OneBlockAtATime;
        assert!(!b.can_write().unwrap_or(true));
        assert!(matches!(b.pwrite(&[0], 0, Flags::NONE), Err(Error::Unsupported(_))));
        assert!(matches!(b.can_fua(), Ok(FuaCapability::None)));
        assert_eq!(b.block_size().unwrap_or_default().minimum, 0);
    }
}
