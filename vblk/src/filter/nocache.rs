//! Cache-request shaping filter.
//!
//! Overrides how cache (prefetch) requests are advertised and
//! handled, mostly for benchmarking what a client does differently
//! when caching is absent, emulated, or a no-op.

use std::str::FromStr;

use crate::backend::{Backend, CacheCapability, Flags, Next};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// How cache requests are advertised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheEmulationMode {
    /// Advertise no cache support at all.
    #[default]
    None,
    /// Let the host emulate cache requests with throwaway reads.
    Emulate,
    /// Accept cache requests and do nothing.
    Nop,
}

impl FromStr for CacheEmulationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "emulate" => Ok(Self::Emulate),
            "nop" | "no-op" => Ok(Self::Nop),
            _ => Err(Error::invalid(format!("unknown cachemode {s:?}"))),
        }
    }
}

/// The nocache filter.
#[derive(Debug)]
pub struct NocacheFilter {
    /// The underlying backend.
    next: Next,
    /// The advertised mode.
    mode: CacheEmulationMode,
}

impl NocacheFilter {
    /// Creates the filter over `next`.
    pub const fn new(next: Next, mode: CacheEmulationMode) -> Self {
        Self { next, mode }
    }
}

impl Backend for NocacheFilter {
    fn name(&self) -> &'static str {
        "nocache"
    }

    forward_backend!(
        next: preconnect, prepare,
        finalize,
        get_size,
        block_size,
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
        can_multi_conn,
        pread,
        pwrite,
        flush,
        trim,
        zero,
        extents,
    );

    fn can_cache(&self) -> Result<CacheCapability> {
        Ok(match self.mode {
            CacheEmulationMode::None => CacheCapability::None,
            CacheEmulationMode::Emulate => CacheCapability::Emulate,
            CacheEmulationMode::Nop => CacheCapability::Native,
        })
    }

    fn cache(&self, _count: u32, _offset: u64, _flags: Flags) -> Result<()> {
        debug_assert_eq!(self.mode, CacheEmulationMode::Nop);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    #[test]
    fn advertises_the_configured_mode() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 4096).unwrap());
        for (mode, want) in [
            (CacheEmulationMode::None, CacheCapability::None),
            (CacheEmulationMode::Emulate, CacheCapability::Emulate),
            (CacheEmulationMode::Nop, CacheCapability::Native),
        ] {
            let f = NocacheFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), mode);
            assert_eq!(f.can_cache().unwrap(), want);
        }
    }

    #[test]
    fn nop_cache_accepts_requests() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 4096).unwrap());
        let f = NocacheFilter::new(mem, CacheEmulationMode::Nop);
        f.cache(4096, 0, Flags::NONE).unwrap();
    }
}
