//! Truncate/round filter: present the backend at a different size.
//!
//! The displayed size is computed from the backend's real size by
//! applying `truncate`, then `round_up`, then `round_down`.  Requests
//! are split at the real-size boundary: the part within the real size
//! goes to the backend, the part beyond reads as zero and only
//! accepts writes of zeroes (anything else fails with no-space).
//!
//! The real size is snapshotted per connection at prepare time; block
//! device sizes do not change during a connection.

use std::sync::OnceLock;

use vblk_alloc::util::{is_zero, round_down, round_up};
use vblk_alloc::{ExtentFlags, Extents};

use crate::backend::{Backend, Flags, Next, extents_full};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// Configuration for [`TruncateFilter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncateConfig {
    /// The new displayed size, applied first.
    pub truncate: Option<u64>,
    /// Round the size up to a multiple of this power of two.
    pub round_up: Option<u64>,
    /// Round the size down to a multiple of this power of two.
    pub round_down: Option<u64>,
}

/// Sizes snapshotted at prepare time.
#[derive(Debug, Clone, Copy)]
struct Sizes {
    /// The backend's real size.
    real: u64,
    /// The displayed size after truncate/round-up/round-down.
    displayed: u64,
}

/// The truncate filter.
#[derive(Debug)]
pub struct TruncateFilter {
    /// The underlying backend.
    next: Next,
    /// Size parameters.
    config: TruncateConfig,
    /// Snapshot taken at prepare.
    sizes: OnceLock<Sizes>,
}

impl TruncateFilter {
    /// Creates the filter over `next`.
    pub fn new(next: Next, config: &TruncateConfig) -> Result<Self> {
        for (name, value) in [("round-up", config.round_up), ("round-down", config.round_down)] {
            if let Some(v) = value {
                if v == 0 {
                    return Err(Error::invalid(format!("if set, the {name} parameter must be > 0")));
                }
                if !v.is_power_of_two() {
                    return Err(Error::invalid(format!("the {name} parameter must be a power of 2")));
                }
            }
        }
        Ok(Self { next, config: *config, sizes: OnceLock::new() })
    }

    /// The snapshot, computing it on first use.
    fn sizes(&self) -> Result<Sizes> {
        if let Some(s) = self.sizes.get() {
            return Ok(*s);
        }
        let real = self.next.get_size()?;
        // The three operations apply in this order; combining more
        // than one is legal if rarely useful.
        let mut displayed = real;
        if let Some(t) = self.config.truncate {
            displayed = t;
        }
        if let Some(r) = self.config.round_up {
            displayed = round_up(displayed, r);
        }
        if let Some(r) = self.config.round_down {
            displayed = round_down(displayed, r);
        }
        let sizes = Sizes { real, displayed };
        Ok(*self.sizes.get_or_init(|| sizes))
    }
}

impl Backend for TruncateFilter {
    fn name(&self) -> &'static str {
        "truncate"
    }

    forward_backend!(
        next: preconnect, finalize,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_write,
        can_flush,
        can_trim,
        can_zero,
        can_fua,
        can_cache,
        can_multi_conn,
        flush,
    );

    fn prepare(&self, readonly: bool) -> Result<()> {
        self.next.prepare(readonly)?;
        // Take the per-connection size snapshot now.
        self.sizes()?;
        Ok(())
    }

    fn get_size(&self) -> Result<u64> {
        Ok(self.sizes()?.displayed)
    }

    fn can_extents(&self) -> Result<bool> {
        // The image tail is always reportable; probe the backend so a
        // later extents call cannot fail.
        self.next.can_extents()?;
        Ok(true)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        // Zeroing the tail is trivially fast; probe the backend now.
        self.next.can_fast_zero()?;
        Ok(true)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
        let real = self.sizes()?.real;
        let mut buf = buf;
        if offset < real {
            let n = buf.len().min((real - offset) as usize);
            self.next.pread(&mut buf[..n], offset, flags)?;
            buf = &mut buf[n..];
        }
        // Beyond the real size reads as zero.
        buf.fill(0);
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
        let real = self.sizes()?.real;
        let mut buf = buf;
        if offset < real {
            let n = buf.len().min((real - offset) as usize);
            self.next.pwrite(&buf[..n], offset, flags)?;
            buf = &buf[n..];
        }
        if !buf.is_empty() && !is_zero(buf) {
            return Err(Error::NoSpace("write beyond end of underlying device".to_owned()));
        }
        Ok(())
    }

    fn trim(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let real = self.sizes()?.real;
        if offset < real {
            let n = u32::try_from(u64::from(count).min(real - offset)).unwrap_or(u32::MAX);
            return self.next.trim(n, offset, flags);
        }
        Ok(())
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let real = self.sizes()?.real;
        if offset < real {
            let n = u32::try_from(u64::from(count).min(real - offset)).unwrap_or(u32::MAX);
            if flags.fast_zero && !self.next.can_fast_zero()? {
                return Err(Error::Unsupported("fast zero"));
            }
            return self.next.zero(n, offset, flags);
        }
        Ok(())
    }

    fn extents(&self, count: u32, offset: u64, flags: Flags, out: &mut Extents) -> Result<()> {
        let Sizes { real, displayed } = self.sizes()?;
        // Entirely beyond the backend: the tail is one big hole.
        if offset >= real {
            out.append(real, displayed - real, ExtentFlags::HOLE_ZERO)?;
            return Ok(());
        }
        // Only report data from the backend here, clipped at the real
        // size; the caller asks again for the tail.
        let n = u32::try_from(u64::from(count).min(real - offset)).unwrap_or(u32::MAX);
        if self.next.can_extents()? {
            for e in extents_full(self.next.as_ref(), n, offset, flags)? {
                out.append(e.offset, e.length, e.flags)?;
            }
        } else {
            out.append(offset, u64::from(n), ExtentFlags::DATA)?;
        }
        Ok(())
    }

    fn cache(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        let real = self.sizes()?.real;
        if offset < real {
            let n = u32::try_from(u64::from(count).min(real - offset)).unwrap_or(u32::MAX);
            self.next.cache(n, offset, flags)?;
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

    fn truncated(real_size: u64, config: TruncateConfig) -> (Arc<MemoryPlugin>, TruncateFilter) {
        let mem = Arc::new(MemoryPlugin::new("sparse", real_size).unwrap());
        let f = TruncateFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), &config).unwrap();
        f.prepare(false).unwrap();
        (mem, f)
    }

    #[test]
    fn size_arithmetic() {
        let (_, f) = truncated(1000, TruncateConfig { round_up: Some(512), ..Default::default() });
        assert_eq!(f.get_size().unwrap(), 1024);

        let (_, f) =
            truncated(1000, TruncateConfig { round_down: Some(512), ..Default::default() });
        assert_eq!(f.get_size().unwrap(), 512);

        let (_, f) =
            truncated(1000, TruncateConfig { truncate: Some(4096), ..Default::default() });
        assert_eq!(f.get_size().unwrap(), 4096);
    }

    #[test]
    fn reads_beyond_real_size_are_zero() {
        let (mem, f) =
            truncated(1000, TruncateConfig { round_up: Some(4096), ..Default::default() });
        mem.pwrite(&[7u8; 1000], 0, Flags::NONE).unwrap();
        let mut buf = vec![0xFFu8; 4096];
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert!(buf[..1000].iter().all(|&b| b == 7));
        assert!(buf[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn nonzero_writes_beyond_real_size_fail() {
        let (_, f) =
            truncated(1000, TruncateConfig { round_up: Some(4096), ..Default::default() });
        // Writing zeroes to the tail is accepted.
        f.pwrite(&[0u8; 100], 2000, Flags::NONE).unwrap();
        // Anything else is refused with no-space.
        let err = f.pwrite(&[1u8; 100], 2000, Flags::NONE).unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
        // A straddling write fails only if the tail part is non-zero.
        let mut data = vec![9u8; 200];
        data[100..].fill(0);
        f.pwrite(&data, 900, Flags::NONE).unwrap();
    }

    #[test]
    fn tail_extents_are_holes() {
        let (_, f) =
            truncated(4096, TruncateConfig { round_up: Some(65536), ..Default::default() });
        let mut out = Extents::new(65536 - 8192, 8192);
        f.extents(65536 - 8192, 8192, Flags::NONE, &mut out).unwrap();
        let v = out.into_vec();
        assert_eq!(v.last().unwrap().flags, ExtentFlags::HOLE_ZERO);
        assert_eq!(v.last().unwrap().offset + v.last().unwrap().length, 65536);
    }

    #[test]
    fn config_validation() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1024).unwrap());
        let bad = TruncateConfig { round_up: Some(1000), ..Default::default() };
        assert!(TruncateFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), &bad).is_err());
        let bad = TruncateConfig { round_down: Some(0), ..Default::default() };
        assert!(TruncateFilter::new(mem, &bad).is_err());
    }
}
