//! Zero-request shaping filter.
//!
//! Controls how zero requests are advertised and transformed, for
//! testing client fallback paths: hide zero support entirely, force
//! the host to emulate with writes, strip the may-trim hint, or pass
//! through.  A separate knob shapes fast-zero behaviour.

use std::str::FromStr;

use crate::backend::{Backend, Flags, Next, ZeroCapability};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// How zero requests are advertised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ZeroMode {
    /// Advertise no zero support.
    #[default]
    None,
    /// Let the host emulate zeroes with writes.
    Emulate,
    /// Pass through, stripping the may-trim hint.
    NoTrim,
    /// Pass through unchanged.
    Plugin,
}

impl FromStr for ZeroMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "emulate" => Ok(Self::Emulate),
            "notrim" => Ok(Self::NoTrim),
            "plugin" => Ok(Self::Plugin),
            _ => Err(Error::invalid(format!("unknown zeromode {s:?}"))),
        }
    }
}

/// How fast-zero requests are advertised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FastZeroMode {
    /// Follow the backend (or the zero mode's natural answer).
    #[default]
    Default,
    /// Never advertise fast zero.
    NoFast,
    /// Advertise it, but fail every fast-zero request.
    Slow,
    /// Advertise it and strip the flag.
    Ignore,
}

impl FromStr for FastZeroMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "none" => Ok(Self::NoFast),
            "slow" => Ok(Self::Slow),
            "ignore" => Ok(Self::Ignore),
            _ => Err(Error::invalid(format!("unknown fastzeromode {s:?}"))),
        }
    }
}

/// The nozero filter.
#[derive(Debug)]
pub struct NozeroFilter {
    /// The underlying backend.
    next: Next,
    /// Zero shaping.
    zeromode: ZeroMode,
    /// Fast-zero shaping.
    fastzeromode: FastZeroMode,
}

impl NozeroFilter {
    /// Creates the filter over `next`.
    pub const fn new(next: Next, zeromode: ZeroMode, fastzeromode: FastZeroMode) -> Self {
        Self { next, zeromode, fastzeromode }
    }
}

impl Backend for NozeroFilter {
    fn name(&self) -> &'static str {
        "nozero"
    }

    forward_backend!(
        next: preconnect, finalize,
        get_size,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_write,
        can_flush,
        can_trim,
        can_extents,
        can_fua,
        can_cache,
        can_multi_conn,
        pread,
        pwrite,
        flush,
        trim,
        extents,
        cache,
    );

    fn prepare(&self, readonly: bool) -> Result<()> {
        self.next.prepare(readonly)?;
        if readonly {
            return Ok(());
        }
        // notrim and plugin modes need real zero support underneath.
        if matches!(self.zeromode, ZeroMode::NoTrim | ZeroMode::Plugin)
            && self.next.can_zero()? == ZeroCapability::None
        {
            return Err(Error::invalid(format!(
                "zeromode {:?} requires plugin zero support",
                self.zeromode
            )));
        }
        Ok(())
    }

    fn can_zero(&self) -> Result<ZeroCapability> {
        Ok(match self.zeromode {
            ZeroMode::None => ZeroCapability::None,
            ZeroMode::Emulate => ZeroCapability::Emulate,
            ZeroMode::NoTrim | ZeroMode::Plugin => ZeroCapability::Native,
        })
    }

    fn can_fast_zero(&self) -> Result<bool> {
        if self.zeromode == ZeroMode::None {
            return Ok(false);
        }
        if self.zeromode != ZeroMode::Emulate && self.fastzeromode == FastZeroMode::Default {
            return self.next.can_fast_zero();
        }
        Ok(self.fastzeromode != FastZeroMode::NoFast)
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        debug_assert!(matches!(self.zeromode, ZeroMode::NoTrim | ZeroMode::Plugin));
        let mut flags = flags;
        if flags.fast_zero {
            debug_assert_ne!(self.fastzeromode, FastZeroMode::NoFast);
            match self.fastzeromode {
                FastZeroMode::Slow => return Err(Error::Unsupported("fast zero")),
                FastZeroMode::Ignore => flags.fast_zero = false,
                FastZeroMode::Default | FastZeroMode::NoFast => {}
            }
        }
        if self.zeromode == ZeroMode::NoTrim {
            flags.may_trim = false;
        }
        self.next.zero(count, offset, flags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    fn nozero(zeromode: ZeroMode, fast: FastZeroMode) -> NozeroFilter {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        NozeroFilter::new(mem, zeromode, fast)
    }

    #[test]
    fn none_hides_zero_support() {
        let f = nozero(ZeroMode::None, FastZeroMode::Default);
        assert_eq!(f.can_zero().unwrap(), ZeroCapability::None);
        assert!(!f.can_fast_zero().unwrap());
    }

    #[test]
    fn emulate_asks_the_host_to_write() {
        let f = nozero(ZeroMode::Emulate, FastZeroMode::Default);
        assert_eq!(f.can_zero().unwrap(), ZeroCapability::Emulate);
        // Emulated zeroes are never fast unless explicitly shaped.
        assert!(f.can_fast_zero().unwrap());
    }

    #[test]
    fn slow_mode_fails_fast_zero_requests() {
        let f = nozero(ZeroMode::Plugin, FastZeroMode::Slow);
        let err = f.zero(4096, 0, Flags { fast_zero: true, ..Flags::NONE }).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        // Plain zeroes still pass.
        f.zero(4096, 0, Flags::NONE).unwrap();
    }

    #[test]
    fn ignore_mode_strips_the_flag() {
        let f = nozero(ZeroMode::Plugin, FastZeroMode::Ignore);
        f.zero(4096, 0, Flags { fast_zero: true, ..Flags::NONE }).unwrap();
    }

    #[test]
    fn prepare_rejects_plugin_mode_without_zero() {
        /// A backend with no zero support at all.
        #[derive(Debug)]
        struct NoZero(Arc<MemoryPlugin>);
        impl Backend for NoZero {
            fn name(&self) -> &'static str {
                "no-zero"
            }
            fn get_size(&self) -> Result<u64> {
                self.0.get_size()
            }
            fn can_zero(&self) -> Result<ZeroCapability> {
                Ok(ZeroCapability::None)
            }
            fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
                self.0.pread(buf, offset, flags)
            }
        }
        let plugin = Arc::new(NoZero(Arc::new(MemoryPlugin::new("sparse", 4096).unwrap())));
        let f = NozeroFilter::new(plugin, ZeroMode::Plugin, FastZeroMode::Default);
        assert!(f.prepare(false).is_err());
        f.prepare(true).unwrap(); // read-only connections don't care
    }
}
