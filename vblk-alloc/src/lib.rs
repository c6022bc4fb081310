//! Growable virtual address spaces and the data structures behind them.
//!
//! This crate provides the storage primitives used by the block-device
//! core:
//!
//! - [`Allocator`] — a uniform read/write/fill/zero/blit/extents
//!   interface over an implicitly-sized, zero-initialized address
//!   space, with three implementations selected by
//!   [`create_allocator`]: `malloc` (one dense buffer), `sparse`
//!   (two-level page directory) and `zstd` (sparse with per-page
//!   compression).
//! - [`Bitmap`] — 1/2/4/8 bits of state per fixed-size block.
//! - [`RegionTable`] — an ordered partition of a virtual disk into
//!   file-backed, memory-backed and zero regions.
//! - [`Extents`] — a collector for allocation/hole reporting that
//!   enforces the ordering and forward-progress rules callers rely on.

pub mod allocator;
pub mod bitmap;
pub mod extent;
pub mod region;
pub mod util;

pub use allocator::{Allocator, create_allocator};
pub use bitmap::Bitmap;
pub use extent::{Extent, ExtentFlags, Extents};
pub use region::{Region, RegionTable, Storage};

/// Alias for `Result<T, vblk_alloc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by allocator and bitmap operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A parameter string or argument was malformed.
    #[error("{0}")]
    InvalidArgument(String),

    /// Memory could not be allocated, locked or mapped.
    #[error("{op}: {source}")]
    System {
        /// The operation that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A compressed page could not be deflated or inflated.
    #[error("zstd {op}: {source}")]
    Compression {
        /// Compress or decompress.
        op: &'static str,
        /// The codec error.
        #[source]
        source: std::io::Error,
    },

    /// A compressed page inflated to an unexpected length.
    #[error("compressed page inflated to {got} bytes, expected {expected}")]
    CorruptPage {
        /// Actual inflated length.
        got: usize,
        /// The fixed page size every payload must inflate to.
        expected: usize,
    },
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`] from anything printable.
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }
}
