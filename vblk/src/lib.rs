//! Composable virtual block device core.
//!
//! The crate provides the [`Backend`] trait — the operation set every
//! layer of a device chain implements — together with a family of
//! filters that mediate client I/O and the terminal plugins that back
//! it with storage:
//!
//! - **Plugins** ([`plugin`]): `memory` (allocator-backed RAM disk),
//!   `data` (disk contents from a declarative expression), `iso`
//!   (image produced by an external ISO generator) and
//!   `sparse-random` (deterministic pseudo-random layout for testing
//!   copy fidelity).
//! - **Filters** ([`filter`]): copy-on-write overlay, a
//!   writethrough/writeback cache with LRU reclamation, a block-size
//!   adapter, read-ahead and scanning prefetchers, truncate/round
//!   resizing, range protection, write verification, gzip decoding, a
//!   multi-connection flush coordinator, and capability shaping
//!   (nocache, nozero, ddrescue, extentlist).
//!
//! A chain is assembled by handing each filter an
//! `Arc<dyn Backend>`:
//!
//! ```
//! use std::sync::Arc;
//!
//! use vblk::filter::cow::{CowConfig, CowFilter};
//! use vblk::plugin::memory::MemoryPlugin;
//! use vblk::{Backend, Flags};
//!
//! let plugin = Arc::new(MemoryPlugin::new("sparse", 1 << 20)?);
//! let cow = CowFilter::new(plugin, &CowConfig::default())?;
//! cow.prepare(false)?;
//! cow.pwrite(b"hello", 0, Flags::NONE)?;
//! let mut buf = [0u8; 5];
//! cow.pread(&mut buf, 0, Flags::NONE)?;
//! assert_eq!(&buf, b"hello");
//! # Ok::<(), vblk::Error>(())
//! ```

pub mod backend;
mod error;
pub mod filter;
pub mod plugin;
pub(crate) mod scratch;

pub use backend::{
    Backend, BlockSizeConstraints, CacheCapability, Flags, FuaCapability, Next, ThreadModel,
    ZeroCapability, extents_full,
};
pub use error::{Error, Result};
pub use vblk_alloc::{Extent, ExtentFlags, Extents};
