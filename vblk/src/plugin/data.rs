//! Disk contents from a data expression.
//!
//! The expression (see [`vblk_expr`]) is compiled once at
//! construction into an allocator; the disk size is inferred from the
//! maximum cursor the evaluation reached unless an explicit size
//! overrides it.  Extra parameters become `$VAR` definitions inside
//! the expression.

use vblk_alloc::{Allocator, Extents, create_allocator};
use vblk_expr::Variables;

use crate::backend::{Backend, CacheCapability, Flags, FuaCapability};
use crate::{Result, ZeroCapability};

/// How the disk contents are specified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// A data expression.
    Expression(String),
    /// Literal bytes, stored verbatim at offset 0.
    Raw(Vec<u8>),
}

/// Configuration for [`DataPlugin`].
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// The disk contents.
    pub source: DataSource,
    /// Overrides the size inferred from the data.
    pub size: Option<u64>,
    /// Allocator spec, `sparse` by default.
    pub allocator: String,
    /// `$VAR` definitions for the expression.
    pub vars: Variables,
}

impl DataConfig {
    /// Configuration for an expression with no extra parameters.
    pub fn expression(expr: impl Into<String>) -> Self {
        Self {
            source: DataSource::Expression(expr.into()),
            size: None,
            allocator: "sparse".to_owned(),
            vars: Variables::new(),
        }
    }
}

/// The data plugin.
pub struct DataPlugin {
    /// Backing storage, populated at construction.
    allocator: Box<dyn Allocator>,
    /// Virtual disk size.
    size: u64,
}

impl DataPlugin {
    /// Compiles the configured contents into a fresh allocator.
    pub fn new(config: &DataConfig) -> Result<Self> {
        let allocator = create_allocator(&config.allocator)?;
        let data_size = match &config.source {
            DataSource::Expression(expr) => {
                vblk_expr::compile(expr, &config.vars, allocator.as_ref())?
            }
            DataSource::Raw(bytes) => {
                allocator.write(bytes, 0)?;
                bytes.len() as u64
            }
        };
        tracing::debug!(data_size, "data: implicit size");
        // An explicit size wins over the size implied by the data.
        let size = config.size.unwrap_or(data_size);
        tracing::debug!(size, "data: final size");
        allocator.set_size_hint(size)?;
        Ok(Self { allocator, size })
    }
}

impl std::fmt::Debug for DataPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPlugin")
            .field("allocator", &self.allocator.type_name())
            .field("size", &self.size)
            .finish()
    }
}

impl Backend for DataPlugin {
    fn name(&self) -> &'static str {
        "data"
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

    fn can_zero(&self) -> Result<ZeroCapability> {
        Ok(ZeroCapability::Native)
    }

    fn can_fast_zero(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_fua(&self) -> Result<FuaCapability> {
        Ok(FuaCapability::Native)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_extents(&self) -> Result<bool> {
        Ok(true)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        Ok(CacheCapability::Native)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _flags: Flags) -> Result<()> {
        self.allocator.read(buf, offset);
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64, _flags: Flags) -> Result<()> {
        self.allocator.write(buf, offset)?;
        Ok(())
    }

    fn flush(&self, _flags: Flags) -> Result<()> {
        Ok(())
    }

    fn trim(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
        self.allocator.zero(u64::from(count), offset);
        Ok(())
    }

    fn zero(&self, count: u32, offset: u64, _flags: Flags) -> Result<()> {
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
