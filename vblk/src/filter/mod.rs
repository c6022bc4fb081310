//! The filter stack.
//!
//! A filter is a [`Backend`](crate::Backend) wrapping a `next`
//! backend: it answers requests locally or delegates down the chain
//! with possibly transformed arguments.  Filters that shape a
//! capability override the corresponding `can_*` query; everything
//! else is forwarded verbatim with [`forward_backend!`].

pub mod blocksize;
pub mod cache;
pub mod checkwrite;
pub mod cow;
pub mod ddrescue;
pub mod extentlist;
pub mod gzip;
pub mod multi_conn;
pub mod nocache;
pub mod nozero;
pub mod protect;
pub mod readahead;
pub mod scan;
pub mod truncate;

/// Generates `Backend` methods that forward verbatim to the backend
/// stored in the named field.
///
/// ```ignore
/// impl Backend for MyFilter {
///     fn name(&self) -> &'static str { "my" }
///     forward_backend!(next: get_size, pread, pwrite);
///     // ... overridden methods ...
/// }
/// ```
macro_rules! forward_backend {
    ($field:ident: $($method:ident),* $(,)?) => {
        $(crate::filter::forward_backend!(@ $field $method);)*
    };
    (@ $f:ident preconnect) => {
        fn preconnect(&self, readonly: bool) -> crate::Result<()> {
            self.$f.preconnect(readonly)
        }
    };
    (@ $f:ident prepare) => {
        fn prepare(&self, readonly: bool) -> crate::Result<()> {
            self.$f.prepare(readonly)
        }
    };
    (@ $f:ident finalize) => {
        fn finalize(&self) -> crate::Result<()> {
            self.$f.finalize()
        }
    };
    (@ $f:ident get_size) => {
        fn get_size(&self) -> crate::Result<u64> {
            self.$f.get_size()
        }
    };
    (@ $f:ident block_size) => {
        fn block_size(&self) -> crate::Result<crate::BlockSizeConstraints> {
            self.$f.block_size()
        }
    };
    (@ $f:ident list_exports) => {
        fn list_exports(&self) -> crate::Result<Vec<String>> {
            self.$f.list_exports()
        }
    };
    (@ $f:ident default_export) => {
        fn default_export(&self) -> crate::Result<String> {
            self.$f.default_export()
        }
    };
    (@ $f:ident can_write) => {
        fn can_write(&self) -> crate::Result<bool> {
            self.$f.can_write()
        }
    };
    (@ $f:ident can_flush) => {
        fn can_flush(&self) -> crate::Result<bool> {
            self.$f.can_flush()
        }
    };
    (@ $f:ident can_trim) => {
        fn can_trim(&self) -> crate::Result<bool> {
            self.$f.can_trim()
        }
    };
    (@ $f:ident can_zero) => {
        fn can_zero(&self) -> crate::Result<crate::ZeroCapability> {
            self.$f.can_zero()
        }
    };
    (@ $f:ident can_fast_zero) => {
        fn can_fast_zero(&self) -> crate::Result<bool> {
            self.$f.can_fast_zero()
        }
    };
    (@ $f:ident can_extents) => {
        fn can_extents(&self) -> crate::Result<bool> {
            self.$f.can_extents()
        }
    };
    (@ $f:ident can_fua) => {
        fn can_fua(&self) -> crate::Result<crate::FuaCapability> {
            self.$f.can_fua()
        }
    };
    (@ $f:ident can_cache) => {
        fn can_cache(&self) -> crate::Result<crate::CacheCapability> {
            self.$f.can_cache()
        }
    };
    (@ $f:ident can_multi_conn) => {
        fn can_multi_conn(&self) -> crate::Result<bool> {
            self.$f.can_multi_conn()
        }
    };
    (@ $f:ident thread_model) => {
        fn thread_model(&self) -> crate::ThreadModel {
            self.$f.thread_model()
        }
    };
    (@ $f:ident pread) => {
        fn pread(&self, buf: &mut [u8], offset: u64, flags: crate::Flags) -> crate::Result<()> {
            self.$f.pread(buf, offset, flags)
        }
    };
    (@ $f:ident pwrite) => {
        fn pwrite(&self, buf: &[u8], offset: u64, flags: crate::Flags) -> crate::Result<()> {
            self.$f.pwrite(buf, offset, flags)
        }
    };
    (@ $f:ident flush) => {
        fn flush(&self, flags: crate::Flags) -> crate::Result<()> {
            self.$f.flush(flags)
        }
    };
    (@ $f:ident trim) => {
        fn trim(&self, count: u32, offset: u64, flags: crate::Flags) -> crate::Result<()> {
            self.$f.trim(count, offset, flags)
        }
    };
    (@ $f:ident zero) => {
        fn zero(&self, count: u32, offset: u64, flags: crate::Flags) -> crate::Result<()> {
            self.$f.zero(count, offset, flags)
        }
    };
    (@ $f:ident extents) => {
        fn extents(
            &self,
            count: u32,
            offset: u64,
            flags: crate::Flags,
            out: &mut crate::Extents,
        ) -> crate::Result<()> {
            self.$f.extents(count, offset, flags, out)
        }
    };
    (@ $f:ident cache) => {
        fn cache(&self, count: u32, offset: u64, flags: crate::Flags) -> crate::Result<()> {
            self.$f.cache(count, offset, flags)
        }
    };
}
pub(crate) use forward_backend;
