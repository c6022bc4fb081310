//! The allocator interface and its implementations.
//!
//! An allocator owns a growable virtual address space that reads as
//! zero until written.  There is no explicit size: writes extend the
//! space, reads past the high-water mark return zeroes, and `zero` may
//! release backing storage.  All implementations do their own locking
//! and are safe to call from parallel threads.
//!
//! Allocators are selected textually — `"sparse"`, `"malloc"`,
//! `"malloc,mlock=true"`, `"zstd"` — via [`create_allocator`].

mod malloc;
mod sparse;
mod zstd;

pub use malloc::MallocArray;
pub use sparse::SparseArray;
pub use zstd::ZstdArray;

use crate::extent::Extents;
use crate::util::parse_bool;
use crate::{Error, Result};

/// A growable, zero-initialized virtual address space.
///
/// Implementations are internally synchronized: `&self` methods may be
/// called concurrently from any number of threads.
pub trait Allocator: Send + Sync {
    /// The allocator type tag, e.g. `"sparse"`.
    fn type_name(&self) -> &'static str;

    /// Advisory expected size of the disk.
    ///
    /// `malloc` pre-reserves (and locks, when configured) this much
    /// memory so that resource exhaustion surfaces at start-up; the
    /// sparse variants ignore the hint.  This neither sets nor
    /// enforces the virtual size.
    fn set_size_hint(&self, size: u64) -> Result<()>;

    /// Reads `buf.len()` bytes at `offset`.  Unwritten ranges read as
    /// zero; this cannot fail.
    fn read(&self, buf: &mut [u8], offset: u64);

    /// Writes `buf` at `offset`, extending the space as needed.
    ///
    /// Fails only on allocation exhaustion.
    fn write(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Fills `[offset, offset + count)` with `byte`.
    ///
    /// `fill(0, ..)` is identical to [`Allocator::zero`].
    fn fill(&self, byte: u8, count: u64, offset: u64) -> Result<()>;

    /// Zeroes `[offset, offset + count)`, releasing backing storage
    /// wherever the covered range becomes entirely zero.
    fn zero(&self, count: u64, offset: u64);

    /// Copies `count` bytes from `src` at `src_offset` into `self` at
    /// `dst_offset` without an intermediate user buffer.
    ///
    /// The copy runs through the destination's write path so its
    /// locking and growth rules apply.  `src` must be a different
    /// allocator instance from `self`.
    fn blit(&self, src: &dyn Allocator, count: u64, src_offset: u64, dst_offset: u64)
    -> Result<()>;

    /// Appends extents describing `[offset, offset + count)` to `out`.
    fn extents(&self, count: u64, offset: u64, out: &mut Extents) -> Result<()>;
}

/// Asserts that `src` and `dst` are distinct allocator instances.
///
/// Blitting within a single allocator would deadlock on its own lock,
/// so this is a programming error, not a runtime condition.
pub(crate) fn assert_distinct(src: &dyn Allocator, dst: &dyn Allocator) {
    assert!(
        !std::ptr::addr_eq(
            std::ptr::from_ref(src).cast::<u8>(),
            std::ptr::from_ref(dst).cast::<u8>()
        ),
        "blit source and destination must be distinct allocators"
    );
}

/// One `key=value` parameter from an allocator spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Param {
    /// Parameter name.
    key: String,
    /// Parameter value (`"1"` when given bare).
    value: String,
}

/// Splits `"type,key=value,..."` into the type and its parameters.
fn parse_spec(spec: &str) -> Result<(&str, Vec<Param>)> {
    let mut parts = spec.split(',');
    let type_name = parts.next().unwrap_or_default();
    let mut params = Vec::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, "1"),
        };
        if key.is_empty() {
            return Err(Error::invalid(format!("invalid allocator parameter: {part:?}")));
        }
        tracing::debug!(key, value, "allocator parameter");
        params.push(Param { key: key.to_owned(), value: value.to_owned() });
    }
    Ok((type_name, params))
}

/// Creates an allocator from a textual spec: `type[,key=value...]`.
///
/// Recognized types are `sparse`, `malloc` (accepting `mlock=BOOL`)
/// and `zstd`.  Unknown types and unknown or malformed parameters are
/// rejected.
pub fn create_allocator(spec: &str) -> Result<Box<dyn Allocator>> {
    let (type_name, params) = parse_spec(spec)?;
    tracing::debug!(allocator = type_name, "creating allocator");
    match type_name {
        "sparse" => {
            reject_params("sparse", &params)?;
            Ok(Box::new(SparseArray::new()))
        }
        "malloc" => {
            let mut mlock = false;
            for p in &params {
                if p.key == "mlock" {
                    mlock = parse_bool(&p.value)?;
                } else {
                    return Err(Error::invalid(format!(
                        "allocator=malloc: unknown parameter {:?}",
                        p.key
                    )));
                }
            }
            Ok(Box::new(MallocArray::new(mlock)))
        }
        "zstd" => {
            reject_params("zstd", &params)?;
            Ok(Box::new(ZstdArray::new()?))
        }
        other => Err(Error::invalid(format!("unknown allocator {other:?}"))),
    }
}

/// Errors out when a parameterless allocator type was given parameters.
fn reject_params(type_name: &str, params: &[Param]) -> Result<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid(format!("allocator={type_name} does not take extra parameters")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let (t, p) = parse_spec("sparse").unwrap();
        assert_eq!(t, "sparse");
        assert!(p.is_empty());

        let (t, p) = parse_spec("malloc,mlock=true").unwrap();
        assert_eq!(t, "malloc");
        assert_eq!(p, vec![Param { key: "mlock".into(), value: "true".into() }]);

        // A bare key reads as "1".
        let (_, p) = parse_spec("malloc,mlock").unwrap();
        assert_eq!(p[0].value, "1");

        // Empty segments are skipped.
        let (_, p) = parse_spec("sparse,,").unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn factory() {
        assert_eq!(create_allocator("sparse").unwrap().type_name(), "sparse");
        assert_eq!(create_allocator("malloc").unwrap().type_name(), "malloc");
        assert_eq!(create_allocator("malloc,mlock=false").unwrap().type_name(), "malloc");
        assert_eq!(create_allocator("zstd").unwrap().type_name(), "zstd");
        assert!(create_allocator("tmpfile").is_err());
        assert!(create_allocator("sparse,foo=1").is_err());
        assert!(create_allocator("malloc,foo=1").is_err());
    }

    /// Shared conformance checks run against every allocator type.
    fn conformance(a: &dyn Allocator) {
        // Property: a fresh allocator reads as zero everywhere.
        let mut buf = vec![0xFFu8; 1000];
        a.read(&mut buf, 1 << 40);
        assert!(buf.iter().all(|&b| b == 0));

        // Property: write then read round-trips.
        let data: Vec<u8> = (0..=255).cycle().take(100_000).map(|b| b as u8).collect();
        a.write(&data, 12345).unwrap();
        let mut back = vec![0u8; data.len()];
        a.read(&mut back, 12345);
        assert_eq!(back, data);

        // Reads straddling the written range see zeroes around it.
        let mut wide = vec![0xAAu8; data.len() + 200];
        a.read(&mut wide, 12345 - 100);
        assert!(wide[..100].iter().all(|&b| b == 0));
        assert_eq!(&wide[100..100 + data.len()], &data[..]);

        // Property: zero then read yields zeroes.
        a.zero(50_000, 20_000);
        let mut z = vec![1u8; 50_000];
        a.read(&mut z, 20_000);
        assert!(z.iter().all(|&b| b == 0));

        // fill then read.
        a.fill(0xCD, 3000, 1_000_000).unwrap();
        let mut f = vec![0u8; 3000];
        a.read(&mut f, 1_000_000);
        assert!(f.iter().all(|&b| b == 0xCD));

        // fill(0) behaves as zero.
        a.fill(0, 3000, 1_000_000).unwrap();
        a.read(&mut f, 1_000_000);
        assert!(f.iter().all(|&b| b == 0));
    }

    #[test]
    fn conformance_all_types() {
        for spec in ["sparse", "malloc", "zstd"] {
            let a = create_allocator(spec).unwrap();
            conformance(a.as_ref());
        }
    }

    #[test]
    fn blit_between_types() {
        // Property: blit(src, dst) is equivalent to read+write.
        for (src_type, dst_type) in [("sparse", "malloc"), ("malloc", "zstd"), ("zstd", "sparse")] {
            let src = create_allocator(src_type).unwrap();
            let dst = create_allocator(dst_type).unwrap();
            let data: Vec<u8> = (0u32..70_000).map(|i| (i % 251) as u8).collect();
            src.write(&data, 1000).unwrap();
            dst.blit(src.as_ref(), data.len() as u64, 1000, 9999).unwrap();
            let mut back = vec![0u8; data.len()];
            dst.read(&mut back, 9999);
            assert_eq!(back, data, "blit {src_type} -> {dst_type}");
        }
    }

    #[test]
    #[should_panic(expected = "distinct")]
    fn blit_to_self_panics() {
        let a = create_allocator("sparse").unwrap();
        let _ = a.blit(a.as_ref(), 10, 0, 100);
    }
}
