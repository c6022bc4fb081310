//! Range protection filter.
//!
//! Guards byte ranges of the image against modification.  The
//! configured ranges are sorted, merged, and complemented into a
//! region table covering the whole 63-bit address space, where
//! data-carrying regions mark protected bytes.  A write (or trim or
//! zero) touching a protected range is first checked against the
//! backend's current contents: if the proposed bytes differ (or are
//! not zero, for trim/zero), the whole operation fails with
//! permission-denied and the backend is left untouched.

use std::str::FromStr;
use std::sync::Arc;

use vblk_alloc::util::is_zero;
use vblk_alloc::{RegionTable, Storage};

use crate::backend::{Backend, Flags, Next};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// End of the protectable address space (2⁶³ − 1, inclusive).
const ADDRESS_MAX: u64 = i64::MAX as u64;

/// One `protect=[~]START-END` range (inclusive bounds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectRange {
    /// First protected byte.
    pub start: u64,
    /// Last protected byte (inclusive).
    pub end: u64,
    /// The parameter text, kept for error messages.
    pub description: String,
}

impl FromStr for ProtectRange {
    type Err = Error;

    /// Parses `START-END`; empty bounds default to 0 and the end of
    /// the address space.  A leading `~` is handled by the caller
    /// (it produces the complement, i.e. up to two ranges).
    fn from_str(s: &str) -> Result<Self> {
        let (start_str, end_str) = s
            .split_once('-')
            .ok_or_else(|| Error::invalid(format!("cannot parse range, missing '-': {s}")))?;
        let start = if start_str.is_empty() {
            0
        } else {
            vblk_alloc::util::parse_size(start_str)?
        };
        let end = if end_str.is_empty() {
            ADDRESS_MAX
        } else {
            vblk_alloc::util::parse_size(end_str)?
        };
        if end < start {
            return Err(Error::invalid(format!("invalid range, end < start: {s}")));
        }
        Ok(Self { start, end, description: s.to_owned() })
    }
}

/// Parses a `protect=` parameter, expanding a leading `~` into the
/// complement of the range.
pub fn parse_protect(value: &str) -> Result<Vec<ProtectRange>> {
    if let Some(negated) = value.strip_prefix('~') {
        let range = ProtectRange::from_str(negated)?;
        let mut out = Vec::new();
        if range.start > 0 {
            out.push(ProtectRange {
                start: 0,
                end: range.start - 1,
                description: value.to_owned(),
            });
        }
        if range.end < ADDRESS_MAX {
            out.push(ProtectRange {
                start: range.end + 1,
                end: ADDRESS_MAX,
                description: value.to_owned(),
            });
        }
        Ok(out)
    } else {
        Ok(vec![ProtectRange::from_str(value)?])
    }
}

/// The protect filter.
#[derive(Debug)]
pub struct ProtectFilter {
    /// The underlying backend.
    next: Next,
    /// The whole address space split into protected (data-carrying)
    /// and unprotected regions.
    regions: RegionTable,
}

impl ProtectFilter {
    /// Creates the filter from any number of parsed ranges.
    pub fn new(next: Next, ranges: &[ProtectRange]) -> Result<Self> {
        let mut ranges = ranges.to_vec();
        ranges.sort_by_key(|r| r.start);

        // Merge adjacent and overlapping ranges.
        let mut merged: Vec<ProtectRange> = Vec::new();
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.end.checked_add(1).is_none_or(|e| e >= range.start) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }

        // Complement into a table covering the whole address space;
        // protected regions carry data, gaps are zero regions.
        let marker: Arc<[u8]> = Arc::from(&b"protected"[..]);
        let mut regions = RegionTable::new();
        for range in &merged {
            if regions.virtual_size() < range.start {
                regions.append_end(
                    "unprotected",
                    range.start - 1,
                    0,
                    0,
                    Storage::Zero,
                )?;
            }
            regions.append_end(
                range.description.clone(),
                range.end,
                0,
                0,
                Storage::Data(Arc::clone(&marker)),
            )?;
        }
        if regions.virtual_size() < ADDRESS_MAX {
            regions.append_end("unprotected", ADDRESS_MAX, 0, 0, Storage::Zero)?;
        }
        Ok(Self { next, regions })
    }

    /// Checks a proposed modification of `[offset, offset + count)`.
    ///
    /// For every protected sub-range, reads the backend and demands
    /// byte equality with `buf` (or all-zero when `buf` is `None`,
    /// for trim/zero).
    fn check_write(&self, count: u64, offset: u64, buf: Option<&[u8]>) -> Result<()> {
        let mut count = count;
        let mut offset = offset;
        let mut buf_pos = 0usize;
        while count > 0 {
            let region = self
                .regions
                .find(offset)
                .ok_or_else(|| Error::invalid(format!("offset {offset} beyond address space")))?;
            let protected = matches!(region.storage, Storage::Data(_));
            let len = (region.end - offset + 1).min(count);
            tracing::trace!(offset, len, protected, "protect: checking range");
            if protected {
                let mut expected = vec![0u8; len as usize];
                self.next.pread(&mut expected, offset, Flags::NONE)?;
                let matches = match buf {
                    Some(buf) => expected == buf[buf_pos..buf_pos + len as usize],
                    None => is_zero(&expected),
                };
                if !matches {
                    return Err(Error::PermissionDenied(format!(
                        "write prevented on protected range {}",
                        region.description
                    )));
                }
            }
            count -= len;
            offset += len;
            buf_pos += len as usize;
        }
        Ok(())
    }
}

impl Backend for ProtectFilter {
    fn name(&self) -> &'static str {
        "protect"
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
        can_cache,
        can_multi_conn,
        pread,
        flush,
        extents,
        cache,
    );

    fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
        self.check_write(buf.len() as u64, offset, Some(buf))?;
        self.next.pwrite(buf, offset, flags)
    }

    fn trim(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.check_write(u64::from(count), offset, None)?;
        self.next.trim(count, offset, flags)
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.check_write(u64::from(count), offset, None)?;
        self.next.zero(count, offset, flags)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    fn protected(ranges: &str, fill: u8) -> (Arc<MemoryPlugin>, ProtectFilter) {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        mem.pwrite(&vec![fill; 1 << 20], 0, Flags::NONE).unwrap();
        let f = ProtectFilter::new((Arc::clone(&mem) as Arc<dyn Backend>), &parse_protect(ranges).unwrap()).unwrap();
        (mem, f)
    }

    #[test]
    fn matching_write_over_protected_range_succeeds() {
        // The backend reads 0xCD throughout; a write of 0xCD over the
        // protected tail changes nothing and is allowed.
        let (_, f) = protected("100-199", 0xCD);
        f.pwrite(&[0xCD; 50], 80, Flags::NONE).unwrap();
    }

    #[test]
    fn mismatched_write_fails_and_leaves_backend_unchanged() {
        let (mem, f) = protected("100-199", 0xCD);
        let err = f.pwrite(&[0xAA; 50], 150, Flags::NONE).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        let mut buf = [0u8; 50];
        mem.pread(&mut buf, 150, Flags::NONE).unwrap();
        assert_eq!(buf, [0xCD; 50]);
    }

    #[test]
    fn unprotected_ranges_pass_through() {
        let (mem, f) = protected("100-199", 0xCD);
        f.pwrite(&[1u8; 50], 200, Flags::NONE).unwrap();
        let mut buf = [0u8; 50];
        mem.pread(&mut buf, 200, Flags::NONE).unwrap();
        assert_eq!(buf, [1u8; 50]);
    }

    #[test]
    fn zero_over_protected_nonzero_data_fails() {
        let (_, f) = protected("100-199", 0xCD);
        let err = f.zero(100, 100, Flags::NONE).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn zero_over_protected_zero_data_succeeds() {
        let (_, f) = protected("100-199", 0x00);
        f.zero(150, 50, Flags::NONE).unwrap();
    }

    #[test]
    fn complement_ranges() {
        // ~100-199 protects everything except 100-199.
        let (_, f) = protected("~100-199", 0xCD);
        f.pwrite(&[0u8; 100], 100, Flags::NONE).unwrap();
        let err = f.pwrite(&[0u8; 10], 50, Flags::NONE).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn range_parsing() {
        let r = ProtectRange::from_str("100-199").unwrap();
        assert_eq!((r.start, r.end), (100, 199));
        let r = ProtectRange::from_str("-4095").unwrap();
        assert_eq!((r.start, r.end), (0, 4095));
        let r = ProtectRange::from_str("1M-").unwrap();
        assert_eq!((r.start, r.end), (1 << 20, ADDRESS_MAX));
        assert!(ProtectRange::from_str("123").is_err());
        assert!(ProtectRange::from_str("10-5").is_err());

        let c = parse_protect("~100-199").unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!((c[0].start, c[0].end), (0, 99));
        assert_eq!((c[1].start, c[1].end), (200, ADDRESS_MAX));
    }

    #[test]
    fn overlapping_ranges_merge() {
        let mem = Arc::new(MemoryPlugin::new("sparse", 1 << 20).unwrap());
        let mut ranges = parse_protect("100-199").unwrap();
        ranges.extend(parse_protect("150-300").unwrap());
        ranges.extend(parse_protect("301-400").unwrap());
        let f = ProtectFilter::new(mem, &ranges).unwrap();
        // 3 merged into 1 protected region + unprotected before/after.
        assert_eq!(f.regions.len(), 3);
        assert!(matches!(f.regions.find(250).unwrap().storage, Storage::Data(_)));
        assert!(matches!(f.regions.find(401).unwrap().storage, Storage::Zero));
    }
}
