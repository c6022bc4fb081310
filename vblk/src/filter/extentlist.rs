//! Extent-list override filter.
//!
//! Replaces the backend's extent map with one loaded from a text
//! file of `offset length [type]` lines, where the type is either a
//! numeric flag mask or words containing `hole` and/or `zero` (empty
//! means allocated data).  The extents are sorted, overlaps rejected,
//! gaps filled with `hole|zero`, and served by binary search.
//!
//! Useful when the backend cannot report sparseness itself but the
//! layout is known from elsewhere.

use std::io::{BufRead, BufReader, Read};

use vblk_alloc::util::parse_size;
use vblk_alloc::{Extent, ExtentFlags, Extents};

use crate::backend::{Backend, Flags, Next};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// A parsed, normalized extent list.
#[derive(Debug, Clone, Default)]
pub struct ExtentList {
    /// Sorted, contiguous extents covering [0, u64::MAX).
    extents: Vec<Extent>,
}

impl ExtentList {
    /// Parses and normalizes an extent list.
    pub fn parse(reader: impl Read) -> Result<Self> {
        let mut extents: Vec<Extent> = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(offset), Some(length)) = (fields.next(), fields.next()) else {
                return Err(Error::invalid(format!("extentlist: cannot parse {line:?}")));
            };
            let offset = parse_size(offset)?;
            let length = parse_size(length)?;
            // Zero-length extents are dropped; it simplifies the rest.
            if length == 0 {
                continue;
            }
            let flags = match fields.next() {
                None => ExtentFlags::DATA,
                Some(word) => {
                    if let Some(bits) = vblk_alloc::util::parse_u64(word) {
                        ExtentFlags::from_bits(u32::try_from(bits).unwrap_or(0))
                    } else {
                        let mut flags = ExtentFlags::DATA;
                        if word.contains("hole") {
                            flags = flags | ExtentFlags::HOLE;
                        }
                        if word.contains("zero") {
                            flags = flags | ExtentFlags::ZERO;
                        }
                        flags
                    }
                }
            };
            extents.push(Extent { offset, length, flags });
        }

        extents.sort_by_key(|e| e.offset);

        // Overlaps are not resolvable; reject them.
        let mut end = 0u64;
        for e in &extents {
            if e.offset < end || e.offset.checked_add(e.length).is_none() {
                return Err(Error::invalid("extents in the extent list are overlapping"));
            }
            end = e.offset + e.length;
        }

        // Fill every gap (and the space before and after) with holes.
        let mut filled = Vec::with_capacity(extents.len() * 2 + 1);
        let mut pos = 0u64;
        for e in extents {
            if e.offset > pos {
                filled.push(Extent {
                    offset: pos,
                    length: e.offset - pos,
                    flags: ExtentFlags::HOLE_ZERO,
                });
            }
            pos = e.offset + e.length;
            filled.push(e);
        }
        if pos < u64::MAX {
            filled.push(Extent {
                offset: pos,
                length: u64::MAX - pos,
                flags: ExtentFlags::HOLE_ZERO,
            });
        }
        Ok(Self { extents: filled })
    }

    /// Index of the extent containing `offset`.
    fn find(&self, offset: u64) -> usize {
        match self.extents.binary_search_by(|e| {
            if offset < e.offset {
                std::cmp::Ordering::Greater
            } else if offset >= e.offset + e.length {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(i) => i,
            // Cannot happen: the table covers the whole address space.
            Err(i) => i.min(self.extents.len() - 1),
        }
    }
}

/// The extentlist filter.
#[derive(Debug)]
pub struct ExtentlistFilter {
    /// The underlying backend.
    next: Next,
    /// The overriding extent map.
    list: ExtentList,
}

impl ExtentlistFilter {
    /// Creates the filter over `next`.
    pub const fn new(next: Next, list: ExtentList) -> Self {
        Self { next, list }
    }
}

impl Backend for ExtentlistFilter {
    fn name(&self) -> &'static str {
        "extentlist"
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
        can_fua,
        can_cache,
        can_multi_conn,
        pread,
        pwrite,
        flush,
        trim,
        zero,
        cache,
    );

    fn can_extents(&self) -> Result<bool> {
        Ok(true)
    }

    fn extents(&self, count: u32, offset: u64, _flags: Flags, out: &mut Extents) -> Result<()> {
        let mut i = self.list.find(offset);
        let mut remaining = u64::from(count);
        let mut offset = offset;
        while remaining > 0 && i < self.list.extents.len() {
            let e = &self.list.extents[i];
            let end = e.offset + e.length;
            out.append(offset, end - offset, e.flags)?;
            remaining -= remaining.min(end - offset);
            offset = end;
            i += 1;
        }
        Ok(())
    }
}
