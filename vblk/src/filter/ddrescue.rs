//! ddrescue mapfile filter.
//!
//! Serves only the ranges a ddrescue mapfile marks as rescued (`+`).
//! Reads fully inside a rescued range pass through; reads touching
//! any unmapped byte fail with an I/O error, which is exactly what a
//! partially-recovered disk behaves like.  The backend is read-only.

use std::io::{BufRead, BufReader, Read};

use crate::backend::{Backend, CacheCapability, Flags, Next};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// A rescued range (inclusive end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RescuedRange {
    /// First byte.
    start: u64,
    /// Last byte (inclusive).
    end: u64,
}

/// The parsed mapfile: rescued ranges only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapFile {
    /// Ranges marked `+`, in file order.
    ranges: Vec<RescuedRange>,
}

impl MapFile {
    /// Parses a ddrescue mapfile.
    ///
    /// Comment lines start with `#`; the first non-comment line is the
    /// status line and is skipped; the rest are
    /// `offset<TAB>length<TAB>status` triples, of which only status
    /// `+` (rescued) is retained.
    pub fn parse(reader: impl Read) -> Result<Self> {
        let mut ranges = Vec::new();
        let mut status_seen = false;
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !status_seen {
                status_seen = true;
                tracing::debug!(line, "ddrescue: skipping status line");
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(offset), Some(length), Some(status)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let offset = parse_int(offset)
                .ok_or_else(|| Error::invalid(format!("ddrescue: bad offset {offset:?}")))?;
            let length = parse_int(length)
                .ok_or_else(|| Error::invalid(format!("ddrescue: bad length {length:?}")))?;
            tracing::debug!(offset, length, status, "ddrescue: range");
            if status == "+" && length > 0 {
                ranges.push(RescuedRange { start: offset, end: offset + length - 1 });
            }
        }
        Ok(Self { ranges })
    }

    /// Whether `[offset, offset + count)` lies entirely inside one
    /// rescued range.
    fn covered(&self, count: u64, offset: u64) -> bool {
        if count == 0 {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| offset >= r.start && offset <= r.end && offset + count - 1 <= r.end)
    }
}

/// ddrescue offsets are conventionally hexadecimal (`0x...`) but may
/// be decimal.
fn parse_int(s: &str) -> Option<u64> {
    vblk_alloc::util::parse_u64(s)
}

/// The ddrescue filter.
#[derive(Debug)]
pub struct DdrescueFilter {
    /// The underlying backend.
    next: Next,
    /// The parsed mapfile.
    map: MapFile,
}

impl DdrescueFilter {
    /// Creates the filter over `next`.
    pub const fn new(next: Next, map: MapFile) -> Self {
        Self { next, map }
    }
}

impl Backend for DdrescueFilter {
    fn name(&self) -> &'static str {
        "ddrescue"
    }

    forward_backend!(
        next: preconnect, finalize,
        get_size,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_flush,
        can_extents,
        can_fua,
        can_multi_conn,
        flush,
        extents,
    );

    fn prepare(&self, _readonly: bool) -> Result<()> {
        self.next.prepare(true)
    }

    fn can_write(&self) -> Result<bool> {
        // Without this the layer below might accept writes.
        Ok(false)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        Ok(CacheCapability::None)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
        if self.map.covered(buf.len() as u64, offset) {
            return self.next.pread(buf, offset, flags);
        }
        tracing::debug!(offset, count = buf.len(), "ddrescue: read of unmapped range");
        Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    const MAPFILE: &str = "\
# Mapfile. Created by GNU ddrescue version 1.25
# Command line: ddrescue /dev/sdb sdb.img sdb.map
# Start time:   2023-01-01 00:00:00
# current_pos  current_status  current_pass
0x00000000     +               1
#      pos        size  status
0x00000000  0x00010000  +
0x00010000  0x00010000  -
0x00020000  0x00010000  +
";

    fn rescued() -> DdrescueFilter {
        let mem = Arc::new(MemoryPlugin::new("sparse", 0x30000).unwrap());
        mem.pwrite(&vec![7u8; 0x30000], 0, Flags::NONE).unwrap();
        DdrescueFilter::new(mem, MapFile::parse(MAPFILE.as_bytes()).unwrap())
    }

    #[test]
    fn parses_only_rescued_ranges() {
        let map = MapFile::parse(MAPFILE.as_bytes()).unwrap();
        assert_eq!(map.ranges.len(), 2);
        assert_eq!(map.ranges[0], RescuedRange { start: 0, end: 0xFFFF });
        assert_eq!(map.ranges[1], RescuedRange { start: 0x20000, end: 0x2FFFF });
    }

    #[test]
    fn reads_inside_rescued_ranges_pass() {
        let f = rescued();
        let mut buf = [0u8; 4096];
        f.pread(&mut buf, 0, Flags::NONE).unwrap();
        assert_eq!(buf, [7u8; 4096]);
        f.pread(&mut buf, 0x20000, Flags::NONE).unwrap();
    }

    #[test]
    fn reads_touching_unmapped_bytes_fail() {
        let f = rescued();
        let mut buf = [0u8; 4096];
        // Entirely inside the bad range.
        assert!(f.pread(&mut buf, 0x10000, Flags::NONE).is_err());
        // Straddling the boundary.
        assert!(f.pread(&mut buf, 0xF000, Flags::NONE).is_err());
    }

    #[test]
    fn filter_is_read_only() {
        let f = rescued();
        assert!(!f.can_write().unwrap());
    }
}
