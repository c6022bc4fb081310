//! Anonymous scratch files.
//!
//! Every piece of scratch storage in the core (cow overlay, cache
//! file, gzip inflate target, iso output) is an unlinked temporary
//! file: it evaporates when the process exits, and nothing persists.

use std::fs::File;
use std::io;
use std::path::PathBuf;

/// Creates an anonymous scratch file in `TMPDIR` (or the system
/// temporary directory).
///
/// Large scratch files (overlays sized to the virtual disk) live or
/// die by the free space here, which is why `TMPDIR` is honoured.
pub fn scratch_file() -> io::Result<File> {
    let dir = std::env::var_os("TMPDIR").map_or_else(std::env::temp_dir, PathBuf::from);
    tracing::debug!(dir = %dir.display(), "creating scratch file");
    tempfile::tempfile_in(dir)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::*;

    #[test]
    fn scratch_files_are_usable_and_anonymous() {
        let mut f = scratch_file().unwrap();
        f.write_all(b"hello").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        f.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }
}
