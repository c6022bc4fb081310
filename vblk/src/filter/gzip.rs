//! Gzip decoding filter.
//!
//! Serves the uncompressed expansion of a gzip-compressed backend.
//! The whole image must be inflated up front — the uncompressed size
//! of a gzip stream is unknowable without decompressing it — so the
//! first `prepare` streams the backend through the decoder into an
//! unlinked scratch file, under a lock that makes later opens find it
//! ready.  Reads are then served from the scratch file; the backend
//! is forced read-only and extents are disabled.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use flate2::read::MultiGzDecoder;

use crate::backend::{Backend, CacheCapability, Flags, Next};
use crate::filter::forward_backend;
use crate::{Error, Result, scratch};

/// Chunk size for the one-time inflate.  Generous, because large
/// reads are much more efficient with some backends.
const INFLATE_BLOCK: usize = 4 * 1024 * 1024;

/// The inflated image, produced on first prepare.
#[derive(Debug)]
struct Inflated {
    /// Scratch file holding the uncompressed data.
    file: File,
    /// Uncompressed size.
    size: u64,
    /// Size of the compressed backend at inflate time.
    compressed_size: u64,
}

/// The gzip filter.
#[derive(Debug)]
pub struct GzipFilter {
    /// The compressed backend.
    next: Next,
    /// One-time inflate result; the lock serializes the first
    /// prepare across connections.
    inflated: Mutex<Option<Inflated>>,
}

/// Adapter presenting the backend as a byte stream for the decoder.
struct BackendReader<'a> {
    /// The compressed backend.
    next: &'a dyn Backend,
    /// Total compressed bytes.
    size: u64,
    /// Read position.
    offset: u64,
}

impl Read for BackendReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.size.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(remaining).min(INFLATE_BLOCK as u64) as usize;
        self.next
            .pread(&mut buf[..n], self.offset, Flags::NONE)
            .map_err(std::io::Error::other)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl GzipFilter {
    /// Creates the filter over `next`.
    pub fn new(next: Next) -> Self {
        Self { next, inflated: Mutex::new(None) }
    }

    /// Locks the inflate state.
    fn lock(&self) -> MutexGuard<'_, Option<Inflated>> {
        self.inflated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inflates the whole backend into a scratch file.  Called with
    /// the lock held; only the first caller does the work.
    fn inflate(&self) -> Result<Inflated> {
        let compressed_size = self.next.get_size()?;
        let mut file = scratch::scratch_file()?;
        let reader = BackendReader { next: self.next.as_ref(), size: compressed_size, offset: 0 };
        let mut decoder = MultiGzDecoder::new(reader);
        let mut block = vec![0u8; INFLATE_BLOCK];
        let mut size: u64 = 0;
        loop {
            let n = decoder
                .read(&mut block)
                .map_err(|e| Error::Corrupted(format!("gzip: inflate: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&block[..n])?;
            size += n as u64;
        }
        file.flush()?;
        tracing::debug!(size, "gzip: uncompressed size");
        Ok(Inflated { file, size, compressed_size })
    }

    /// Runs the state checks shared by size and read paths.
    fn with_inflated<T>(&self, f: impl FnOnce(&Inflated) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        let inflated = guard
            .as_ref()
            .ok_or_else(|| Error::invalid("gzip: prepare has not been called"))?;
        f(inflated)
    }
}

impl Backend for GzipFilter {
    fn name(&self) -> &'static str {
        "gzip"
    }

    forward_backend!(
        next: preconnect, finalize,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_flush,
        can_fua,
        flush,
    );

    fn prepare(&self, _readonly: bool) -> Result<()> {
        // The backend is only ever read.
        self.next.prepare(true)?;
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.inflate()?);
        }
        Ok(())
    }

    fn get_size(&self) -> Result<u64> {
        let backend_size = self.next.get_size()?;
        self.with_inflated(|inflated| {
            // If the backend changed size the expansion is stale, and
            // silently serving it would corrupt the client's view.
            if backend_size != inflated.compressed_size {
                return Err(Error::Corrupted(
                    "gzip: plugin size changed unexpectedly; restart to uncompress again"
                        .to_owned(),
                ));
            }
            Ok(inflated.size)
        })
    }

    fn can_write(&self) -> Result<bool> {
        Ok(false)
    }

    fn can_extents(&self) -> Result<bool> {
        // The scratch file's layout says nothing about the image.
        Ok(false)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        // Every connection reads the same expansion.
        Ok(true)
    }

    fn can_cache(&self) -> Result<CacheCapability> {
        // Serving from a local file is already cached by the OS; let
        // the host emulate cache requests with reads.
        Ok(CacheCapability::Emulate)
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _flags: Flags) -> Result<()> {
        self.with_inflated(|inflated| {
            // Reads past the expansion read as zero (the host bounds
            // requests by get_size anyway).
            let available = inflated.size.saturating_sub(offset);
            let n = (buf.len() as u64).min(available) as usize;
            inflated.file.read_exact_at(&mut buf[..n], offset)?;
            buf[n..].fill(0);
            Ok(())
        })
    }
}
