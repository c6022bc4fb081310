//! The error type shared by filters and plugins.
//!
//! Each error carries one of the abstract kinds of the storage core.
//! At the host boundary the kind maps to an errno-like integer (the
//! client sees the integer, the log sees the message).

use std::io;

/// Alias for `Result<T, vblk::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by backend operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A parameter or request was malformed.
    #[error("{0}")]
    InvalidArgument(String),

    /// A request fell outside the virtual disk.
    #[error("{0}")]
    OutOfRange(String),

    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The operation is not supported by this backend.  Fast-zero
    /// requests that would need splitting or emulation fail with this.
    #[error("{0}: operation not supported")]
    Unsupported(&'static str),

    /// The operation would modify protected data.
    #[error("{0}")]
    PermissionDenied(String),

    /// A write landed beyond the available space.
    #[error("{0}")]
    NoSpace(String),

    /// The operation was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// Memory or another resource was exhausted.
    #[error("{0}")]
    ResourceExhausted(String),

    /// Stored data failed validation.
    #[error("{0}")]
    Corrupted(String),

    /// An allocator operation failed.
    #[error(transparent)]
    Alloc(#[from] vblk_alloc::Error),

    /// A data expression failed to compile or evaluate.
    #[error(transparent)]
    Expr(#[from] vblk_expr::Error),
}

impl Error {
    /// The errno-like integer reported to clients.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::OutOfRange(_) => libc::ERANGE,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Unsupported(_) => libc::ENOTSUP,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::Interrupted => libc::EINTR,
            Self::ResourceExhausted(_) => libc::ENOMEM,
            Self::Corrupted(_) => libc::EIO,
            Self::Alloc(e) => match e {
                vblk_alloc::Error::InvalidArgument(_) => libc::EINVAL,
                vblk_alloc::Error::System { .. } => libc::ENOMEM,
                _ => libc::EIO,
            },
            Self::Expr(_) => libc::EINVAL,
        }
    }

    /// Shorthand for [`Error::InvalidArgument`] from anything
    /// printable.
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::Unsupported("fast zero").errno(), libc::ENOTSUP);
        assert_eq!(Error::PermissionDenied("protected".into()).errno(), libc::EPERM);
        assert_eq!(Error::NoSpace("past end".into()).errno(), libc::ENOSPC);
        assert_eq!(Error::invalid("x").errno(), libc::EINVAL);
        let io = Error::Io(io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(io.errno(), libc::EIO);
    }
}
