#![forbid(unsafe_code)]
//! Error types for oxufs.
//!
//! `UfsError` is the single user-facing error type returned by the
//! allocation engine and its collaborator traits. Crate-internal errors
//! (`GeometryError`, `PtrError` in `ufs-types`) convert into `UfsError`
//! at the `ufs-balloc` boundary so this crate stays dependency-free of
//! the rest of the workspace.
//!
//! ## errno mapping
//!
//! Every variant maps to exactly one POSIX errno via [`UfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is
//! a compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `Unrecoverable` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `QuotaExceeded` | `EDQUOT` |
//! | `FileTooBig` | `EFBIG` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Cancelled` | `EINTR` |
//!
//! `Unrecoverable` deserves a note: it is raised when rollback itself
//! fails partway through unwinding a failed allocation. At that point an
//! on-disk pointer may name a freed block, so callers must treat the
//! filesystem as damaged (remount read-only, schedule fsck) rather than
//! retry.

use thiserror::Error;

/// Unified error type for all oxufs operations.
#[derive(Debug, Error)]
pub enum UfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is inconsistent at a known physical address.
    #[error("corrupt metadata at block {addr}: {detail}")]
    Corruption { addr: u64, detail: String },

    /// Rollback of a failed allocation itself failed; on-disk state may
    /// reference freed blocks. Not retryable.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// No free blocks or fragments available.
    #[error("no space left on device")]
    NoSpace,

    /// The owner's disk quota would be exceeded.
    #[error("disk quota exceeded")]
    QuotaExceeded,

    /// Logical block number beyond the triple-indirect addressing limit.
    #[error("file too big: logical block {lbn} exceeds limit {max}")]
    FileTooBig { lbn: u64, max: u64 },

    /// Block/fragment geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Operation cancelled via `Cx` budget exhaustion or explicit cancel.
    #[error("operation cancelled")]
    Cancelled,
}

impl UfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Unrecoverable(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::FileTooBig { .. } => libc::EFBIG,
            Self::InvalidGeometry(_) => libc::EINVAL,
            Self::Cancelled => libc::EINTR,
        }
    }

    /// Whether the caller may retry after freeing space or raising quota.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoSpace | Self::QuotaExceeded)
    }
}

/// Result alias using `UfsError`.
pub type Result<T> = std::result::Result<T, UfsError>;
