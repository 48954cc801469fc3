//! Error taxonomy of the storage core.
//!
//! Everything the library can fail with is one of these variants; lower
//! layers never retry, because the semantics of the underlying
//! filesystem are not known to them.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying positioned read/write/truncate/fsync failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The file is already locked by another process.
    #[error("file is locked by another process")]
    LockUnavailable,

    /// The buffer pool has no non-pinned frame left to evict.
    #[error("buffer pool exhausted: every frame is pinned")]
    PoolExhausted,

    /// Header signature or structure id does not match on reopen.
    #[error("unrecognized file header: {0}")]
    SignatureMismatch(&'static str),

    /// The requested key or position does not exist.
    #[error("not found")]
    NotFound,

    /// A structural invariant was violated while reading a node.
    #[error("structural corruption: {0}")]
    Corruption(&'static str),
}
