use crate::cadapter::client::RemoteError;
use std::time::Duration;

/// Errors surfaced by the block cache engine.
///
/// `Clone` so that a single transfer outcome can be delivered to every waiter
/// of a block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("block index {index} exceeds the limit of {max} blocks")]
    NoSpace { index: u64, max: u32 },

    #[error("buffer pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    #[error("{0} has an unrecognised block list and is read-only")]
    ReadOnly(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("block list contracted below the block being uploaded")]
    Contracted,

    #[error("engine is shutting down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// POSIX error code for the filesystem call layer.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Remote(RemoteError::NotFound(_)) | Error::NotFound(_) => libc::ENOENT,
            Error::Remote(_) => libc::EIO,
            Error::BadHandle(_) => libc::EBADF,
            Error::NoSpace { .. } => libc::ENOSPC,
            Error::PoolExhausted(_) => libc::ENOMEM,
            Error::ReadOnly(_) => libc::EROFS,
            Error::Cancelled => libc::ECANCELED,
            Error::Contracted => libc::EIO,
            Error::Shutdown => libc::ESHUTDOWN,
            Error::Config(_) => libc::EINVAL,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
