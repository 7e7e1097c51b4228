//! Remote store interface used by the block cache.
//!
//! The store speaks in block-blob terms: blocks are staged under an id, then a
//! commit publishes the ordered id list as the blob's content. Everything the
//! engine needs from a backend goes through [`RemoteStore`].

use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;

/// Errors returned by a remote store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("io error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Other(format!("malformed block list: {e}"))
    }
}

/// One entry of a blob's committed block list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommittedBlock {
    pub id: String,
    pub size: u64,
}

/// Attributes of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttr {
    pub size: u64,
    pub mtime: SystemTime,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read bytes starting at `offset` into `buf`, returning how many were read.
    /// Reading at or past the end of the object returns `Ok(0)`.
    async fn read_range(&self, name: &str, offset: u64, buf: &mut [u8])
    -> Result<usize, RemoteError>;

    /// Upload `data` as an uncommitted block of `name` under `block_id`.
    async fn stage(&self, name: &str, block_id: &str, data: Bytes) -> Result<(), RemoteError>;

    /// Publish `block_ids`, in order, as the full content of `name`.
    async fn commit(
        &self,
        name: &str,
        block_ids: &[String],
        block_size: u64,
    ) -> Result<(), RemoteError>;

    async fn get_committed_block_list(&self, name: &str)
    -> Result<Vec<CommittedBlock>, RemoteError>;

    async fn get_attributes(&self, name: &str) -> Result<ObjectAttr, RemoteError>;
}
