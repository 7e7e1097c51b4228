//! Block-granularity caching engine for blob-backed userspace filesystems.
//!
//! A remote blob is split into fixed-size blocks that are cached in a bounded
//! buffer pool and reconciled with the remote through stage/commit calls.

pub mod block;
pub mod buffer;
pub mod cadapter;
pub mod config;
pub mod daemon;
pub mod demo;
pub mod engine;
pub mod error;
pub mod vfs;

pub use block::{BlockInfo, BlockState, ZERO_BLOCK_ID};
pub use cadapter::{LocalFsStore, MemoryStore, RemoteStore};
pub use config::Config;
pub use engine::{Engine, OpenOptions};
pub use error::{Error, Result};
pub use vfs::HandleId;
