//! Block: the unit of caching and remote staging.
//!
//! Responsibilities:
//! - Per-block state machine (`Local` → `Uncommitted` → `Committed`).
//! - Exclusive ownership of at most one pool buffer.
//! - In-flight transfer records used to dedupe and cancel downloads/uploads.
//! - Reference counting through the [`BlockRef`] guard; the cleaner only
//!   evicts unreferenced blocks.
//!
//! Submodules:
//! - `layout`: offset/index arithmetic
//! - `completion`: one-shot completion signal shared by transfer waiters

pub mod completion;
pub mod layout;

use crate::buffer::Buffer;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use completion::Completion;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Id committed for every hole; the remote holds one all-zero block under it.
pub const ZERO_BLOCK_ID: &str = "mb7yh/CyR8dYgZnL0kunig==";

/// Length of a base64-encoded 16-byte block id.
pub const BLOCK_ID_LEN: usize = 24;

/// Fresh random block id.
pub fn new_block_id() -> String {
    STANDARD.encode(uuid::Uuid::new_v4().as_bytes())
}

static NEXT_TRANSFER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_transfer_id() -> u64 {
    NEXT_TRANSFER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Modified locally, not yet staged.
    Local,
    /// Staged under `remote_id`, not yet part of a committed list.
    Uncommitted,
    /// Part of the blob's committed block list.
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// A caller is blocked on the result.
    Sync,
    /// Prefetch or write-back.
    Async,
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    pub remote_id: String,
    /// Block version whose bytes were staged.
    pub version: u64,
}

/// Record of a transfer that has been submitted and not yet consumed.
pub struct InFlight<T> {
    pub id: u64,
    pub priority: Priority,
    pub done: Completion<T>,
    pub cancel: CancellationToken,
}

pub struct BlockInner {
    pub remote_id: String,
    pub state: BlockState,
    pub hole: bool,
    pub buffer: Option<Buffer>,
    /// Bumped on every modification.
    pub version: u64,
    pub download: Option<InFlight<()>>,
    pub upload: Option<InFlight<Staged>>,
}

impl BlockInner {
    pub fn in_flight(&self) -> bool {
        self.download.is_some() || self.upload.is_some()
    }

    /// Mark modified: the block must be staged again before the next commit.
    pub fn dirty(&mut self) {
        self.hole = false;
        self.state = BlockState::Local;
        self.version += 1;
    }
}

pub struct Block {
    index: u32,
    refs: AtomicI64,
    inner: Mutex<BlockInner>,
}

/// Point-in-time view of a block, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub index: u32,
    pub state: BlockState,
    pub hole: bool,
    pub buffered: bool,
    pub remote_id: String,
    pub refs: i64,
}

impl Block {
    fn with(index: u32, inner: BlockInner) -> Self {
        Self {
            index,
            refs: AtomicI64::new(0),
            inner: Mutex::new(inner),
        }
    }

    /// A block of an existing committed list.
    pub fn committed(index: u32, remote_id: String) -> Self {
        let hole = remote_id == ZERO_BLOCK_ID;
        Self::with(
            index,
            BlockInner {
                remote_id,
                state: BlockState::Committed,
                hole,
                buffer: None,
                version: 0,
                download: None,
                upload: None,
            },
        )
    }

    /// A block skipped by a sparse write.
    pub fn hole(index: u32) -> Self {
        Self::with(
            index,
            BlockInner {
                remote_id: ZERO_BLOCK_ID.to_string(),
                state: BlockState::Local,
                hole: true,
                buffer: None,
                version: 0,
                download: None,
                upload: None,
            },
        )
    }

    /// A new block holding freshly written data.
    pub fn local(index: u32, buffer: Buffer) -> Self {
        Self::with(
            index,
            BlockInner {
                remote_id: String::new(),
                state: BlockState::Local,
                hole: false,
                buffer: Some(buffer),
                version: 1,
                download: None,
                upload: None,
            },
        )
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Lock the block state. Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, BlockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take a counted reference; the count drops with the guard.
    pub fn acquire(self: &Arc<Self>) -> BlockRef {
        self.refs.fetch_add(1, Ordering::AcqRel);
        BlockRef(self.clone())
    }

    pub fn info(&self) -> BlockInfo {
        let inner = self.lock();
        BlockInfo {
            index: self.index,
            state: inner.state,
            hole: inner.hole,
            buffered: inner.buffer.is_some(),
            remote_id: inner.remote_id.clone(),
            refs: self.ref_count(),
        }
    }

    /// Detach the buffer of an unreferenced, committed, idle block.
    pub fn try_evict(&self, min_idle: Duration) -> Option<Buffer> {
        if self.ref_count() != 0 {
            return None;
        }
        let mut inner = self.lock();
        if inner.state != BlockState::Committed || inner.in_flight() {
            return None;
        }
        match &inner.buffer {
            Some(buf) if buf.idle() >= min_idle => inner.buffer.take(),
            _ => None,
        }
    }
}

/// Counted reference to a block, held by engine operations and queued tasks.
pub struct BlockRef(Arc<Block>);

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        self.0.acquire()
    }
}

impl Deref for BlockRef {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.0
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        let prev = self.0.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "block {} reference count underflow", self.0.index);
    }
}
