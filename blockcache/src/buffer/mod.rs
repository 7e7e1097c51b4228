//! Buffer pool
//!
//! Responsibilities:
//! - Hand out zero-filled block-size buffers, reusing freed ones.
//! - Bound live memory to `mem_size / block_size` buffers; once at budget,
//!   callers wait (bounded by `acquire_timeout`) for a buffer to come back.
//! - Keep per-stage LRU lists of buffered blocks for the maintenance loops.
//!
//! A [`Buffer`] returns to the pool when dropped, so releasing a block's
//! buffer is simply taking it out of the block.

pub mod stages;

use crate::block::Block;
use crate::error::{Error, Result};
use stages::{BlockKey, Stage, StageLists};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

struct PoolShared {
    block_size: usize,
    max_buffers: usize,
    free: Mutex<Vec<Vec<u8>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl PoolShared {
    fn free(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A block-size byte buffer checked out of the pool.
pub struct Buffer {
    data: Vec<u8>,
    data_size: usize,
    touched: Instant,
    pool: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Buffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.touched = Instant::now();
        &mut self.data
    }

    /// Bytes of meaningful content.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn set_data_size(&mut self, size: usize) {
        self.data_size = size.min(self.data.len());
    }

    pub fn touch(&mut self) {
        self.touched = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.touched.elapsed()
    }

    /// Zero everything from `from` to the end.
    pub fn zero_from(&mut self, from: usize) {
        if from < self.data.len() {
            self.data[from..].fill(0);
        }
        self.data_size = self.data_size.min(from);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        let mut free = self.pool.free();
        if free.len() < self.pool.max_buffers {
            free.push(data);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("data_size", &self.data_size)
            .finish()
    }
}

pub struct BufferPool {
    shared: Arc<PoolShared>,
    stages: Mutex<StageLists>,
}

impl BufferPool {
    pub fn new(block_size: usize, max_buffers: usize, acquire_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                block_size,
                max_buffers,
                free: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max_buffers)),
                acquire_timeout,
            }),
            stages: Mutex::new(StageLists::new(max_buffers)),
        }
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Buffer {
        let data = match self.shared.free().pop() {
            Some(mut data) => {
                data.fill(0);
                data
            }
            None => {
                trace!(block_size = self.shared.block_size, "allocating buffer");
                vec![0u8; self.shared.block_size]
            }
        };
        Buffer {
            data,
            data_size: 0,
            touched: Instant::now(),
            pool: self.shared.clone(),
            _permit: permit,
        }
    }

    /// Zero-filled buffer; waits up to the acquire timeout when at budget.
    pub async fn acquire(&self) -> Result<Buffer> {
        let wait = self.shared.acquire_timeout;
        let permit = match tokio::time::timeout(wait, self.shared.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => return Err(Error::PoolExhausted(wait)),
        };
        Ok(self.checkout(permit))
    }

    /// Zero-filled buffer if one is available right now.
    pub fn try_acquire(&self) -> Result<Option<Buffer>> {
        match self.shared.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(self.checkout(permit))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(Error::Shutdown),
        }
    }

    /// Return `block`'s buffer, if it holds one. Idempotent.
    pub fn release(&self, key: BlockKey, block: &Block) -> bool {
        let buffer = block.lock().buffer.take();
        self.untrack(key);
        buffer.is_some()
    }

    /// Wake pending acquirers with [`Error::Shutdown`].
    pub fn close(&self) {
        self.shared.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.shared.max_buffers
    }

    /// Buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.shared.max_buffers - self.shared.permits.available_permits()
    }

    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Allocated buffers waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.shared.free().len()
    }

    fn stages(&self) -> MutexGuard<'_, StageLists> {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track(&self, key: BlockKey, stage: Stage) {
        self.stages().track(key, stage);
    }

    pub fn touch(&self, key: BlockKey) {
        self.stages().touch(key);
    }

    pub fn untrack(&self, key: BlockKey) {
        self.stages().untrack(key);
    }

    pub fn stage_of(&self, key: BlockKey) -> Option<Stage> {
        self.stages().stage_of(key)
    }

    pub fn stage_len(&self, stage: Stage) -> usize {
        self.stages().len(stage)
    }

    pub fn oldest(&self, stage: Stage, n: usize) -> Vec<BlockKey> {
        self.stages().oldest(stage, n)
    }
}
