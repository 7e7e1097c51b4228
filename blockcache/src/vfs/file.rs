//! Open file record: the ordered block list plus per-file bookkeeping.

use crate::block::layout::BlockLayout;
use crate::block::{BLOCK_ID_LEN, Block, ZERO_BLOCK_ID};
use crate::buffer::Buffer;
use crate::buffer::stages::BlockKey;
use crate::cadapter::client::CommittedBlock;
use crate::error::{Error, Result};
use crate::vfs::registry::HandleId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    NotRetrieved,
    Valid,
    /// Rebuilt with uniform block sizes after the remote list failed
    /// validation; the file is read-only.
    Invalid,
}

pub struct FileState {
    pub handles: HashSet<HandleId>,
    pub synced: bool,
    pub hole_punched: bool,
    pub list_state: ListState,
}

/// An open file. Lock order: `barrier`, then `growth`, then the block list;
/// the block list lock is never held across an `.await`.
pub struct File {
    id: u64,
    path: String,
    size: AtomicI64,
    blocks: RwLock<Vec<Arc<Block>>>,
    growth: tokio::sync::Mutex<()>,
    barrier: tokio::sync::RwLock<()>,
    state: Mutex<FileState>,
}

impl File {
    pub fn new(id: u64, path: &str) -> Self {
        Self {
            id,
            path: path.to_string(),
            size: AtomicI64::new(-1),
            blocks: RwLock::new(Vec::new()),
            growth: tokio::sync::Mutex::new(()),
            barrier: tokio::sync::RwLock::new(()),
            state: Mutex::new(FileState {
                handles: HashSet::new(),
                synced: true,
                hole_punched: false,
                list_state: ListState::NotRetrieved,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn key(&self, index: u32) -> BlockKey {
        (self.id, index)
    }

    pub fn raw_size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.raw_size().max(0) as u64
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size as i64, Ordering::Release);
    }

    pub fn extend_size(&self, end: u64) {
        self.size.fetch_max(end as i64, Ordering::AcqRel);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writers hold it shared, flush, truncate and release exclusively.
    pub fn barrier(&self) -> &tokio::sync::RwLock<()> {
        &self.barrier
    }

    /// Serializes writers that grow the block list.
    pub async fn lock_growth(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.growth.lock().await
    }

    pub fn list_state(&self) -> ListState {
        self.state().list_state
    }

    pub fn is_synced(&self) -> bool {
        self.state().synced
    }

    pub fn mark_dirty(&self) {
        self.state().synced = false;
    }

    pub fn hole_punched(&self) -> bool {
        self.state().hole_punched
    }

    pub fn set_hole_punched(&self, punched: bool) {
        self.state().hole_punched = punched;
    }

    pub fn handle_count(&self) -> usize {
        self.state().handles.len()
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.list_state() == ListState::Invalid {
            return Err(Error::ReadOnly(self.path.clone()));
        }
        Ok(())
    }

    fn read_blocks(&self) -> RwLockReadGuard<'_, Vec<Arc<Block>>> {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_blocks(&self) -> RwLockWriteGuard<'_, Vec<Arc<Block>>> {
        self.blocks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the whole block list.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.read_blocks().clone()
    }

    /// Snapshot of blocks `[from, to)`, clipped to the list.
    pub fn blocks_in(&self, from: u64, to: u64) -> Vec<Arc<Block>> {
        let blocks = self.read_blocks();
        let to = (to as usize).min(blocks.len());
        let from = (from as usize).min(to);
        blocks[from..to].to_vec()
    }

    pub fn block_len(&self) -> usize {
        self.read_blocks().len()
    }

    pub fn set_blocks(&self, blocks: Vec<Arc<Block>>) {
        *self.write_blocks() = blocks;
    }

    pub fn take_blocks(&self) -> Vec<Arc<Block>> {
        std::mem::take(&mut *self.write_blocks())
    }

    /// Keep the first `keep` blocks and return the rest.
    pub fn split_blocks(&self, keep: usize) -> Vec<Arc<Block>> {
        let mut blocks = self.write_blocks();
        let keep = keep.min(blocks.len());
        blocks.split_off(keep)
    }

    /// Append holes up to `last` and a buffered block at `last`.
    pub fn grow_to(&self, last: u64, buffer: Buffer) {
        let mut blocks = self.write_blocks();
        for index in blocks.len() as u64..last {
            blocks.push(Arc::new(Block::hole(index as u32)));
        }
        blocks.push(Arc::new(Block::local(last as u32, buffer)));
    }
}

pub fn validate_block_list(list: &[CommittedBlock], layout: &BlockLayout, size: u64) -> bool {
    let Some((last, rest)) = list.split_last() else {
        return false;
    };
    if rest.iter().any(|b| b.size != layout.block_size) {
        return false;
    }
    if last.size == 0 || last.size > layout.block_size {
        return false;
    }
    if list.iter().any(|b| b.id.len() != BLOCK_ID_LEN) {
        return false;
    }
    list.iter().map(|b| b.size).sum::<u64>() == size
}

/// Blocks of a validated list.
pub fn blocks_from_list(list: &[CommittedBlock]) -> Vec<Arc<Block>> {
    list.iter()
        .enumerate()
        .map(|(i, b)| Arc::new(Block::committed(i as u32, b.id.clone())))
        .collect()
}

/// Uniform reconstruction for a blob whose list could not be used. The ids
/// are placeholders; such a file is never committed.
pub fn reconstruct_block_list(layout: &BlockLayout, size: u64) -> Vec<Arc<Block>> {
    (0..layout.block_count(size))
        .map(|i| Arc::new(Block::committed(i as u32, " ".to_string())))
        .collect()
}

pub fn list_has_zero_block(list: &[CommittedBlock]) -> bool {
    list.iter().any(|b| b.id == ZERO_BLOCK_ID)
}
