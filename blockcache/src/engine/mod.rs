//! Block cache engine
//!
//! Responsibilities:
//! - Translate byte-range reads and writes on open handles into block
//!   operations, downloading blocks on demand with read-ahead.
//! - Grow block lists for writes past EOF, leaving skipped blocks as holes.
//! - Flush: stage every modified block (holes share one zero block) and commit
//!   the full ordered id list.
//! - Release a file's buffers when its last handle closes.
//! - Own the buffer pool, worker pool, file registry and maintenance loop;
//!   several engines can coexist in one process.

mod transfer;

use crate::block::layout::{BlockLayout, BlockSpan};
use crate::block::{Block, BlockInfo, BlockRef, BlockState, Priority, ZERO_BLOCK_ID};
use crate::buffer::stages::{BlockKey, Stage};
use crate::buffer::{Buffer, BufferPool};
use crate::cadapter::client::{ObjectAttr, RemoteError, RemoteStore};
use crate::config::Config;
use crate::daemon::maintenance::{self, Maintenance};
use crate::daemon::worker::{WorkerContext, WorkerPool};
use crate::error::{Error, Result};
use crate::vfs::file::{
    blocks_from_list, list_has_zero_block, reconstruct_block_list, validate_block_list,
};
use crate::vfs::{File, FileRegistry, HandleId, ListState};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Create the blob on first flush if it does not exist.
    pub create: bool,
    /// Discard existing content.
    pub truncate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create: true,
            truncate: false,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) layout: BlockLayout,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) workers: WorkerPool,
    pub(crate) registry: FileRegistry,
    zero_block: Bytes,
    shutdown: CancellationToken,
}

pub struct Engine {
    inner: Arc<Inner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start an engine on the current tokio runtime.
    pub fn new(config: Config, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        config.validate()?;
        let layout = BlockLayout::new(config.block_size);
        let pool = Arc::new(BufferPool::new(
            config.block_size as usize,
            config.max_buffers(),
            config.acquire_timeout(),
        ));
        let shutdown = CancellationToken::new();
        let workers = WorkerPool::start(
            Arc::new(WorkerContext {
                remote: remote.clone(),
                pool: pool.clone(),
                layout,
            }),
            config.workers,
            config.queue_capacity,
            shutdown.child_token(),
        );
        let inner = Arc::new(Inner {
            zero_block: Bytes::from(vec![0u8; config.block_size as usize]),
            layout,
            remote,
            pool,
            workers,
            registry: FileRegistry::new(),
            shutdown: shutdown.clone(),
            config,
        });
        let loop_handle = maintenance::spawn(
            Arc::downgrade(&inner),
            inner.config.maintenance_interval(),
            shutdown,
        );
        info!(
            block_size = inner.config.block_size,
            buffers = inner.pool.capacity(),
            workers = inner.config.workers,
            "block cache engine started"
        );
        Ok(Self {
            inner,
            maintenance: Mutex::new(Some(loop_handle)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn open_files(&self) -> usize {
        self.inner.registry.len()
    }

    pub async fn open(&self, path: &str) -> Result<HandleId> {
        self.open_with(path, OpenOptions::default()).await
    }

    /// Open a handle on `path`. The first open of a file fetches its size
    /// and committed block list; a list that fails validation is replaced by
    /// a uniform reconstruction and the file becomes read-only.
    pub async fn open_with(&self, path: &str, opts: OpenOptions) -> Result<HandleId> {
        let inner = &self.inner;
        inner.check_running()?;
        let (handle, file, _) = inner.registry.open_handle(path);
        let populated = {
            let _exclusive = file.barrier().write().await;
            if file.list_state() == ListState::NotRetrieved {
                inner.populate(&file, opts.create).await
            } else {
                Ok(())
            }
        };
        let truncated = match populated {
            Ok(()) if opts.truncate => inner.truncate_file(&file, 0).await,
            other => other,
        };
        if let Err(e) = truncated {
            if let Ok(Some(file)) = inner.registry.close_handle(handle) {
                inner.release_file(&file).await;
            }
            return Err(e);
        }
        debug!(path, %handle, "opened");
        Ok(handle)
    }

    /// Read into `buf` from `offset`. Returns 0 at or past EOF and a short
    /// count when the range crosses EOF.
    pub async fn read(&self, handle: HandleId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = &self.inner;
        inner.check_running()?;
        let file = inner.registry.file(handle)?;
        let size = file.size();
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let spans = inner.layout.spans(offset, len);
        let first = spans[0].index;
        let blocks = file.blocks_in(first, first + spans.len() as u64);

        let mut copied = 0;
        for span in spans {
            let Some(block) = blocks.get((span.index - first) as usize) else {
                break;
            };
            let block = block.acquire();
            let dst = &mut buf[copied..copied + span.len];
            inner.read_block(&file, &block, span, dst).await?;
            copied += span.len;
        }
        Ok(copied)
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub async fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        inner.check_running()?;
        let file = inner.registry.file(handle)?;
        if data.is_empty() {
            return Ok(0);
        }
        file.ensure_writable()?;
        let end = offset + data.len() as u64;
        inner.check_capacity(end)?;

        let _shared = file.barrier().read().await;
        let blocks = inner.blocks_for_write(&file, end).await?;
        file.mark_dirty();
        let mut written = 0;
        for span in inner.layout.spans(offset, data.len()) {
            let block = blocks[span.index as usize].acquire();
            inner
                .write_block(&file, &block, span, &data[written..written + span.len])
                .await?;
            written += span.len;
        }
        trace!(path = file.path(), offset, len = written, "write");
        Ok(written)
    }

    /// Stage every modified block and commit the block list.
    pub async fn flush(&self, handle: HandleId) -> Result<()> {
        self.inner.check_running()?;
        let file = self.inner.registry.file(handle)?;
        self.inner.flush_file(&file).await
    }

    pub async fn sync(&self, handle: HandleId) -> Result<()> {
        self.flush(handle).await
    }

    /// Flush and drop `handle`. The handle is gone even if the flush fails;
    /// the flush error is returned.
    pub async fn close(&self, handle: HandleId) -> Result<()> {
        let inner = &self.inner;
        let file = inner.registry.file(handle)?;
        let flushed = inner.flush_file(&file).await;
        if let Err(e) = &flushed {
            warn!(path = file.path(), %handle, "flush on close failed: {e}");
        }
        if let Some(file) = inner.registry.close_handle(handle)? {
            inner.release_file(&file).await;
        }
        flushed
    }

    pub async fn truncate(&self, handle: HandleId, size: u64) -> Result<()> {
        self.inner.check_running()?;
        let file = self.inner.registry.file(handle)?;
        self.inner.truncate_file(&file, size).await
    }

    /// Truncate by path. A file that is not open is opened, truncated and
    /// flushed.
    pub async fn truncate_path(&self, path: &str, size: u64) -> Result<()> {
        if let Some(file) = self.inner.registry.lookup(path) {
            self.inner.check_running()?;
            return self.inner.truncate_file(&file, size).await;
        }
        let handle = self
            .open_with(
                path,
                OpenOptions {
                    create: false,
                    truncate: false,
                },
            )
            .await?;
        let truncated = self.truncate(handle, size).await;
        let closed = self.close(handle).await;
        truncated.and(closed)
    }

    /// Remote attributes, with the size of an open file taking precedence.
    pub async fn stat(&self, path: &str) -> Result<ObjectAttr> {
        let open = self
            .inner
            .registry
            .lookup(path)
            .filter(|f| f.raw_size() >= 0);
        match self.inner.remote.get_attributes(path).await {
            Ok(mut attr) => {
                if let Some(file) = open {
                    attr.size = file.size();
                }
                Ok(attr)
            }
            Err(RemoteError::NotFound(_)) if open.is_some() => Ok(ObjectAttr {
                size: open.map_or(0, |f| f.size()),
                mtime: SystemTime::now(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn file_size(&self, handle: HandleId) -> Result<u64> {
        Ok(self.inner.registry.file(handle)?.size())
    }

    pub fn is_synced(&self, handle: HandleId) -> Result<bool> {
        Ok(self.inner.registry.file(handle)?.is_synced())
    }

    pub async fn block_info(&self, handle: HandleId) -> Result<Vec<BlockInfo>> {
        let file = self.inner.registry.file(handle)?;
        Ok(file.blocks().iter().map(|b| b.info()).collect())
    }

    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) {
        self.inner.maintain().await;
    }

    /// Stop workers and the maintenance loop. Open handles become unusable.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pool.close();
        self.inner.workers.shutdown().await;
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("block cache engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn check_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn check_capacity(&self, end: u64) -> Result<()> {
        if end == 0 {
            return Ok(());
        }
        let index = self.layout.index_of(end - 1);
        if index >= self.config.max_blocks as u64 {
            return Err(Error::NoSpace {
                index,
                max: self.config.max_blocks,
            });
        }
        Ok(())
    }

    async fn populate(&self, file: &Arc<File>, create: bool) -> Result<()> {
        let path = file.path();
        let size = match self.remote.get_attributes(path).await {
            Ok(attr) => Some(attr.size),
            Err(RemoteError::NotFound(_)) if create => None,
            Err(e) => return Err(e.into()),
        };

        let (list_state, hole_punched, synced) = match size {
            None => {
                file.set_size(0);
                (ListState::Valid, false, false)
            }
            Some(0) => {
                file.set_size(0);
                (ListState::Valid, false, true)
            }
            Some(size) => {
                let list = self.remote.get_committed_block_list(path).await?;
                file.set_size(size);
                if validate_block_list(&list, &self.layout, size) {
                    file.set_blocks(blocks_from_list(&list));
                    (ListState::Valid, list_has_zero_block(&list), true)
                } else {
                    warn!(
                        path,
                        size,
                        entries = list.len(),
                        "block list failed validation, opening read-only"
                    );
                    file.set_blocks(reconstruct_block_list(&self.layout, size));
                    (ListState::Invalid, false, true)
                }
            }
        };
        let mut state = file.state();
        state.list_state = list_state;
        state.hole_punched = hole_punched;
        state.synced = synced;
        debug!(path, size = file.size(), blocks = file.block_len(), "populated");
        Ok(())
    }

    async fn read_block(
        &self,
        file: &Arc<File>,
        block: &BlockRef,
        span: BlockSpan,
        dst: &mut [u8],
    ) -> Result<()> {
        let key = file.key(block.index());
        let off = span.offset_in_block as usize;
        let mut missed = false;
        loop {
            {
                let mut inner = block.lock();
                if let Some(buf) = inner.buffer.as_mut() {
                    buf.touch();
                    dst.copy_from_slice(&buf.data()[off..off + dst.len()]);
                    drop(inner);
                    self.pool.touch(key);
                    return Ok(());
                }
                if inner.hole {
                    dst.fill(0);
                    return Ok(());
                }
            }
            if !missed {
                missed = true;
                self.read_ahead(file, block.index()).await;
            }
            self.download(file, block, Priority::Sync).await?;
        }
    }

    async fn read_ahead(&self, file: &Arc<File>, index: u32) {
        let window = self.config.read_ahead as u64;
        if window == 0 || self.pool.available() <= window as usize {
            return;
        }
        let from = index as u64 + 1;
        for block in file.blocks_in(from, from + window) {
            let block = block.acquire();
            if let Err(e) = self.download(file, &block, Priority::Async).await {
                trace!(path = file.path(), index = block.index(), "read-ahead skipped: {e}");
            }
        }
    }

    /// Snapshot of the block list covering `[0, end)`, extended if needed.
    async fn blocks_for_write(&self, file: &Arc<File>, end: u64) -> Result<Vec<Arc<Block>>> {
        let last = self.layout.index_of(end - 1);
        let _growth = file.lock_growth().await;
        let blocks = file.blocks();
        if last >= blocks.len() as u64 {
            if let Some(prev) = blocks.last() {
                self.make_local(file, &prev.acquire()).await?;
            }
            self.extend(file, last).await?;
        }
        file.extend_size(end);
        Ok(file.blocks())
    }

    /// Append holes up to `last` and a buffered block at `last`.
    async fn extend(&self, file: &File, last: u64) -> Result<()> {
        let buf = self.acquire_buffer().await?;
        file.grow_to(last, buf);
        self.pool.track(file.key(last as u32), Stage::Local);
        Ok(())
    }

    async fn write_block(
        &self,
        file: &Arc<File>,
        block: &BlockRef,
        span: BlockSpan,
        src: &[u8],
    ) -> Result<()> {
        self.cancel_upload(block).await;
        let off = span.offset_in_block as usize;
        loop {
            self.ensure_buffer(file, block).await?;
            let mut inner = block.lock();
            let Some(buf) = inner.buffer.as_mut() else {
                continue;
            };
            let end = off + src.len();
            buf.data_mut()[off..end].copy_from_slice(src);
            if end > buf.data_size() {
                buf.set_data_size(end);
            }
            inner.dirty();
            break;
        }
        self.pool.track(file.key(block.index()), Stage::Local);
        Ok(())
    }

    /// Stage the shared zero block once per file.
    async fn punch_hole(&self, file: &File) -> Result<()> {
        if file.hole_punched() {
            return Ok(());
        }
        self.remote
            .stage(file.path(), ZERO_BLOCK_ID, self.zero_block.clone())
            .await?;
        file.set_hole_punched(true);
        debug!(path = file.path(), "staged zero block");
        Ok(())
    }

    async fn flush_file(&self, file: &Arc<File>) -> Result<()> {
        if file.list_state() == ListState::Invalid {
            return Ok(());
        }
        let _exclusive = file.barrier().write().await;
        if file.is_synced() {
            return Ok(());
        }
        let blocks = file.blocks();

        for block in &blocks {
            let local = {
                let inner = block.lock();
                inner.state == BlockState::Local && !inner.hole
            };
            // Failures surface from the sync pass below.
            if local
                && let Err(e) = self.upload(file, &block.acquire(), Priority::Async).await
            {
                trace!(path = file.path(), index = block.index(), "early upload: {e}");
            }
        }

        let mut ids = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let block = block.acquire();
            let local_hole = {
                let inner = block.lock();
                inner.hole && inner.state == BlockState::Local
            };
            if local_hole {
                self.punch_hole(file).await?;
                let mut inner = block.lock();
                inner.remote_id = ZERO_BLOCK_ID.to_string();
                inner.state = BlockState::Uncommitted;
            } else {
                self.upload(file, &block, Priority::Sync).await?;
            }
            ids.push(block.lock().remote_id.clone());
        }

        self.remote
            .commit(file.path(), &ids, self.config.block_size)
            .await?;
        for block in &blocks {
            let mut inner = block.lock();
            if inner.state == BlockState::Uncommitted {
                inner.state = BlockState::Committed;
            }
        }
        {
            let mut state = file.state();
            state.synced = true;
            state.hole_punched = ids.iter().any(|id| id == ZERO_BLOCK_ID);
        }
        info!(path = file.path(), blocks = ids.len(), size = file.size(), "committed");
        Ok(())
    }

    async fn truncate_file(&self, file: &Arc<File>, size: u64) -> Result<()> {
        file.ensure_writable()?;
        self.check_capacity(size)?;
        let _exclusive = file.barrier().write().await;
        let old = file.size();
        if size == old && file.raw_size() >= 0 {
            return Ok(());
        }
        let count = self.layout.block_count(size) as usize;

        if size < old {
            let dropped = file.split_blocks(count);
            self.cancel_transfers(&dropped).await;
            for block in &dropped {
                self.pool.release(file.key(block.index()), block);
            }
            file.set_size(size);
            if let Some(last) = file.blocks().last() {
                let last = last.acquire();
                let tail = self.layout.block_len(size, last.index() as u64);
                if tail < self.layout.block_size || last.lock().hole {
                    self.cancel_upload(&last).await;
                    self.ensure_buffer(file, &last).await?;
                    let mut inner = last.lock();
                    if let Some(buf) = inner.buffer.as_mut() {
                        buf.zero_from(tail as usize);
                    }
                    inner.dirty();
                    drop(inner);
                    self.pool.track(file.key(last.index()), Stage::Local);
                }
            }
        } else {
            if let Some(prev) = file.blocks().last() {
                self.make_local(file, &prev.acquire()).await?;
            }
            if count > file.block_len() {
                self.extend(file, count as u64 - 1).await?;
            }
            file.set_size(size);
        }
        file.mark_dirty();
        debug!(path = file.path(), old, size, "truncated");
        Ok(())
    }

    async fn cancel_transfers(&self, blocks: &[Arc<Block>]) {
        join_all(blocks.iter().map(|block| async move {
            self.cancel_download(block).await;
            self.cancel_upload(block).await;
        }))
        .await;
    }

    /// Forget a file whose last handle closed: stop its transfers and return
    /// its buffers.
    async fn release_file(&self, file: &Arc<File>) {
        let _exclusive = file.barrier().write().await;
        let blocks = file.take_blocks();
        self.cancel_transfers(&blocks).await;
        let mut released = 0;
        for block in &blocks {
            if self.pool.release(file.key(block.index()), block) {
                released += 1;
            }
        }
        debug!(path = file.path(), released, "file released");
    }

    async fn acquire_buffer(&self) -> Result<Buffer> {
        if let Some(buf) = self.pool.try_acquire()? {
            return Ok(buf);
        }
        let reclaimed = self.reclaim(Duration::ZERO);
        trace!(reclaimed, "pool at budget");
        self.pool.acquire().await
    }

    fn resolve(&self, key: BlockKey) -> Option<(Arc<File>, Arc<Block>)> {
        let file = self.registry.by_id(key.0)?;
        let block = file.blocks_in(key.1 as u64, key.1 as u64 + 1).pop()?;
        Some((file, block))
    }

    /// Return buffers of unreferenced committed blocks idle for `min_idle`.
    fn reclaim(&self, min_idle: Duration) -> usize {
        let mut evicted = 0;
        for file in self.registry.files() {
            for block in file.blocks() {
                if block.try_evict(min_idle).is_some() {
                    self.pool.untrack(file.key(block.index()));
                    evicted += 1;
                }
            }
        }
        evicted
    }

    fn evict_synced(&self, n: usize) -> usize {
        let mut evicted = 0;
        for key in self.pool.oldest(Stage::Synced, n) {
            match self.resolve(key) {
                Some((_, block)) => {
                    if block.try_evict(Duration::ZERO).is_some() {
                        self.pool.untrack(key);
                        evicted += 1;
                    }
                }
                None if self.registry.by_id(key.0).is_none() => self.pool.untrack(key),
                None => {}
            }
        }
        evicted
    }

    fn watermark(&self, percent: u8) -> usize {
        self.pool.capacity() * percent as usize / 100
    }

    /// Start background uploads for the oldest local blocks above the
    /// watermark.
    async fn schedule_uploads(&self) {
        let limit = self.watermark(self.config.local_watermark);
        let local = self.pool.stage_len(Stage::Local);
        if local <= limit {
            return;
        }
        for key in self.pool.oldest(Stage::Local, local - limit) {
            let Some((file, block)) = self.resolve(key) else {
                continue;
            };
            if let Err(e) = self.upload(&file, &block.acquire(), Priority::Async).await {
                warn!(path = file.path(), index = key.1, "scheduling upload failed: {e}");
            }
        }
    }

    /// Collect outcomes of background uploads above the watermark.
    async fn poll_uploads(&self) {
        let limit = self.watermark(self.config.local_watermark);
        let uploading = self.pool.stage_len(Stage::Uploading);
        if uploading <= limit {
            return;
        }
        for key in self.pool.oldest(Stage::Uploading, uploading - limit) {
            let Some((file, block)) = self.resolve(key) else {
                continue;
            };
            if let Err(e) = self.upload(&file, &block.acquire(), Priority::Sync).await {
                warn!(path = file.path(), index = key.1, "background upload failed: {e}");
            }
        }
    }
}

#[async_trait]
impl Maintenance for Inner {
    async fn maintain(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut evicted = self.reclaim(self.config.idle_evict());
        let limit = self.watermark(self.config.synced_watermark);
        let synced = self.pool.stage_len(Stage::Synced);
        if synced > limit {
            evicted += self.evict_synced(synced - limit);
        }
        self.schedule_uploads().await;
        self.poll_uploads().await;
        if evicted > 0 {
            debug!(evicted, in_use = self.pool.in_use(), "reclaimed buffers");
        }
    }
}
