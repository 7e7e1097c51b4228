//! Transfer workers.
//!
//! A fixed set of tokio tasks drains two bounded queues; the sync queue is
//! always polled first. Workers execute a single attempt per task and report
//! the outcome through the task's completer; retries are up to the caller.

use crate::block::completion::Completer;
use crate::block::layout::BlockLayout;
use crate::block::{BlockRef, Priority, Staged, new_block_id};
use crate::buffer::{Buffer, BufferPool};
use crate::buffer::stages::Stage;
use crate::cadapter::client::RemoteStore;
use crate::error::{Error, Result};
use crate::vfs::File;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Handle through which a worker reports one transfer.
pub struct Ticket<T> {
    pub id: u64,
    pub cancel: CancellationToken,
    pub completer: Completer<T>,
}

pub enum Task {
    Download {
        file: Arc<File>,
        block: BlockRef,
        ticket: Ticket<()>,
    },
    Upload {
        file: Arc<File>,
        block: BlockRef,
        ticket: Ticket<Staged>,
    },
}

pub struct WorkerContext {
    pub remote: Arc<dyn RemoteStore>,
    pub pool: Arc<BufferPool>,
    pub layout: BlockLayout,
}

pub struct WorkerPool {
    sync_tx: async_channel::Sender<Task>,
    async_tx: async_channel::Sender<Task>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current runtime.
    pub fn start(
        ctx: Arc<WorkerContext>,
        workers: usize,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (sync_tx, sync_rx) = async_channel::bounded(capacity);
        let (async_tx, async_rx) = async_channel::bounded(capacity);
        let handles = (0..workers)
            .map(|worker| {
                tokio::spawn(run(
                    worker,
                    ctx.clone(),
                    sync_rx.clone(),
                    async_rx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        Self {
            sync_tx,
            async_tx,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Enqueue `task`, waiting while the queue is full.
    pub async fn submit(&self, task: Task, priority: Priority) -> Result<()> {
        let queue = match priority {
            Priority::Sync => &self.sync_tx,
            Priority::Async => &self.async_tx,
        };
        queue.send(task).await.map_err(|_| Error::Shutdown)
    }

    /// Stop accepting tasks, stop the workers and wait for them.
    pub async fn shutdown(&self) {
        self.sync_tx.close();
        self.async_tx.close();
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker exited abnormally: {e}");
            }
        }
    }
}

async fn run(
    worker: usize,
    ctx: Arc<WorkerContext>,
    sync_rx: async_channel::Receiver<Task>,
    async_rx: async_channel::Receiver<Task>,
    shutdown: CancellationToken,
) {
    trace!(worker, "worker started");
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task = sync_rx.recv() => task,
            task = async_rx.recv() => task,
        };
        let Ok(task) = task else { break };
        match task {
            Task::Download {
                file,
                block,
                ticket,
            } => download(&ctx, &file, &block, ticket).await,
            Task::Upload {
                file,
                block,
                ticket,
            } => upload(&ctx, &file, &block, ticket).await,
        }
    }
    trace!(worker, "worker stopped");
}

fn clear_download(block: &BlockRef, id: u64) {
    let mut inner = block.lock();
    if inner.download.as_ref().is_some_and(|f| f.id == id) {
        inner.download = None;
    }
}

async fn fetch(ctx: &WorkerContext, file: &File, block: &BlockRef) -> Result<Buffer> {
    let index = block.index() as u64;
    let len = ctx.layout.block_len(file.size(), index) as usize;
    let mut buf = ctx.pool.acquire().await?;
    let start = ctx.layout.block_start(index);
    let mut filled = 0;
    while filled < len {
        let n = ctx
            .remote
            .read_range(
                file.path(),
                start + filled as u64,
                &mut buf.data_mut()[filled..len],
            )
            .await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.set_data_size(filled);
    Ok(buf)
}

async fn download(ctx: &WorkerContext, file: &File, block: &BlockRef, ticket: Ticket<()>) {
    if ticket.cancel.is_cancelled() {
        clear_download(block, ticket.id);
        ticket.completer.complete(Err(Error::Cancelled));
        return;
    }
    let key = file.key(block.index());
    ctx.pool.track(key, Stage::Downloading);
    let fetched = tokio::select! {
        biased;
        _ = ticket.cancel.cancelled() => Err(Error::Cancelled),
        r = fetch(ctx, file, block) => r,
    };

    let outcome = {
        let mut inner = block.lock();
        let current = inner.download.as_ref().is_some_and(|f| f.id == ticket.id);
        if current {
            inner.download = None;
        }
        match fetched {
            Ok(buf) if current && !ticket.cancel.is_cancelled() => {
                if inner.buffer.is_none() {
                    inner.buffer = Some(buf);
                }
                ctx.pool.track(key, Stage::Synced);
                Ok(())
            }
            Ok(_) => Err(Error::Cancelled),
            Err(e) => Err(e),
        }
    };
    if outcome.is_err() && block.lock().buffer.is_none() {
        ctx.pool.untrack(key);
    }
    if let Err(e) = &outcome
        && *e != Error::Cancelled
    {
        debug!(path = file.path(), index = block.index(), "download failed: {e}");
    }
    ticket.completer.complete(outcome);
}

async fn upload(ctx: &WorkerContext, file: &File, block: &BlockRef, ticket: Ticket<Staged>) {
    if ticket.cancel.is_cancelled() {
        ticket.completer.complete(Err(Error::Cancelled));
        return;
    }
    let snapshot = {
        let inner = block.lock();
        let buf = inner.buffer.as_ref().unwrap_or_else(|| {
            panic!(
                "upload of block {} of {} without a buffer",
                block.index(),
                file.path()
            )
        });
        let len = ctx.layout.block_len(file.size(), block.index() as u64) as usize;
        if len == 0 {
            Err(Error::Contracted)
        } else {
            Ok((Bytes::copy_from_slice(&buf.data()[..len]), inner.version))
        }
    };

    let outcome = match snapshot {
        Ok((data, version)) => {
            let remote_id = new_block_id();
            tokio::select! {
                biased;
                _ = ticket.cancel.cancelled() => Err(Error::Cancelled),
                r = ctx.remote.stage(file.path(), &remote_id, data) => r
                    .map(|()| Staged { remote_id, version })
                    .map_err(Error::from),
            }
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &outcome
        && *e != Error::Cancelled
    {
        debug!(path = file.path(), index = block.index(), "upload failed: {e}");
    }
    ticket.completer.complete(outcome);
}
