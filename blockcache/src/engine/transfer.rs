//! Per-block download/upload protocol.
//!
//! At most one download and one upload are in flight per block. A caller
//! that finds a transfer in flight either leaves (async) or waits on its
//! completion (sync). A sync caller stuck behind a background transfer waits
//! at most `sync_wait`, then cancels it, waits for the worker to let go and
//! resubmits at sync priority. Sync transfers are never cancelled by other
//! callers, and a background download's failure is never reported to a
//! foreground reader.

use super::Inner;
use crate::block::completion::{Completion, completion};
use crate::block::{Block, BlockRef, BlockState, InFlight, Priority, Staged, next_transfer_id};
use crate::buffer::stages::Stage;
use crate::daemon::worker::{Task, Ticket};
use crate::error::{Error, Result};
use crate::vfs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum Step<T> {
    Wait {
        id: u64,
        priority: Priority,
        done: Completion<T>,
        cancel: CancellationToken,
    },
    Submit(Ticket<T>, Completion<T>),
}

fn start<T: Clone>(priority: Priority) -> (InFlight<T>, Ticket<T>, Completion<T>) {
    let (completer, done) = completion();
    let id = next_transfer_id();
    let cancel = CancellationToken::new();
    let record = InFlight {
        id,
        priority,
        done: done.clone(),
        cancel: cancel.clone(),
    };
    let ticket = Ticket {
        id,
        cancel,
        completer,
    };
    (record, ticket, done)
}

enum Waited {
    /// The transfer finished (either way); look at the block again.
    Finished,
    /// Timed out and cancelled; the stale record has to be dropped.
    Cancelled,
}

impl Inner {
    async fn wait_for<T: Clone>(
        &self,
        caller: Priority,
        theirs: Priority,
        done: &Completion<T>,
        cancel: &CancellationToken,
    ) -> Waited {
        if theirs == Priority::Sync || caller == Priority::Async {
            let _ = done.wait().await;
            return Waited::Finished;
        }
        if done.wait_timeout(self.config.sync_wait()).await.is_some() {
            return Waited::Finished;
        }
        cancel.cancel();
        let _ = done.wait().await;
        Waited::Cancelled
    }

    /// Make sure `block` holds its bytes. Async callers only make sure a
    /// download is in flight.
    pub(crate) async fn download(
        &self,
        file: &Arc<File>,
        block: &BlockRef,
        priority: Priority,
    ) -> Result<()> {
        loop {
            let step = {
                let mut inner = block.lock();
                if let Some(buf) = inner.buffer.as_mut() {
                    buf.touch();
                    return Ok(());
                }
                if inner.hole {
                    return Ok(());
                }
                match &inner.download {
                    Some(_) if priority == Priority::Async => return Ok(()),
                    Some(f) => Step::Wait {
                        id: f.id,
                        priority: f.priority,
                        done: f.done.clone(),
                        cancel: f.cancel.clone(),
                    },
                    None => {
                        let (record, ticket, done) = start(priority);
                        inner.download = Some(record);
                        Step::Submit(ticket, done)
                    }
                }
            };

            match step {
                Step::Submit(ticket, done) => {
                    let id = ticket.id;
                    if self.pool.available() == 0 {
                        self.reclaim(Duration::ZERO);
                    }
                    let task = Task::Download {
                        file: file.clone(),
                        block: block.clone(),
                        ticket,
                    };
                    if let Err(e) = self.workers.submit(task, priority).await {
                        clear_download(block, id);
                        return Err(e);
                    }
                    if priority == Priority::Async {
                        return Ok(());
                    }
                    match done.wait().await {
                        Err(Error::Cancelled) => continue,
                        Err(e) => return Err(e),
                        Ok(()) => continue,
                    }
                }
                Step::Wait {
                    id,
                    priority: theirs,
                    done,
                    cancel,
                } => match self.wait_for(priority, theirs, &done, &cancel).await {
                    // A failed prefetch is retried here at sync priority.
                    Waited::Finished => match done.peek() {
                        Some(Err(e)) if e != Error::Cancelled && theirs == Priority::Sync => {
                            return Err(e);
                        }
                        _ => continue,
                    },
                    Waited::Cancelled => {
                        debug!(
                            path = file.path(),
                            index = block.index(),
                            "background download too slow, resubmitting"
                        );
                        clear_download(block, id);
                    }
                },
            }
        }
    }

    /// Stage a `Local` block. Sync callers return once the block is
    /// `Uncommitted`; async callers once an upload is in flight.
    pub(crate) async fn upload(
        &self,
        file: &Arc<File>,
        block: &BlockRef,
        priority: Priority,
    ) -> Result<()> {
        let key = file.key(block.index());
        loop {
            let step = {
                let mut inner = block.lock();
                if inner.state != BlockState::Local || inner.hole {
                    return Ok(());
                }
                match inner.upload.take() {
                    Some(f) if f.done.is_done() => match f.done.peek() {
                        Some(Ok(Staged {
                            remote_id,
                            version,
                        })) if version == inner.version => {
                            inner.remote_id = remote_id;
                            inner.state = BlockState::Uncommitted;
                            drop(inner);
                            self.pool.track(key, Stage::Synced);
                            return Ok(());
                        }
                        Some(Err(e)) if e != Error::Cancelled => {
                            drop(inner);
                            self.pool.track(key, Stage::Local);
                            return Err(e);
                        }
                        // Stale or cancelled: stage again.
                        _ => {
                            let (record, ticket, done) = start(priority);
                            inner.upload = Some(record);
                            Step::Submit(ticket, done)
                        }
                    },
                    Some(f) => {
                        let step = Step::Wait {
                            id: f.id,
                            priority: f.priority,
                            done: f.done.clone(),
                            cancel: f.cancel.clone(),
                        };
                        inner.upload = Some(f);
                        if priority == Priority::Async {
                            return Ok(());
                        }
                        step
                    }
                    None => {
                        let (record, ticket, done) = start(priority);
                        inner.upload = Some(record);
                        Step::Submit(ticket, done)
                    }
                }
            };

            match step {
                Step::Submit(ticket, done) => {
                    let id = ticket.id;
                    self.pool.track(key, Stage::Uploading);
                    let task = Task::Upload {
                        file: file.clone(),
                        block: block.clone(),
                        ticket,
                    };
                    if let Err(e) = self.workers.submit(task, priority).await {
                        clear_upload(block, id);
                        self.pool.track(key, Stage::Local);
                        return Err(e);
                    }
                    if priority == Priority::Async {
                        return Ok(());
                    }
                    let _ = done.wait().await;
                }
                Step::Wait {
                    id,
                    priority: theirs,
                    done,
                    cancel,
                } => {
                    if let Waited::Cancelled = self.wait_for(priority, theirs, &done, &cancel).await {
                        debug!(
                            path = file.path(),
                            index = block.index(),
                            "background upload too slow, resubmitting"
                        );
                        clear_upload(block, id);
                    }
                }
            }
        }
    }

    /// Cancel the block's download, if any, and wait for the worker.
    pub(crate) async fn cancel_download(&self, block: &Block) {
        let record = {
            let inner = block.lock();
            inner
                .download
                .as_ref()
                .map(|f| (f.id, f.cancel.clone(), f.done.clone()))
        };
        if let Some((id, cancel, done)) = record {
            cancel.cancel();
            let _ = done.wait().await;
            let mut inner = block.lock();
            if inner.download.as_ref().is_some_and(|f| f.id == id) {
                inner.download = None;
            }
        }
    }

    /// Cancel the block's upload, if any, and wait for the worker. An
    /// unconsumed outcome is discarded with the record.
    pub(crate) async fn cancel_upload(&self, block: &Block) {
        let record = {
            let inner = block.lock();
            inner
                .upload
                .as_ref()
                .map(|f| (f.id, f.cancel.clone(), f.done.clone()))
        };
        if let Some((id, cancel, done)) = record {
            cancel.cancel();
            let _ = done.wait().await;
            clear_upload(block, id);
        }
    }

    /// Make sure a block about to be modified holds a buffer: holes get a
    /// zeroed one, everything else is downloaded.
    pub(crate) async fn ensure_buffer(&self, file: &Arc<File>, block: &BlockRef) -> Result<()> {
        loop {
            let hole = {
                let inner = block.lock();
                if inner.buffer.is_some() {
                    return Ok(());
                }
                inner.hole
            };
            if hole {
                let buf = self.acquire_buffer().await?;
                let mut inner = block.lock();
                if inner.buffer.is_none() {
                    inner.buffer = Some(buf);
                }
                return Ok(());
            }
            self.download(file, block, Priority::Sync).await?;
        }
    }

    /// Turn `block` into a `Local` block with a buffer, so that it is staged
    /// again at its current length.
    pub(crate) async fn make_local(&self, file: &Arc<File>, block: &BlockRef) -> Result<()> {
        if block.lock().hole {
            return Ok(());
        }
        self.cancel_upload(block).await;
        self.ensure_buffer(file, block).await?;
        block.lock().dirty();
        self.pool.track(file.key(block.index()), Stage::Local);
        Ok(())
    }
}

fn clear_download(block: &Block, id: u64) {
    let mut inner = block.lock();
    if inner.download.as_ref().is_some_and(|f| f.id == id) {
        inner.download = None;
    }
}

fn clear_upload(block: &Block, id: u64) {
    let mut inner = block.lock();
    if inner.upload.as_ref().is_some_and(|f| f.id == id) {
        inner.upload = None;
    }
}
