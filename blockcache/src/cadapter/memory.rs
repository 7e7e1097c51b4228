//! In-memory remote store, used by tests and local development.

use crate::block::new_block_id;
use crate::cadapter::client::{CommittedBlock, ObjectAttr, RemoteError, RemoteStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

struct Blob {
    committed: Vec<(String, Bytes)>,
    staged: HashMap<String, Bytes>,
    // Blobs written in one piece have no block list to report.
    listed: bool,
    mtime: SystemTime,
}

impl Blob {
    fn empty() -> Self {
        Self {
            committed: Vec::new(),
            staged: HashMap::new(),
            listed: true,
            mtime: SystemTime::now(),
        }
    }

    fn size(&self) -> u64 {
        self.committed.iter().map(|(_, b)| b.len() as u64).sum()
    }

    fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for (_, data) in &self.committed {
            out.extend_from_slice(data);
        }
        out
    }
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Blob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Blob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `data` as a blob without a committed block list.
    pub fn put_blob(&self, name: &str, data: &[u8]) {
        let mut blob = Blob::empty();
        blob.committed.push((String::new(), Bytes::copy_from_slice(data)));
        blob.listed = false;
        self.blobs().insert(name.to_string(), blob);
    }

    /// Store `data` as a blob committed in `block_size` blocks.
    pub fn put_blocks(&self, name: &str, data: &[u8], block_size: usize) {
        let mut blob = Blob::empty();
        for chunk in data.chunks(block_size.max(1)) {
            blob.committed
                .push((new_block_id(), Bytes::copy_from_slice(chunk)));
        }
        self.blobs().insert(name.to_string(), blob);
    }

    /// Store a blob with an explicit committed list of `(id, bytes)` pairs.
    pub fn put_committed(&self, name: &str, blocks: Vec<(String, Vec<u8>)>) {
        let mut blob = Blob::empty();
        blob.committed = blocks
            .into_iter()
            .map(|(id, data)| (id, Bytes::from(data)))
            .collect();
        self.blobs().insert(name.to_string(), blob);
    }

    /// Committed content of `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs().get(name).map(Blob::contents)
    }

    pub fn committed_ids(&self, name: &str) -> Vec<String> {
        self.blobs()
            .get(name)
            .map(|b| b.committed.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn staged_ids(&self, name: &str) -> Vec<String> {
        self.blobs()
            .get(name)
            .map(|b| b.staged.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.blobs().contains_key(name)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read_range(
        &self,
        name: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError> {
        let blobs = self.blobs();
        let blob = blobs
            .get(name)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;
        let mut copied = 0usize;
        let mut start = 0u64;
        for (_, data) in &blob.committed {
            let end = start + data.len() as u64;
            let want = offset + copied as u64;
            if copied < buf.len() && want >= start && want < end {
                let from = (want - start) as usize;
                let take = (data.len() - from).min(buf.len() - copied);
                buf[copied..copied + take].copy_from_slice(&data[from..from + take]);
                copied += take;
            }
            start = end;
        }
        Ok(copied)
    }

    async fn stage(&self, name: &str, block_id: &str, data: Bytes) -> Result<(), RemoteError> {
        let mut blobs = self.blobs();
        let blob = blobs.entry(name.to_string()).or_insert_with(|| {
            let mut b = Blob::empty();
            b.listed = false;
            b
        });
        blob.staged.insert(block_id.to_string(), data);
        Ok(())
    }

    async fn commit(
        &self,
        name: &str,
        block_ids: &[String],
        _block_size: u64,
    ) -> Result<(), RemoteError> {
        let mut blobs = self.blobs();
        let blob = blobs.entry(name.to_string()).or_insert_with(Blob::empty);
        let mut committed = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            let data = blob
                .staged
                .get(id)
                .cloned()
                .or_else(|| {
                    blob.committed
                        .iter()
                        .find(|(cid, _)| cid == id)
                        .map(|(_, d)| d.clone())
                })
                .ok_or_else(|| RemoteError::Other(format!("block {id} of {name} not found")))?;
            committed.push((id.clone(), data));
        }
        blob.committed = committed;
        blob.staged.clear();
        blob.listed = true;
        blob.mtime = SystemTime::now();
        Ok(())
    }

    async fn get_committed_block_list(
        &self,
        name: &str,
    ) -> Result<Vec<CommittedBlock>, RemoteError> {
        let blobs = self.blobs();
        let blob = blobs
            .get(name)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;
        if !blob.listed {
            return Ok(Vec::new());
        }
        Ok(blob
            .committed
            .iter()
            .map(|(id, data)| CommittedBlock {
                id: id.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn get_attributes(&self, name: &str) -> Result<ObjectAttr, RemoteError> {
        let blobs = self.blobs();
        let blob = blobs
            .get(name)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;
        Ok(ObjectAttr {
            size: blob.size(),
            mtime: blob.mtime,
        })
    }
}
