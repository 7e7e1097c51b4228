//! Local directory backend, a stand-in for a block-blob service.
//!
//! Layout under the root, per blob (keyed by the sha256 of its name):
//! - `<h[0..2]>/<h[2..]>/staged/<hex(id)>`: staged, uncommitted blocks
//! - `<h[0..2]>/<h[2..]>/blocks/<hex(id)>`: committed blocks
//! - `<h[0..2]>/<h[2..]>/blocklist.json`: the committed block list

use crate::cadapter::client::{CommittedBlock, ObjectAttr, RemoteError, RemoteStore};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const MANIFEST: &str = "blocklist.json";

pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `<cache dir>/blockcache`, falling back to the temp dir.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("blockcache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_dir(&self, name: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        let hash_str = hex::encode(hasher.finalize());
        self.root.join(&hash_str[0..2]).join(&hash_str[2..])
    }

    fn staged_path(dir: &Path, block_id: &str) -> PathBuf {
        dir.join("staged").join(hex::encode(block_id.as_bytes()))
    }

    fn block_path(dir: &Path, block_id: &str) -> PathBuf {
        dir.join("blocks").join(hex::encode(block_id.as_bytes()))
    }

    async fn load_manifest(&self, name: &str) -> Result<Vec<CommittedBlock>, RemoteError> {
        let path = self.blob_dir(name).join(MANIFEST);
        match fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RemoteError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RemoteError> {
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(data).await?;
        f.flush().await?;
        drop(f);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_unlisted(dir: &Path, keep: &HashSet<String>) -> Result<(), RemoteError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !keep.contains(&file_name) {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for LocalFsStore {
    async fn read_range(
        &self,
        name: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError> {
        let list = self.load_manifest(name).await?;
        let dir = self.blob_dir(name);
        let mut copied = 0usize;
        let mut start = 0u64;
        for block in &list {
            if copied == buf.len() {
                break;
            }
            let end = start + block.size;
            let want = offset + copied as u64;
            if want >= start && want < end {
                let data = fs::read(Self::block_path(&dir, &block.id)).await?;
                let from = (want - start) as usize;
                let avail = data.len().saturating_sub(from);
                let take = avail.min(buf.len() - copied);
                buf[copied..copied + take].copy_from_slice(&data[from..from + take]);
                copied += take;
            }
            start = end;
        }
        Ok(copied)
    }

    async fn stage(&self, name: &str, block_id: &str, data: Bytes) -> Result<(), RemoteError> {
        let dir = self.blob_dir(name);
        let path = Self::staged_path(&dir, block_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Self::write_atomic(&path, &data).await
    }

    async fn commit(
        &self,
        name: &str,
        block_ids: &[String],
        _block_size: u64,
    ) -> Result<(), RemoteError> {
        let dir = self.blob_dir(name);
        fs::create_dir_all(dir.join("blocks")).await?;

        let mut list = Vec::with_capacity(block_ids.len());
        let mut keep = HashSet::new();
        for id in block_ids {
            let committed = Self::block_path(&dir, id);
            let staged = Self::staged_path(&dir, id);
            match fs::rename(&staged, &committed).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let meta = match fs::metadata(&committed).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(RemoteError::Other(format!(
                        "block {id} of {name} not found"
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            keep.insert(hex::encode(id.as_bytes()));
            list.push(CommittedBlock {
                id: id.clone(),
                size: meta.len(),
            });
        }

        let manifest = serde_json::to_vec(&list)?;
        Self::write_atomic(&dir.join(MANIFEST), &manifest).await?;

        Self::remove_unlisted(&dir.join("staged"), &HashSet::new()).await?;
        Self::remove_unlisted(&dir.join("blocks"), &keep).await?;
        Ok(())
    }

    async fn get_committed_block_list(
        &self,
        name: &str,
    ) -> Result<Vec<CommittedBlock>, RemoteError> {
        self.load_manifest(name).await
    }

    async fn get_attributes(&self, name: &str) -> Result<ObjectAttr, RemoteError> {
        let list = self.load_manifest(name).await?;
        let meta = fs::metadata(self.blob_dir(name).join(MANIFEST)).await?;
        Ok(ObjectAttr {
            size: list.iter().map(|b| b.size).sum(),
            mtime: meta.modified()?,
        })
    }
}
