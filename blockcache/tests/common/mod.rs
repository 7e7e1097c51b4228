#![allow(dead_code)]

use async_trait::async_trait;
use blockcache::cadapter::{CommittedBlock, MemoryStore, ObjectAttr, RemoteError, RemoteStore};
use blockcache::{Config, Engine};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Memory store that counts calls and injects faults.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    reads: Mutex<HashMap<u64, usize>>,
    staged: Mutex<Vec<String>>,
    commits: Mutex<Vec<Vec<String>>>,
    /// Delay applied to the first read at a given offset.
    slow_first_read: Mutex<Option<(u64, Duration)>>,
    read_delay: Mutex<Option<Duration>>,
    failing_reads: Mutex<HashSet<u64>>,
    fail_stage_after: Mutex<Option<usize>>,
    stage_calls: AtomicUsize,
    fail_commit: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reads_at(&self, offset: u64) -> usize {
        self.reads.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.reads.lock().unwrap().values().sum()
    }

    pub fn staged(&self) -> Vec<String> {
        self.staged.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<Vec<String>> {
        self.commits.lock().unwrap().clone()
    }

    pub fn slow_first_read_at(&self, offset: u64, delay: Duration) {
        *self.slow_first_read.lock().unwrap() = Some((offset, delay));
    }

    /// Delay every read.
    pub fn delay_reads(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Fail reads starting at any of `offsets`, replacing earlier faults.
    pub fn fail_reads_at(&self, offsets: &[u64]) {
        *self.failing_reads.lock().unwrap() = offsets.iter().copied().collect();
    }

    /// Fail every stage call after the first `n`.
    pub fn fail_stage_after(&self, n: Option<usize>) {
        *self.fail_stage_after.lock().unwrap() = n;
        self.stage_calls.store(0, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for RecordingStore {
    async fn read_range(
        &self,
        name: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError> {
        let first = {
            let mut reads = self.reads.lock().unwrap();
            let count = reads.entry(offset).or_insert(0);
            *count += 1;
            *count == 1
        };
        if self.failing_reads.lock().unwrap().contains(&offset) {
            return Err(RemoteError::Other("injected read failure".into()));
        }
        let slow = *self.slow_first_read.lock().unwrap();
        if let Some((at, delay)) = slow
            && first
            && at == offset
        {
            tokio::time::sleep(delay).await;
        }
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.read_range(name, offset, buf).await
    }

    async fn stage(&self, name: &str, block_id: &str, data: Bytes) -> Result<(), RemoteError> {
        let call = self.stage_calls.fetch_add(1, Ordering::SeqCst);
        let limit = *self.fail_stage_after.lock().unwrap();
        if limit.is_some_and(|n| call >= n) {
            return Err(RemoteError::Other("injected stage failure".into()));
        }
        self.staged.lock().unwrap().push(block_id.to_string());
        self.inner.stage(name, block_id, data).await
    }

    async fn commit(
        &self,
        name: &str,
        block_ids: &[String],
        block_size: u64,
    ) -> Result<(), RemoteError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(RemoteError::Other("injected commit failure".into()));
        }
        self.commits.lock().unwrap().push(block_ids.to_vec());
        self.inner.commit(name, block_ids, block_size).await
    }

    async fn get_committed_block_list(
        &self,
        name: &str,
    ) -> Result<Vec<CommittedBlock>, RemoteError> {
        self.inner.get_committed_block_list(name).await
    }

    async fn get_attributes(&self, name: &str) -> Result<ObjectAttr, RemoteError> {
        self.inner.get_attributes(name).await
    }
}

/// Small blocks and a quiet maintenance loop, so tests see only the
/// transfers they cause.
pub fn test_config(block_size: u64) -> Config {
    Config {
        block_size,
        mem_size: block_size * 64,
        workers: 4,
        sync_wait_ms: 1000,
        acquire_timeout_ms: 500,
        maintenance_interval_ms: 3_600_000,
        ..Config::default()
    }
}

pub fn engine(store: &Arc<RecordingStore>, config: Config) -> Engine {
    Engine::new(config, store.clone()).unwrap()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
