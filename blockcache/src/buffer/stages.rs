//! Lifecycle stage lists of buffered blocks, each kept in LRU order.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// `(file id, block index)`
pub type BlockKey = (u64, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Modified, waiting for write-back.
    Local,
    Uploading,
    Downloading,
    /// Content matches the remote.
    Synced,
}

const STAGES: [Stage; 4] = [
    Stage::Local,
    Stage::Uploading,
    Stage::Downloading,
    Stage::Synced,
];

pub struct StageLists {
    lists: HashMap<Stage, LruCache<BlockKey, ()>>,
    stage_of: HashMap<BlockKey, Stage>,
}

impl StageLists {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            lists: STAGES.iter().map(|s| (*s, LruCache::new(cap))).collect(),
            stage_of: HashMap::new(),
        }
    }

    /// Move `key` to the most recent end of `stage`.
    pub fn track(&mut self, key: BlockKey, stage: Stage) {
        if let Some(prev) = self.stage_of.insert(key, stage)
            && prev != stage
            && let Some(list) = self.lists.get_mut(&prev)
        {
            list.pop(&key);
        }
        if let Some(list) = self.lists.get_mut(&stage)
            && let Some((evicted, _)) = list.push(key, ())
            && evicted != key
        {
            self.stage_of.remove(&evicted);
        }
    }

    pub fn touch(&mut self, key: BlockKey) {
        if let Some(stage) = self.stage_of.get(&key)
            && let Some(list) = self.lists.get_mut(stage)
        {
            list.promote(&key);
        }
    }

    pub fn untrack(&mut self, key: BlockKey) {
        if let Some(stage) = self.stage_of.remove(&key)
            && let Some(list) = self.lists.get_mut(&stage)
        {
            list.pop(&key);
        }
    }

    pub fn stage_of(&self, key: BlockKey) -> Option<Stage> {
        self.stage_of.get(&key).copied()
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.lists.get(&stage).map_or(0, LruCache::len)
    }

    /// Up to `n` least recently used keys of `stage`, oldest first.
    pub fn oldest(&self, stage: Stage, n: usize) -> Vec<BlockKey> {
        self.lists
            .get(&stage)
            .map(|list| list.iter().rev().take(n).map(|(k, _)| *k).collect())
            .unwrap_or_default()
    }
}
