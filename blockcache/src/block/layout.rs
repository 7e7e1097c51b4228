//! Block arithmetic: split file ranges into per-block spans.

/// Fixed-size block layout of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u64,
}

/// A file range's portion inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub index: u64,
    pub offset_in_block: u64,
    pub len: usize,
}

impl BlockLayout {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }

    #[inline]
    pub fn index_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    #[inline]
    pub fn offset_in_block(&self, offset: u64) -> u64 {
        offset % self.block_size
    }

    #[inline]
    pub fn block_start(&self, index: u64) -> u64 {
        index * self.block_size
    }

    /// Bytes of block `index` inside a file of `file_size` bytes.
    pub fn block_len(&self, file_size: u64, index: u64) -> u64 {
        file_size
            .saturating_sub(self.block_start(index))
            .min(self.block_size)
    }

    /// Number of blocks needed to hold `file_size` bytes.
    pub fn block_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.block_size)
    }

    /// Split `[offset, offset + len)` into per-block spans.
    pub fn spans(&self, mut offset: u64, len: usize) -> Vec<BlockSpan> {
        let mut remaining = len as u64;
        let mut out = Vec::new();
        while remaining > 0 {
            let index = self.index_of(offset);
            let offset_in_block = self.offset_in_block(offset);
            let take = (self.block_size - offset_in_block).min(remaining);
            out.push(BlockSpan {
                index,
                offset_in_block,
                len: take as usize,
            });
            offset += take;
            remaining -= take;
        }
        out
    }
}
