//! Physical block bookkeeping for the ragged cache
//!
//! The pool hands out fixed-size blocks from a free list; each sequence slot
//! owns a [`BlockTable`] mapping its logical blocks to physical ones. A block
//! belongs to exactly one table until it is released.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Physical block index into the ragged pool.
pub type BlockId = u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPoolStats {
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub block_size: usize,
    pub total_allocations: usize,
    pub total_frees: usize,
    pub peak_usage: usize,
}

/// Free-list allocator over a fixed number of blocks.
#[derive(Debug, Clone)]
pub struct BlockPool {
    total_blocks: usize,
    block_size: usize,
    free_list: VecDeque<BlockId>,
    in_use: Vec<bool>,
    total_allocations: usize,
    total_frees: usize,
    peak_usage: usize,
}

impl BlockPool {
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            total_blocks,
            block_size,
            free_list: (0..total_blocks as BlockId).collect(),
            in_use: vec![false; total_blocks],
            total_allocations: 0,
            total_frees: 0,
            peak_usage: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn free_block_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.total_blocks - self.free_list.len()
    }

    pub fn can_allocate(&self, count: usize) -> bool {
        self.free_list.len() >= count
    }

    /// Take `count` blocks, or none at all.
    pub fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.free_list.len() < count {
            return Err(Error::OutOfBlocks {
                requested: count,
                free: self.free_list.len(),
            });
        }

        let blocks: Vec<BlockId> = self.free_list.drain(0..count).collect();
        for &b in &blocks {
            self.in_use[b as usize] = true;
        }
        self.total_allocations += 1;
        self.peak_usage = self.peak_usage.max(self.allocated_count());
        Ok(blocks)
    }

    pub fn free(&mut self, blocks: &[BlockId]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        for &block_id in blocks {
            let idx = block_id as usize;
            if idx >= self.total_blocks {
                return Err(Error::InvalidArgument {
                    arg: "block_id",
                    reason: format!(
                        "block {block_id} out of range for pool of {}",
                        self.total_blocks
                    ),
                });
            }
            if !self.in_use[idx] {
                return Err(Error::InvalidArgument {
                    arg: "block_id",
                    reason: format!("block {block_id} is not allocated"),
                });
            }
        }

        for &block_id in blocks {
            self.in_use[block_id as usize] = false;
            self.free_list.push_back(block_id);
        }
        self.total_frees += 1;
        Ok(())
    }

    pub fn stats(&self) -> BlockPoolStats {
        BlockPoolStats {
            total_blocks: self.total_blocks,
            allocated_blocks: self.allocated_count(),
            free_blocks: self.free_list.len(),
            block_size: self.block_size,
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
            peak_usage: self.peak_usage,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.total_blocks, self.block_size);
    }
}

/// Logical → physical block mapping for one sequence.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    pub blocks: Vec<BlockId>,
    pub num_tokens: usize,
    pub block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
        num_tokens.div_ceil(block_size)
    }

    /// Blocks to add so that logical positions `..end` are backed.
    pub fn blocks_missing(&self, end: usize) -> usize {
        Self::blocks_needed(end, self.block_size).saturating_sub(self.blocks.len())
    }

    pub fn append_blocks(&mut self, new_blocks: Vec<BlockId>) {
        self.blocks.extend(new_blocks);
    }

    pub fn get_block(&self, logical_idx: usize) -> Option<BlockId> {
        self.blocks.get(logical_idx).copied()
    }

    /// `(physical block, offset in block)` holding logical position `pos`.
    pub fn resolve(&self, pos: usize) -> Option<(BlockId, usize)> {
        self.get_block(pos / self.block_size)
            .map(|block_id| (block_id, pos % self.block_size))
    }

    /// Drop every block; returns them for release to the pool.
    pub fn take_blocks(&mut self) -> Vec<BlockId> {
        self.num_tokens = 0;
        std::mem::take(&mut self.blocks)
    }
}
