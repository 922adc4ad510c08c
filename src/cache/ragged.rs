//! Paged KV storage shared by every sequence of a batch
//!
//! Keys and values live in one `[num_blocks, kv_heads, block_size, head_dim]`
//! pool. Each slot owns a [`BlockTable`]; logical position `p` of slot `s`
//! resolves to `(tables[s].blocks[p / block_size], p % block_size)`.
//! Positions are left-aligned per sequence, so the pool never wraps.

use std::sync::Arc;

use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::blocks::{BlockId, BlockPool, BlockPoolStats, BlockTable};
use super::{check_block, check_prefill};
use super::position::{PositionTracker, WindowBounds};
use super::prefill::PrefillCache;
use super::quant::Payload;
use crate::client::CacheClient;
use crate::config::CacheConfig;
use crate::error::{Error, Result, shape_mismatch};

/// Flattened per-token indirection for every cached token, slot-major.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaggedIndex {
    /// Slot each token belongs to.
    pub batch_index: Vec<usize>,
    /// Physical block holding the token.
    pub block_index: Vec<BlockId>,
    /// Offset of the token inside its block.
    pub block_offset: Vec<usize>,
    /// Logical position of the token in its sequence.
    pub positions: Vec<usize>,
}

impl RaggedIndex {
    pub fn len(&self) -> usize {
        self.batch_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch_index.is_empty()
    }
}

pub(crate) struct StagedRagged<R: Runtime> {
    keys: Payload<R>,
    values: Payload<R>,
    block_keys: Payload<R>,
    block_values: Payload<R>,
    pool: BlockPool,
    tables: Vec<BlockTable>,
    plans: Vec<WindowBounds>,
}

impl<R: Runtime<DType = DType>> StagedRagged<R> {
    pub(crate) fn read_block<C: CacheClient<R>>(&self, client: &C) -> Result<(Tensor<R>, Tensor<R>)> {
        Ok((self.block_keys.decode(client)?, self.block_values.decode(client)?))
    }

    /// Pool contents as they will be after commit.
    pub(crate) fn host_pool<C: CacheClient<R>>(&self, client: &C) -> Result<(Vec<f32>, Vec<f32>)> {
        Ok((
            self.keys.decode(client)?.contiguous().to_vec::<f32>(),
            self.values.decode(client)?.contiguous().to_vec::<f32>(),
        ))
    }

    pub(crate) fn tables(&self) -> &[BlockTable] {
        &self.tables
    }
}

/// Block-paged cache with exclusive per-sequence block ownership.
pub struct RaggedCache<R: Runtime> {
    config: Arc<CacheConfig>,
    keys: Payload<R>,
    values: Payload<R>,
    pool: BlockPool,
    tables: Vec<BlockTable>,
    tracker: PositionTracker,
}

impl<R: Runtime<DType = DType>> RaggedCache<R>
where
    R::Client: IndexingOps<R>,
{
    pub fn new(config: Arc<CacheConfig>, device: &R::Device) -> Result<Self> {
        config.validate()?;
        let num_blocks = config.ragged_pool_blocks();
        let block_size = config.ragged_block_size;
        let shape = [num_blocks, config.kv_heads(), block_size, config.head_dim];
        tracing::debug!(num_blocks, block_size, storage = ?config.storage, "allocating ragged pool");
        Ok(Self {
            keys: Payload::zeros(&shape, config.storage, device),
            values: Payload::zeros(&shape, config.storage, device),
            pool: BlockPool::new(num_blocks, block_size),
            tables: vec![BlockTable::new(block_size); config.batch_size],
            tracker: PositionTracker::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    pub fn cursor(&self, slot: usize) -> Result<usize> {
        self.tracker.cursor(slot)
    }

    pub fn cursors(&self) -> &[usize] {
        self.tracker.cursors()
    }

    pub fn block_table(&self, slot: usize) -> Result<&BlockTable> {
        self.tracker.check_slot(slot)?;
        Ok(&self.tables[slot])
    }

    pub(crate) fn tables(&self) -> &[BlockTable] {
        &self.tables
    }

    pub fn pool_stats(&self) -> BlockPoolStats {
        self.pool.stats()
    }

    /// Physical `(block, offset)` of a cached position.
    pub fn resolve(&self, slot: usize, pos: usize) -> Result<(BlockId, usize)> {
        let cursor = self.cursor(slot)?;
        if pos >= cursor {
            return Err(Error::InvalidArgument {
                arg: "pos",
                reason: format!("position {pos} not cached on slot {slot} (cursor {cursor})"),
            });
        }
        self.tables[slot].resolve(pos).ok_or_else(|| Error::InvalidArgument {
            arg: "pos",
            reason: format!("position {pos} has no block on slot {slot}"),
        })
    }

    pub fn ragged_index(&self) -> RaggedIndex {
        let mut index = RaggedIndex::default();
        for (slot, table) in self.tables.iter().enumerate() {
            for pos in 0..self.tracker.cursors()[slot] {
                if let Some((block, offset)) = table.resolve(pos) {
                    index.batch_index.push(slot);
                    index.block_index.push(block);
                    index.block_offset.push(offset);
                    index.positions.push(pos);
                }
            }
        }
        index
    }

    /// Decoded `[1, kv_heads, cursor, head_dim]` keys and values of one sequence,
    /// gathered from its own blocks only.
    pub fn read<C: CacheClient<R>>(&self, client: &C, slot: usize) -> Result<(Tensor<R>, Tensor<R>)> {
        let len = self.cursor(slot)?;
        Ok((
            self.gather(client, &self.keys, slot, len)?,
            self.gather(client, &self.values, slot, len)?,
        ))
    }

    fn gather<C: CacheClient<R>>(
        &self,
        client: &C,
        pool: &Payload<R>,
        slot: usize,
        len: usize,
    ) -> Result<Tensor<R>> {
        let table = &self.tables[slot];
        let mut gathered: Option<Payload<R>> = None;
        for &block in table.blocks.iter().take(BlockTable::blocks_needed(len, table.block_size)) {
            let piece = pool.narrow_batch(block as usize, 1)?;
            gathered = Some(match gathered {
                Some(acc) => acc.concat_time(client, &piece)?,
                None => piece,
            });
        }
        match gathered {
            Some(all) => all.narrow_time(0, len)?.decode(client),
            None => {
                let shape = [1, self.config.kv_heads(), 0, self.config.head_dim];
                Ok(Tensor::<R>::zeros(&shape, DType::F32, pool_device(pool)))
            }
        }
    }

    /// Decoded whole pool as host vectors, `[num_blocks, kv_heads, block_size, head_dim]`.
    pub(crate) fn host_pool<C: CacheClient<R>>(&self, client: &C) -> Result<(Vec<f32>, Vec<f32>)> {
        Ok((
            self.keys.decode(client)?.contiguous().to_vec::<f32>(),
            self.values.decode(client)?.contiguous().to_vec::<f32>(),
        ))
    }

    /// Give every block of `slot` back to the pool and rewind it to position 0.
    pub fn release(&mut self, slot: usize) -> Result<()> {
        self.tracker.check_slot(slot)?;
        let blocks = self.tables[slot].take_blocks();
        self.pool.free(&blocks)?;
        self.tracker.reset(slot)?;
        tracing::debug!(slot, released = blocks.len(), free = self.pool.free_block_count(), "ragged slot released");
        Ok(())
    }

    pub(crate) fn stage<C: CacheClient<R>>(
        &self,
        client: &C,
        writes: &[(usize, &[usize])],
        keys: &Tensor<R>,
        values: &Tensor<R>,
    ) -> Result<StagedRagged<R>> {
        let tokens = writes.first().map_or(0, |(_, p)| p.len());
        let expected = [writes.len(), self.config.kv_heads(), tokens, self.config.head_dim];
        check_block("keys", keys, expected)?;
        check_block("values", values, expected)?;

        let mut seen = vec![false; self.tables.len()];
        let mut plans = Vec::with_capacity(writes.len());
        for &(slot, positions) in writes {
            if positions.len() != tokens {
                return Err(shape_mismatch("positions", tokens, positions.len()));
            }
            let plan = self.tracker.plan(slot, tokens)?;
            if std::mem::replace(&mut seen[slot], true) {
                return Err(Error::InvalidArgument {
                    arg: "slot",
                    reason: format!("slot {slot} written twice in one step"),
                });
            }
            if !plan.positions().eq(positions.iter().copied()) {
                return Err(Error::InvalidArgument {
                    arg: "positions",
                    reason: format!(
                        "slot {slot} expects positions starting at {}, got {positions:?}",
                        plan.start
                    ),
                });
            }
            plans.push(plan);
        }

        let storage = self.config.storage;
        let block_keys = Payload::encode(client, keys, storage)?;
        let block_values = Payload::encode(client, values, storage)?;
        self.apply(plans, block_keys, block_values, None)
    }

    /// Stage seeding `slot` from a batch-1 prefill cache; `None` if it is empty.
    pub(crate) fn stage_insert(
        &self,
        slot: usize,
        prefill: &PrefillCache<R>,
    ) -> Result<Option<StagedRagged<R>>> {
        let Some((keys, values)) = prefill.payload() else {
            return Ok(None);
        };
        check_prefill(&self.config, prefill)?;
        let start = prefill.start();
        let cursor = self.cursor(slot)?;
        if start != 0 && start != cursor {
            return Err(Error::InvalidArgument {
                arg: "prefill",
                reason: format!("prefill starts at {start} but slot {slot} is at {cursor}"),
            });
        }
        let plan = self.tracker.plan_from(slot, start, prefill.len())?;
        let replace = (start == 0).then_some(slot);
        self.apply(vec![plan], keys.clone(), values.clone(), replace).map(Some)
    }

    fn apply(
        &self,
        plans: Vec<WindowBounds>,
        block_keys: Payload<R>,
        block_values: Payload<R>,
        replace: Option<usize>,
    ) -> Result<StagedRagged<R>> {
        let mut pool = self.pool.clone();
        let mut tables = self.tables.clone();
        if let Some(slot) = replace {
            let blocks = tables[slot].take_blocks();
            pool.free(&blocks)?;
        }

        let needed: usize = plans
            .iter()
            .map(|plan| tables[plan.slot].blocks_missing(plan.end()))
            .sum();
        if needed > pool.free_block_count() {
            return Err(Error::OutOfBlocks {
                requested: needed,
                free: pool.free_block_count(),
            });
        }

        let mut keys = self.keys.clone();
        let mut values = self.values.clone();
        for (row, plan) in plans.iter().enumerate() {
            let table = &mut tables[plan.slot];
            let missing = table.blocks_missing(plan.end());
            if missing > 0 {
                let new_blocks = pool.allocate(missing)?;
                tracing::debug!(
                    slot = plan.slot,
                    blocks = ?new_blocks,
                    free = pool.free_block_count(),
                    "ragged blocks allocated"
                );
                table.append_blocks(new_blocks);
            }
            table.num_tokens = plan.end();

            let src_k = block_keys.narrow_batch(row, 1)?;
            let src_v = block_values.narrow_batch(row, 1)?;
            for (offset, block, block_offset, len) in block_runs(table, plan) {
                let b = block as usize;
                let k_dst = keys.narrow_batch(b, 1)?;
                let k_dst = k_dst.assign_time(&src_k.narrow_time(offset, len)?, block_offset)?;
                keys = keys.assign_batch(&k_dst, b)?;
                let v_dst = values.narrow_batch(b, 1)?;
                let v_dst = v_dst.assign_time(&src_v.narrow_time(offset, len)?, block_offset)?;
                values = values.assign_batch(&v_dst, b)?;
            }
        }

        Ok(StagedRagged {
            keys,
            values,
            block_keys,
            block_values,
            pool,
            tables,
            plans,
        })
    }

    pub(crate) fn commit(&mut self, staged: StagedRagged<R>) {
        self.keys = staged.keys;
        self.values = staged.values;
        self.pool = staged.pool;
        self.tables = staged.tables;
        for plan in &staged.plans {
            tracing::debug!(slot = plan.slot, start = plan.start, count = plan.len(), "ragged write committed");
            self.tracker.commit(plan);
        }
    }
}

fn pool_device<R: Runtime>(pool: &Payload<R>) -> &R::Device {
    match pool {
        Payload::Float(t) => t.device(),
        Payload::Quantized(q) => q.values.device(),
    }
}

// (offset in the written block, physical block, offset inside block, run length)
fn block_runs(table: &BlockTable, plan: &WindowBounds) -> Vec<(usize, BlockId, usize, usize)> {
    let mut runs: Vec<(usize, BlockId, usize, usize)> = Vec::new();
    for (i, pos) in plan.positions().enumerate() {
        let Some((block, off)) = table.resolve(pos) else {
            continue;
        };
        match runs.last_mut() {
            Some(run) if run.1 == block && run.2 + run.3 == off => run.3 += 1,
            _ => runs.push((i, block, off, 1)),
        }
    }
    runs
}
