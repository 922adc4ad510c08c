//! Fixed-shape per-slot key/value storage
//!
//! Keys and values live in `[batch, kv_heads, capacity, head_dim]` payloads
//! (plus `[batch, kv_heads, capacity]` scales for Int8). Writes are staged into
//! new tensors and only swapped in on commit, so a failed call leaves every
//! slot untouched.

use std::sync::Arc;

use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::{check_block, check_prefill};
use super::position::{PositionTracker, WindowBounds};
use super::prefill::PrefillCache;
use super::quant::Payload;
use crate::client::CacheClient;
use crate::config::CacheConfig;
use crate::error::{Error, Result, shape_mismatch};

/// A write that has been validated and applied to copies of the payloads.
pub(crate) struct StagedWrite<R: Runtime> {
    keys: Payload<R>,
    values: Payload<R>,
    block_keys: Payload<R>,
    block_values: Payload<R>,
    plans: Vec<WindowBounds>,
}

impl<R: Runtime<DType = DType>> StagedWrite<R> {
    /// Full cache as it will be after commit, decoded to F32.
    pub(crate) fn read_all<C: CacheClient<R>>(&self, client: &C) -> Result<(Tensor<R>, Tensor<R>)> {
        Ok((self.keys.decode(client)?, self.values.decode(client)?))
    }

    /// The written block after its storage round trip.
    pub(crate) fn read_block<C: CacheClient<R>>(&self, client: &C) -> Result<(Tensor<R>, Tensor<R>)> {
        Ok((self.block_keys.decode(client)?, self.block_values.decode(client)?))
    }
}

/// Persistent KV storage for a batch of sequence slots.
pub struct CacheStore<R: Runtime> {
    config: Arc<CacheConfig>,
    keys: Payload<R>,
    values: Payload<R>,
    tracker: PositionTracker,
}

impl<R: Runtime<DType = DType>> CacheStore<R>
where
    R::Client: IndexingOps<R>,
{
    pub fn new(config: Arc<CacheConfig>, device: &R::Device) -> Result<Self> {
        config.validate()?;
        let shape = [
            config.batch_size,
            config.kv_heads(),
            config.capacity,
            config.head_dim,
        ];
        tracing::debug!(
            ?shape,
            storage = ?config.storage,
            policy = ?config.policy,
            "allocating cache store"
        );
        Ok(Self {
            keys: Payload::zeros(&shape, config.storage, device),
            values: Payload::zeros(&shape, config.storage, device),
            tracker: PositionTracker::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn cursor(&self, slot: usize) -> Result<usize> {
        self.tracker.cursor(slot)
    }

    /// Raw encoded payloads (Int8 values carry their scales).
    pub fn payload(&self) -> (&Payload<R>, &Payload<R>) {
        (&self.keys, &self.values)
    }

    /// Write a prompt block at the slot's cursor.
    ///
    /// Returns a prefill cache holding just this block, as stored.
    pub fn write_prefill<C: CacheClient<R>>(
        &mut self,
        client: &C,
        slot: usize,
        keys: &Tensor<R>,
        values: &Tensor<R>,
    ) -> Result<PrefillCache<R>> {
        let tokens = keys.shape().get(2).copied().unwrap_or(0);
        let start = self.cursor(slot)?;
        let positions: Vec<usize> = (start..start + tokens).collect();
        let staged = self.stage(client, &[(slot, positions.as_slice())], keys, values)?;
        let block = PrefillCache::from_block(
            self.config.clone(),
            start,
            staged.block_keys.clone(),
            staged.block_values.clone(),
        );
        self.commit(staged);
        Ok(block)
    }

    /// Write tokens at explicit `positions` and return the slot's full cache.
    ///
    /// `positions` must continue the slot's cursor, one per token of `keys`.
    pub fn write_decode<C: CacheClient<R>>(
        &mut self,
        client: &C,
        slot: usize,
        positions: &[usize],
        keys: &Tensor<R>,
        values: &Tensor<R>,
    ) -> Result<(Tensor<R>, Tensor<R>)> {
        let staged = self.stage(client, &[(slot, positions)], keys, values)?;
        self.commit(staged);
        self.read(client, slot)
    }

    /// Write pre-encoded blocks (e.g. Int8 values with their scales).
    pub fn write_encoded(
        &mut self,
        slot: usize,
        positions: &[usize],
        keys: Payload<R>,
        values: Payload<R>,
    ) -> Result<()> {
        let staged = self.stage_encoded(&[(slot, positions)], keys, values)?;
        self.commit(staged);
        Ok(())
    }

    /// Decoded `[1, kv_heads, capacity, head_dim]` keys and values of one slot.
    pub fn read<C: CacheClient<R>>(&self, client: &C, slot: usize) -> Result<(Tensor<R>, Tensor<R>)> {
        self.tracker.check_slot(slot)?;
        Ok((
            self.keys.narrow_batch(slot, 1)?.decode(client)?,
            self.values.narrow_batch(slot, 1)?.decode(client)?,
        ))
    }

    /// Decoded keys and values of every slot.
    pub fn read_all<C: CacheClient<R>>(&self, client: &C) -> Result<(Tensor<R>, Tensor<R>)> {
        Ok((self.keys.decode(client)?, self.values.decode(client)?))
    }

    /// Forget the slot's contents. Stale entries stay in memory but are masked.
    pub fn reset(&mut self, slot: usize) -> Result<()> {
        self.tracker.reset(slot)?;
        tracing::debug!(slot, "cache slot reset");
        Ok(())
    }

    pub fn reset_all(&mut self) {
        self.tracker.reset_all();
    }

    /// Stage seeding `slot` with a completed prefill; `None` if it is empty.
    ///
    /// A prefill starting at 0 replaces the slot; a later chunk must continue
    /// the slot's cursor.
    pub(crate) fn stage_insert(
        &self,
        slot: usize,
        prefill: &PrefillCache<R>,
    ) -> Result<Option<StagedWrite<R>>> {
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
        self.apply(vec![plan], keys.clone(), values.clone()).map(Some)
    }

    /// Validate and apply a write to copies of the payloads.
    ///
    /// Row `r` of `keys`/`values` goes to `writes[r]`.
    pub(crate) fn stage<C: CacheClient<R>>(
        &self,
        client: &C,
        writes: &[(usize, &[usize])],
        keys: &Tensor<R>,
        values: &Tensor<R>,
    ) -> Result<StagedWrite<R>> {
        let tokens = writes.first().map_or(0, |(_, p)| p.len());
        let expected = [writes.len(), self.config.kv_heads(), tokens, self.config.head_dim];
        check_block("keys", keys, expected)?;
        check_block("values", values, expected)?;
        let plans = self.plan_writes(writes, tokens)?;

        let storage = self.config.storage;
        let block_keys = Payload::encode(client, keys, storage)?;
        let block_values = Payload::encode(client, values, storage)?;
        self.apply(plans, block_keys, block_values)
    }

    fn stage_encoded(
        &self,
        writes: &[(usize, &[usize])],
        keys: Payload<R>,
        values: Payload<R>,
    ) -> Result<StagedWrite<R>> {
        let tokens = writes.first().map_or(0, |(_, p)| p.len());
        let expected = [writes.len(), self.config.kv_heads(), tokens, self.config.head_dim];
        for (arg, payload) in [("keys", &keys), ("values", &values)] {
            if payload.shape() != expected {
                return Err(shape_mismatch(arg, expected, payload.shape()));
            }
            if payload.is_quantized() != self.config.storage.is_quantized() {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!("payload encoding does not match {:?} storage", self.config.storage),
                });
            }
        }
        let plans = self.plan_writes(writes, tokens)?;
        self.apply(plans, keys, values)
    }

    fn plan_writes(&self, writes: &[(usize, &[usize])], tokens: usize) -> Result<Vec<WindowBounds>> {
        let mut seen = vec![false; self.tracker.num_slots()];
        let mut plans = Vec::with_capacity(writes.len());
        for &(slot, positions) in writes {
            if positions.len() != tokens {
                return Err(shape_mismatch("positions", tokens, positions.len()));
            }
            let plan = self.tracker.plan(slot, tokens)?;
            if seen[slot] {
                return Err(Error::InvalidArgument {
                    arg: "slot",
                    reason: format!("slot {slot} written twice in one step"),
                });
            }
            seen[slot] = true;
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
        Ok(plans)
    }

    fn apply(
        &self,
        plans: Vec<WindowBounds>,
        block_keys: Payload<R>,
        block_values: Payload<R>,
    ) -> Result<StagedWrite<R>> {
        let mut keys = self.keys.clone();
        let mut values = self.values.clone();
        for (row, plan) in plans.iter().enumerate() {
            keys = write_row(&keys, &block_keys, row, plan)?;
            values = write_row(&values, &block_values, row, plan)?;
        }
        Ok(StagedWrite {
            keys,
            values,
            block_keys,
            block_values,
            plans,
        })
    }

    pub(crate) fn commit(&mut self, staged: StagedWrite<R>) {
        self.keys = staged.keys;
        self.values = staged.values;
        for plan in &staged.plans {
            tracing::debug!(
                slot = plan.slot,
                start = plan.start,
                count = plan.len(),
                wrapped = plan.end() > self.config.capacity,
                "cache write committed"
            );
            self.tracker.commit(plan);
        }
    }
}

// Copy block row `row` into `plan.slot` along the planned address runs.
fn write_row<R>(
    cache: &Payload<R>,
    block: &Payload<R>,
    row: usize,
    plan: &WindowBounds,
) -> Result<Payload<R>>
where
    R: Runtime<DType = DType>,
    R::Client: IndexingOps<R>,
{
    let src = block.narrow_batch(row, 1)?;
    let mut dst = cache.narrow_batch(plan.slot, 1)?;
    for run in plan.runs() {
        dst = dst.assign_time(&src.narrow_time(run.offset, run.len)?, run.address)?;
    }
    cache.assign_batch(&dst, plan.slot)
}
