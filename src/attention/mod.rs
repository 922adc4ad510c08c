//! Attention over cached keys/values
//!
//! [`AttentionStrategy`] is chosen once from the [`CacheConfig`] and then
//! drives every forward call of a layer:
//!
//! ```text
//!   (queries, new K/V, positions, cache) ──► stage write (no mutation yet)
//!                                          │
//!              eager, T == 1 ──────────────┤ read staged cache
//!              otherwise ──────────────────┤ read prior cache ++ new block
//!                                          ▼
//!                              mask ──► dense | flash | ragged kernel
//!                                          │
//!                                          ▼
//!                                  commit write, hand cache back
//! ```
//!
//! A failing step never commits, and the cache handle comes back inside
//! [`Rejected`] untouched.

mod dense;
mod flash;
mod kernel;
mod ragged;

use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::cache::generate::Backend;
use crate::cache::{CacheStore, GenerateCache, PrefillCache, check_block};
use crate::client::CacheClient;
use crate::config::{AttentionKind, CacheConfig};
use crate::error::{Error, Rejected, Result, shape_mismatch};
use crate::mask::{AdditiveMask, MaskBuilder};

/// One layer's inputs for a forward call.
///
/// `queries` is `[B, num_heads, T, head_dim]`, `keys`/`values` are
/// `[B, kv_heads, T, head_dim]`, and `positions[b]` lists the logical positions
/// of row `b`'s `T` tokens. Row `b` writes slot `b`.
pub struct AttentionInput<'a, R: Runtime> {
    pub queries: &'a Tensor<R>,
    pub keys: &'a Tensor<R>,
    pub values: &'a Tensor<R>,
    pub positions: &'a [Vec<usize>],
    /// Additive mask replacing the built one, `[B or 1, 1, T, keys]`.
    pub mask: Option<&'a Tensor<R>>,
}

impl<'a, R: Runtime<DType = DType>> AttentionInput<'a, R> {
    pub fn new(
        queries: &'a Tensor<R>,
        keys: &'a Tensor<R>,
        values: &'a Tensor<R>,
        positions: &'a [Vec<usize>],
    ) -> Self {
        Self {
            queries,
            keys,
            values,
            positions,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: &'a Tensor<R>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Returns `(batch, tokens)` once queries and positions agree with `config`.
    fn check(&self, config: &CacheConfig) -> Result<(usize, usize)> {
        let shape = self.queries.shape();
        if shape.len() != 4 {
            return Err(shape_mismatch("queries", "[batch, heads, tokens, head_dim]", shape));
        }
        let (batch, tokens) = (shape[0], shape[2]);
        check_block(
            "queries",
            self.queries,
            [batch, config.num_heads, tokens, config.head_dim],
        )?;
        if tokens == 0 {
            return Err(Error::InvalidArgument {
                arg: "queries",
                reason: "a step needs at least one token".into(),
            });
        }
        if self.positions.len() != batch {
            return Err(shape_mismatch("positions", batch, self.positions.len()));
        }
        for row in self.positions {
            if row.len() != tokens {
                return Err(shape_mismatch("positions", tokens, row.len()));
            }
        }
        Ok((batch, tokens))
    }
}

/// The cache a layer attends through on this call.
pub enum LayerCache<R: Runtime> {
    Prefill(PrefillCache<R>),
    Generate(GenerateCache<R>),
}

/// Which attention computation runs, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionStrategy {
    /// Full `[T, S]` score matrix per head through numr ops.
    Dense,
    /// Online softmax over key tiles of `block_size`.
    Flash { block_size: usize },
    /// Paged pool; each row gathers only its own blocks.
    Ragged { block_size: usize },
}

impl AttentionStrategy {
    /// Validates `config` and picks its strategy.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config.attention {
            AttentionKind::Dense => Self::Dense,
            AttentionKind::Flash => Self::Flash {
                block_size: config.flash_block_size,
            },
            AttentionKind::Ragged => Self::Ragged {
                block_size: config.ragged_block_size,
            },
        })
    }

    pub fn kind(&self) -> AttentionKind {
        match self {
            Self::Dense => AttentionKind::Dense,
            Self::Flash { .. } => AttentionKind::Flash,
            Self::Ragged { .. } => AttentionKind::Ragged,
        }
    }

    /// Prompt pass (or one chunk of it) against a request-scoped cache.
    ///
    /// Every row attends to all positions already in `cache` plus causally
    /// within the new block. On success the block has been appended.
    pub fn prefill<R, C>(
        &self,
        client: &C,
        input: &AttentionInput<'_, R>,
        mut cache: PrefillCache<R>,
    ) -> std::result::Result<(Tensor<R>, PrefillCache<R>), Rejected<PrefillCache<R>>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
    {
        match self.prefill_step(client, input, &mut cache) {
            Ok(out) => Ok((out, cache)),
            Err(e) => Err(Rejected::new(e, cache)),
        }
    }

    /// Decode (or chunked-prefill) step against the persistent cache.
    ///
    /// Row `b` writes slot `b` at `positions[b]`, which must continue the
    /// slot's cursor. Eager update reads after the write, lazy update reads
    /// before it; both commit before returning.
    pub fn decode<R, C>(
        &self,
        client: &C,
        input: &AttentionInput<'_, R>,
        mut cache: GenerateCache<R>,
    ) -> std::result::Result<(Tensor<R>, GenerateCache<R>), Rejected<GenerateCache<R>>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
        R::Client: IndexingOps<R>,
    {
        match self.decode_step(client, input, &mut cache) {
            Ok(out) => Ok((out, cache)),
            Err(e) => Err(Rejected::new(e, cache)),
        }
    }

    /// Dispatch on the kind of cache the layer holds.
    pub fn forward<R, C>(
        &self,
        client: &C,
        input: &AttentionInput<'_, R>,
        cache: LayerCache<R>,
    ) -> std::result::Result<(Tensor<R>, LayerCache<R>), Rejected<LayerCache<R>>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
        R::Client: IndexingOps<R>,
    {
        match cache {
            LayerCache::Prefill(c) => self
                .prefill(client, input, c)
                .map(|(out, c)| (out, LayerCache::Prefill(c)))
                .map_err(|r| {
                    let (e, c) = r.into_parts();
                    Rejected::new(e, LayerCache::Prefill(c))
                }),
            LayerCache::Generate(c) => self
                .decode(client, input, c)
                .map(|(out, c)| (out, LayerCache::Generate(c)))
                .map_err(|r| {
                    let (e, c) = r.into_parts();
                    Rejected::new(e, LayerCache::Generate(c))
                }),
        }
    }

    fn check_kind(&self, config: &CacheConfig) -> Result<()> {
        if config.attention != self.kind() {
            return Err(Error::ConfigConflict {
                reason: format!(
                    "{:?} attention cannot drive a cache built for {:?}",
                    self.kind(),
                    config.attention
                ),
            });
        }
        Ok(())
    }

    fn prefill_step<R, C>(
        &self,
        client: &C,
        input: &AttentionInput<'_, R>,
        cache: &mut PrefillCache<R>,
    ) -> Result<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
    {
        let config = cache.config().clone();
        self.check_kind(&config)?;
        let (batch, tokens) = input.check(&config)?;
        if batch != cache.batch() {
            return Err(shape_mismatch("queries", cache.batch(), batch));
        }
        let start = cache.cursor();
        for row in input.positions {
            if !row.iter().copied().eq(start..start + tokens) {
                return Err(Error::InvalidArgument {
                    arg: "positions",
                    reason: format!("prefill block must start at {start}, got {row:?}"),
                });
            }
        }
        tracing::trace!(strategy = ?self, batch, start, tokens, "prefill step");

        let staged = cache.stage(client, input.keys, input.values)?;
        let (keys, values) = staged.read(client)?;
        let masks = match input.mask {
            Some(mask) => split_mask(client, mask, batch, tokens, keys.shape()[2])?,
            None => {
                let builder = MaskBuilder::new(&config);
                vec![builder.prefill_mask(cache.start(), &input.positions[0]); batch]
            }
        };
        let out = self.contiguous_kernel(client, input.queries, &keys, &values, &masks)?;
        cache.commit(staged);
        Ok(out)
    }

    fn decode_step<R, C>(
        &self,
        client: &C,
        input: &AttentionInput<'_, R>,
        cache: &mut GenerateCache<R>,
    ) -> Result<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
        R::Client: IndexingOps<R>,
    {
        let config = cache.config().clone();
        self.check_kind(&config)?;
        let (batch, tokens) = input.check(&config)?;
        if batch != config.batch_size {
            return Err(shape_mismatch("queries", config.batch_size, batch));
        }
        let builder = MaskBuilder::new(&config);
        tracing::trace!(
            strategy = ?self,
            batch,
            tokens,
            resident = builder.is_resident(tokens),
            "decode step"
        );

        match (self, cache.backend_mut()) {
            (Self::Ragged { block_size }, Backend::Ragged(r)) => {
                if input.mask.is_some() {
                    return Err(Error::InvalidArgument {
                        arg: "mask",
                        reason: "ragged attention builds its own per-sequence masks".into(),
                    });
                }
                ragged::ragged_step(client, input, r, &builder, *block_size)
            }
            (Self::Dense | Self::Flash { .. }, Backend::Slots(store)) => {
                self.slots_step(client, input, store, &builder, tokens)
            }
            _ => Err(Error::ConfigConflict {
                reason: format!("{:?} attention does not match the cache layout", self.kind()),
            }),
        }
    }

    fn slots_step<R, C>(
        &self,
        client: &C,
        input: &AttentionInput<'_, R>,
        store: &mut CacheStore<R>,
        builder: &MaskBuilder,
        tokens: usize,
    ) -> Result<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
        R::Client: IndexingOps<R>,
    {
        let writes: Vec<(usize, &[usize])> = input
            .positions
            .iter()
            .enumerate()
            .map(|(slot, p)| (slot, p.as_slice()))
            .collect();
        let staged = store.stage(client, &writes, input.keys, input.values)?;

        let resident = builder.is_resident(tokens);
        let (keys, values) = if resident {
            staged.read_all(client)?
        } else {
            let (cache_k, cache_v) = store.read_all(client)?;
            let (block_k, block_v) = staged.read_block(client)?;
            (
                client.cat(&[&cache_k, &block_k], 2)?,
                client.cat(&[&cache_v, &block_v], 2)?,
            )
        };

        let masks = match input.mask {
            Some(mask) => split_mask(client, mask, writes.len(), tokens, keys.shape()[2])?,
            None => input
                .positions
                .iter()
                .map(|p| builder.step_mask(p, resident))
                .collect::<Result<Vec<_>>>()?,
        };
        let out = self.contiguous_kernel(client, input.queries, &keys, &values, &masks)?;
        store.commit(staged);
        Ok(out)
    }

    fn contiguous_kernel<R, C>(
        &self,
        client: &C,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        masks: &[AdditiveMask],
    ) -> Result<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        C: CacheClient<R>,
    {
        match *self {
            Self::Dense => dense::dense_attention(client, q, k, v, masks),
            // a prefill cache is contiguous even under ragged attention
            Self::Flash { block_size } | Self::Ragged { block_size } => {
                flash::flash_attention(q, k, v, masks, block_size)
            }
        }
    }
}

/// Per-row `[rows, cols]` masks from a caller-supplied `[B or 1, 1, rows, cols]` tensor.
fn split_mask<R, C>(
    client: &C,
    mask: &Tensor<R>,
    batch: usize,
    rows: usize,
    cols: usize,
) -> Result<Vec<AdditiveMask>>
where
    R: Runtime<DType = DType>,
    C: CacheClient<R>,
{
    let shape = mask.shape();
    let broadcast = shape == [1, 1, rows, cols];
    if !broadcast && shape != [batch, 1, rows, cols] {
        return Err(shape_mismatch("mask", [batch, 1, rows, cols], shape));
    }
    let data = client.cast(mask, DType::F32)?.contiguous().to_vec::<f32>();
    let per_row = rows * cols;
    (0..batch)
        .map(|b| {
            let offset = if broadcast { 0 } else { b * per_row };
            AdditiveMask::from_data(rows, cols, data[offset..offset + per_row].to_vec())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{BufferPolicy, UpdateMode};
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn det(dev: &CpuDevice, shape: &[usize], phase: f32) -> Tensor<CpuRuntime> {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37 + phase).sin()).collect();
        Tensor::<CpuRuntime>::from_slice(&data, shape, dev)
    }

    fn config(attention: AttentionKind, update: UpdateMode) -> Arc<CacheConfig> {
        CacheConfig::new(1, 1, 4, 8)
            .with_policy(BufferPolicy::LeftAligned)
            .with_attention(attention)
            .with_update(update)
            .with_ragged_blocks(2, None)
            .build()
            .unwrap()
    }

    #[test]
    fn test_from_config_rejects_ring_ragged() {
        let mut config = CacheConfig::new(1, 1, 4, 8).with_attention(AttentionKind::Ragged);
        config.policy = BufferPolicy::Ring;
        assert!(matches!(
            AttentionStrategy::from_config(&config),
            Err(Error::ConfigConflict { .. })
        ));
    }

    #[test]
    fn test_strategy_mismatch_hands_cache_back() {
        let (client, dev) = cpu_setup();
        let config = config(AttentionKind::Dense, UpdateMode::Eager);
        let cache = GenerateCache::<CpuRuntime>::new(config, &dev).unwrap();
        let q = det(&dev, &[1, 1, 1, 4], 0.0);
        let kv = det(&dev, &[1, 1, 1, 4], 1.0);
        let positions = vec![vec![0]];
        let input = AttentionInput::new(&q, &kv, &kv, &positions);

        let flash = AttentionStrategy::Flash { block_size: 4 };
        let rejected = flash.decode(&client, &input, cache).err().unwrap();
        assert!(matches!(rejected.error, Error::ConfigConflict { .. }));
        assert_eq!(rejected.cache.cursor(0).unwrap(), 0);
    }

    #[test]
    fn test_first_token_attends_to_itself_in_both_modes() {
        let (client, dev) = cpu_setup();
        let q = det(&dev, &[1, 1, 1, 4], 0.0);
        let k = det(&dev, &[1, 1, 1, 4], 1.0);
        let v = det(&dev, &[1, 1, 1, 4], 2.0);
        let positions = vec![vec![0]];
        let input = AttentionInput::new(&q, &k, &v, &positions);

        for update in [UpdateMode::Eager, UpdateMode::Lazy] {
            for kind in [AttentionKind::Dense, AttentionKind::Flash, AttentionKind::Ragged] {
                let config = config(kind, update);
                let strategy = AttentionStrategy::from_config(&config).unwrap();
                let cache = GenerateCache::<CpuRuntime>::new(config, &dev).unwrap();
                let (out, cache) = strategy.decode(&client, &input, cache).unwrap();
                // a single visible key returns its value exactly
                let got = out.to_vec::<f32>();
                for (a, b) in got.iter().zip(v.to_vec::<f32>()) {
                    assert!((a - b).abs() < 1e-6, "{kind:?}/{update:?}: {a} vs {b}");
                }
                assert_eq!(cache.cursor(0).unwrap(), 1);
            }
        }
    }

    #[test]
    fn test_bad_positions_leave_cache_untouched() {
        let (client, dev) = cpu_setup();
        let config = config(AttentionKind::Dense, UpdateMode::Eager);
        let strategy = AttentionStrategy::from_config(&config).unwrap();
        let cache = GenerateCache::<CpuRuntime>::new(config, &dev).unwrap();
        let q = det(&dev, &[1, 1, 1, 4], 0.0);
        let kv = det(&dev, &[1, 1, 1, 4], 1.0);

        let skipped = vec![vec![3]];
        let input = AttentionInput::new(&q, &kv, &kv, &skipped);
        let (err, cache) = strategy.decode(&client, &input, cache).err().unwrap().into_parts();
        assert!(matches!(err, Error::InvalidArgument { arg: "positions", .. }));
        assert_eq!(cache.cursor(0).unwrap(), 0);

        let too_many = vec![vec![0, 1]];
        let input = AttentionInput::new(&q, &kv, &kv, &too_many);
        let (err, _) = strategy.decode(&client, &input, cache).err().unwrap().into_parts();
        assert!(matches!(err, Error::ShapeMismatch { arg: "positions", .. }));
    }

    #[test]
    fn test_mask_override_must_match_keys() {
        let (client, dev) = cpu_setup();
        let config = config(AttentionKind::Dense, UpdateMode::Lazy);
        let strategy = AttentionStrategy::from_config(&config).unwrap();
        let prefill = PrefillCache::<CpuRuntime>::new(config, 1);
        let q = det(&dev, &[1, 1, 2, 4], 0.0);
        let kv = det(&dev, &[1, 1, 2, 4], 1.0);
        let positions = vec![vec![0, 1]];

        // allow everything, including the future key
        let open = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 4], &[1, 1, 2, 2], &dev);
        let input = AttentionInput::new(&q, &kv, &kv, &positions).with_mask(&open);
        let (_, prefill) = strategy.prefill(&client, &input, prefill).unwrap();
        assert_eq!(prefill.len(), 2);

        let bad = Tensor::<CpuRuntime>::from_slice(&[0.0f32; 6], &[1, 1, 2, 3], &dev);
        let positions = vec![vec![2, 3]];
        let input = AttentionInput::new(&q, &kv, &kv, &positions).with_mask(&bad);
        let (err, prefill) = strategy.prefill(&client, &input, prefill).err().unwrap().into_parts();
        assert!(matches!(err, Error::ShapeMismatch { arg: "mask", .. }));
        assert_eq!(prefill.len(), 2);
    }

    #[test]
    fn test_blocked_mask_agrees_across_kernels() {
        let (client, dev) = cpu_setup();
        let q = det(&dev, &[1, 1, 2, 4], 0.0);
        let kv = det(&dev, &[1, 1, 2, 4], 1.0);
        let positions = vec![vec![0, 1]];
        let blocked = Tensor::<CpuRuntime>::from_slice(&[f32::NEG_INFINITY; 4], &[1, 1, 2, 2], &dev);

        for kind in [AttentionKind::Dense, AttentionKind::Flash] {
            let config = config(kind, UpdateMode::Lazy);
            let strategy = AttentionStrategy::from_config(&config).unwrap();
            let prefill = PrefillCache::<CpuRuntime>::new(config, 1);
            let input = AttentionInput::new(&q, &kv, &kv, &positions).with_mask(&blocked);
            let (out, _) = strategy.prefill(&client, &input, prefill).unwrap();
            let out = out.to_vec::<f32>();
            assert!(out.iter().all(|&x| x == 0.0), "{kind:?}: {out:?}");
        }
    }
}
