//! Request-scoped cache for the prompt pass

use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::check_block;
use super::quant::Payload;
use crate::client::CacheClient;
use crate::config::{BufferPolicy, CacheConfig};
use crate::error::{Error, Result};

/// Keys/values produced by the current prompt, not yet merged into a slot.
///
/// Holds logical positions `start..start + len` for `batch` prompts, already in
/// the storage encoding, so prefill attention reads exactly what decode steps
/// will read after [`GenerateCache::insert_prefill`](super::GenerateCache::insert_prefill).
/// Successive chunks append; each chunk attends to everything before it.
pub struct PrefillCache<R: Runtime> {
    config: Arc<CacheConfig>,
    batch: usize,
    start: usize,
    keys: Option<Payload<R>>,
    values: Option<Payload<R>>,
}

pub(crate) struct StagedPrefill<R: Runtime> {
    keys: Payload<R>,
    values: Payload<R>,
}

impl<R: Runtime<DType = DType>> StagedPrefill<R> {
    /// Every position held after commit, decoded to F32.
    pub(crate) fn read<C: CacheClient<R>>(&self, client: &C) -> Result<(Tensor<R>, Tensor<R>)> {
        Ok((self.keys.decode(client)?, self.values.decode(client)?))
    }
}

impl<R: Runtime<DType = DType>> PrefillCache<R> {
    /// Empty cache for `batch` prompts starting at position 0.
    pub fn new(config: Arc<CacheConfig>, batch: usize) -> Self {
        Self {
            config,
            batch,
            start: 0,
            keys: None,
            values: None,
        }
    }

    pub(crate) fn from_block(
        config: Arc<CacheConfig>,
        start: usize,
        keys: Payload<R>,
        values: Payload<R>,
    ) -> Self {
        Self {
            batch: keys.shape()[0],
            config,
            start,
            keys: Some(keys),
            values: Some(values),
        }
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// First logical position held.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Tokens held.
    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, Payload::time_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next logical position to be written.
    pub fn cursor(&self) -> usize {
        self.start + self.len()
    }

    pub fn payload(&self) -> Option<(&Payload<R>, &Payload<R>)> {
        self.keys.as_ref().zip(self.values.as_ref())
    }

    /// Decoded `[batch, kv_heads, len, head_dim]` keys and values.
    pub fn read<C: CacheClient<R>>(&self, client: &C) -> Result<(Tensor<R>, Tensor<R>)> {
        match self.payload() {
            Some((k, v)) => Ok((k.decode(client)?, v.decode(client)?)),
            None => Err(Error::InvalidArgument {
                arg: "prefill",
                reason: "prefill cache is empty".into(),
            }),
        }
    }

    pub(crate) fn stage<C: CacheClient<R>>(
        &self,
        client: &C,
        keys: &Tensor<R>,
        values: &Tensor<R>,
    ) -> Result<StagedPrefill<R>> {
        let tokens = keys.shape().get(2).copied().unwrap_or(0);
        let expected = [self.batch, self.config.kv_heads(), tokens, self.config.head_dim];
        check_block("keys", keys, expected)?;
        check_block("values", values, expected)?;

        let end = self.cursor() + tokens;
        if self.config.policy == BufferPolicy::LeftAligned && end > self.config.capacity {
            return Err(Error::CapacityExceeded {
                slot: 0,
                requested: end - 1,
                capacity: self.config.capacity,
            });
        }

        let storage = self.config.storage;
        let block_keys = Payload::encode(client, keys, storage)?;
        let block_values = Payload::encode(client, values, storage)?;
        let (keys, values) = match self.payload() {
            Some((k, v)) => (
                k.concat_time(client, &block_keys)?,
                v.concat_time(client, &block_values)?,
            ),
            None => (block_keys, block_values),
        };
        Ok(StagedPrefill { keys, values })
    }

    pub(crate) fn commit(&mut self, staged: StagedPrefill<R>) {
        tracing::debug!(
            start = self.start,
            tokens = staged.keys.time_len(),
            batch = self.batch,
            "prefill cache updated"
        );
        self.keys = Some(staged.keys);
        self.values = Some(staged.values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageDType;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    fn block(dev: &<CpuRuntime as Runtime>::Device, tokens: usize, seed: f32) -> Tensor<CpuRuntime> {
        let data: Vec<f32> = (0..tokens * 2).map(|i| seed + i as f32).collect();
        Tensor::<CpuRuntime>::from_slice(&data, &[1, 1, tokens, 2], dev)
    }

    #[test]
    fn test_chunks_append() {
        let (client, dev) = cpu_setup();
        let config = CacheConfig::new(1, 1, 2, 8).build().unwrap();
        let mut cache = PrefillCache::<CpuRuntime>::new(config, 1);
        assert!(cache.read(&client).is_err());

        let a = block(&dev, 2, 0.0);
        let staged = cache.stage(&client, &a, &a).unwrap();
        cache.commit(staged);
        let b = block(&dev, 3, 10.0);
        let staged = cache.stage(&client, &b, &b).unwrap();
        let (full, _) = staged.read(&client).unwrap();
        assert_eq!(full.shape(), &[1, 1, 5, 2]);
        cache.commit(staged);

        assert_eq!(cache.cursor(), 5);
        let (keys, _) = cache.read(&client).unwrap();
        let mut want = a.to_vec::<f32>();
        want.extend(b.to_vec::<f32>());
        assert_eq!(keys.to_vec::<f32>(), want);
    }

    #[test]
    fn test_left_aligned_overflow() {
        let (client, dev) = cpu_setup();
        let config = CacheConfig::new(1, 1, 2, 4)
            .with_policy(BufferPolicy::LeftAligned)
            .build()
            .unwrap();
        let cache = PrefillCache::<CpuRuntime>::new(config, 1);
        let a = block(&dev, 5, 0.0);
        assert!(matches!(
            cache.stage(&client, &a, &a),
            Err(Error::CapacityExceeded { requested: 4, .. })
        ));
    }

    #[test]
    fn test_int8_prefill_is_quantized() {
        let (client, dev) = cpu_setup();
        let config = CacheConfig::new(1, 1, 2, 8)
            .with_storage(StorageDType::Int8)
            .build()
            .unwrap();
        let mut cache = PrefillCache::<CpuRuntime>::new(config, 1);
        let a = block(&dev, 2, 1.0);
        let staged = cache.stage(&client, &a, &a).unwrap();
        cache.commit(staged);
        assert!(cache.payload().unwrap().0.is_quantized());
    }
}
