//! Long-lived decode cache handle

use std::sync::Arc;

use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::prefill::PrefillCache;
use super::ragged::{RaggedCache, RaggedIndex, StagedRagged};
use super::store::{CacheStore, StagedWrite};
use crate::client::CacheClient;
use crate::config::{AttentionKind, CacheConfig};
use crate::error::{Rejected, Result};

pub(crate) enum Backend<R: Runtime> {
    Slots(CacheStore<R>),
    Ragged(RaggedCache<R>),
}

/// A prefill insert that has been validated but not yet committed.
pub(crate) enum StagedInsert<R: Runtime> {
    Empty,
    Slots(StagedWrite<R>),
    Ragged(StagedRagged<R>),
}

/// Persistent per-slot cache for one attention layer.
///
/// Mutating operations take the handle by value and hand it back, so a caller
/// can never read a handle whose buffers were reused by a later step. On
/// failure the untouched handle comes back inside [`Rejected`].
pub struct GenerateCache<R: Runtime> {
    backend: Backend<R>,
}

impl<R: Runtime<DType = DType>> GenerateCache<R>
where
    R::Client: IndexingOps<R>,
{
    /// Contiguous slots for dense/flash attention, a paged pool for ragged.
    pub fn new(config: Arc<CacheConfig>, device: &R::Device) -> Result<Self> {
        let backend = match config.attention {
            AttentionKind::Ragged => Backend::Ragged(RaggedCache::new(config, device)?),
            AttentionKind::Dense | AttentionKind::Flash => {
                Backend::Slots(CacheStore::new(config, device)?)
            }
        };
        Ok(Self { backend })
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        match &self.backend {
            Backend::Slots(s) => s.config(),
            Backend::Ragged(r) => r.config(),
        }
    }

    pub fn cursor(&self, slot: usize) -> Result<usize> {
        match &self.backend {
            Backend::Slots(s) => s.cursor(slot),
            Backend::Ragged(r) => r.cursor(slot),
        }
    }

    pub fn cursors(&self) -> &[usize] {
        match &self.backend {
            Backend::Slots(s) => s.tracker().cursors(),
            Backend::Ragged(r) => r.cursors(),
        }
    }

    /// Decoded keys/values of one slot.
    ///
    /// Contiguous slots return the whole `[1, kv_heads, capacity, head_dim]`
    /// row indexed by address; ragged slots return positions `0..cursor`.
    pub fn read<C: CacheClient<R>>(&self, client: &C, slot: usize) -> Result<(Tensor<R>, Tensor<R>)> {
        match &self.backend {
            Backend::Slots(s) => s.read(client, slot),
            Backend::Ragged(r) => r.read(client, slot),
        }
    }

    pub fn store(&self) -> Option<&CacheStore<R>> {
        match &self.backend {
            Backend::Slots(s) => Some(s),
            Backend::Ragged(_) => None,
        }
    }

    pub fn ragged(&self) -> Option<&RaggedCache<R>> {
        match &self.backend {
            Backend::Slots(_) => None,
            Backend::Ragged(r) => Some(r),
        }
    }

    pub fn ragged_index(&self) -> Option<RaggedIndex> {
        self.ragged().map(RaggedCache::ragged_index)
    }

    /// Seed `slot` with a finished prefill; the slot's cursor ends at
    /// `prefill.cursor()`. The prefill cache is consumed.
    pub fn insert_prefill(
        mut self,
        slot: usize,
        prefill: PrefillCache<R>,
    ) -> std::result::Result<Self, Rejected<Self>> {
        match self.stage_insert(slot, &prefill) {
            Ok(staged) => {
                self.commit_insert(staged);
                tracing::debug!(slot, tokens = prefill.len(), "prefill inserted");
                Ok(self)
            }
            Err(e) => Err(Rejected::new(e, self)),
        }
    }

    /// Validate a prefill insert and apply it to copies of the buffers.
    pub(crate) fn stage_insert(&self, slot: usize, prefill: &PrefillCache<R>) -> Result<StagedInsert<R>> {
        Ok(match &self.backend {
            Backend::Slots(s) => s.stage_insert(slot, prefill)?.map(StagedInsert::Slots),
            Backend::Ragged(r) => r.stage_insert(slot, prefill)?.map(StagedInsert::Ragged),
        }
        .unwrap_or(StagedInsert::Empty))
    }

    /// Swap in an insert staged on this cache.
    pub(crate) fn commit_insert(&mut self, staged: StagedInsert<R>) {
        match (&mut self.backend, staged) {
            (Backend::Slots(s), StagedInsert::Slots(w)) => s.commit(w),
            (Backend::Ragged(r), StagedInsert::Ragged(w)) => r.commit(w),
            (_, StagedInsert::Empty) => {}
            _ => unreachable!("insert staged on a cache of another layout"),
        }
    }

    /// Drop the sequence in `slot`; its storage is reused by the next admission.
    pub fn evict(&mut self, slot: usize) -> Result<()> {
        match &mut self.backend {
            Backend::Slots(s) => s.reset(slot)?,
            Backend::Ragged(r) => r.release(slot)?,
        }
        tracing::debug!(slot, "sequence evicted");
        Ok(())
    }

    pub(crate) fn backend_mut(&mut self) -> &mut Backend<R> {
        &mut self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPolicy;
    use crate::error::Error;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    fn prompt(config: &Arc<CacheConfig>, tokens: usize) -> PrefillCache<CpuRuntime> {
        let (client, dev) = cpu_setup();
        let data: Vec<f32> = (0..tokens * 2).map(|i| i as f32).collect();
        let k = Tensor::<CpuRuntime>::from_slice(&data, &[1, 1, tokens, 2], &dev);
        let mut prefill = PrefillCache::new(config.clone(), 1);
        let staged = prefill.stage(&client, &k, &k).unwrap();
        prefill.commit(staged);
        prefill
    }

    #[test]
    fn test_insert_sets_cursor() {
        let (client, dev) = cpu_setup();
        let config = CacheConfig::new(2, 1, 2, 8).build().unwrap();
        let cache = GenerateCache::<CpuRuntime>::new(config.clone(), &dev).unwrap();
        let cache = cache.insert_prefill(1, prompt(&config, 3)).unwrap();
        assert_eq!(cache.cursors(), &[0, 3]);

        let (keys, _) = cache.read(&client, 1).unwrap();
        let data = keys.to_vec::<f32>();
        assert_eq!(&data[..6], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_insert_rejected_returns_cache() {
        let (_, dev) = cpu_setup();
        let config = CacheConfig::new(1, 1, 2, 4)
            .with_policy(BufferPolicy::LeftAligned)
            .build()
            .unwrap();
        let big = CacheConfig::new(1, 1, 2, 16).build().unwrap();
        let cache = GenerateCache::<CpuRuntime>::new(config, &dev).unwrap();
        let rejected = match cache.insert_prefill(0, prompt(&big, 6)) {
            Err(r) => r,
            Ok(_) => panic!("expected rejection"),
        };
        let (err, cache) = rejected.into_parts();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert_eq!(cache.cursor(0).unwrap(), 0);
    }

    #[test]
    fn test_evict_ragged_frees_blocks() {
        let (_, dev) = cpu_setup();
        let config = CacheConfig::new(1, 1, 2, 8)
            .with_policy(BufferPolicy::LeftAligned)
            .with_attention(AttentionKind::Ragged)
            .with_ragged_blocks(2, None)
            .build()
            .unwrap();
        let cache = GenerateCache::<CpuRuntime>::new(config.clone(), &dev).unwrap();
        let mut cache = cache.insert_prefill(0, prompt(&config, 5)).unwrap();
        assert_eq!(cache.ragged().unwrap().pool_stats().allocated_blocks, 3);
        assert_eq!(cache.ragged_index().unwrap().len(), 5);

        cache.evict(0).unwrap();
        assert_eq!(cache.ragged().unwrap().pool_stats().allocated_blocks, 0);
        assert_eq!(cache.cursor(0).unwrap(), 0);
    }
}
