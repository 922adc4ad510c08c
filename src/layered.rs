//! One generate cache per transformer layer

use std::sync::Arc;

use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;

use crate::cache::{GenerateCache, PrefillCache};
use crate::config::CacheConfig;
use crate::error::{Error, Result, shape_mismatch};

/// Per-layer caches of a serving session, all built from one config.
///
/// A layer's cache is taken out for a forward call and put back afterwards,
/// matching the move-in/move-out contract of
/// [`AttentionStrategy`](crate::attention::AttentionStrategy).
pub struct LayeredCache<R: Runtime> {
    config: Arc<CacheConfig>,
    layers: Vec<Option<GenerateCache<R>>>,
}

impl<R: Runtime<DType = DType>> LayeredCache<R>
where
    R::Client: IndexingOps<R>,
{
    pub fn new(config: Arc<CacheConfig>, num_layers: usize, device: &R::Device) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|_| GenerateCache::new(config.clone(), device).map(Some))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(
            num_layers,
            bytes_per_layer = config.bytes_per_token() * config.capacity * config.batch_size,
            "layered cache allocated"
        );
        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Move layer `layer`'s cache out for a forward call.
    pub fn take(&mut self, layer: usize) -> Result<GenerateCache<R>> {
        self.slot_mut(layer)?.take().ok_or_else(|| Error::InvalidArgument {
            arg: "layer",
            reason: format!("cache of layer {layer} is already taken"),
        })
    }

    /// Return a cache taken with [`take`](Self::take).
    pub fn put(&mut self, layer: usize, cache: GenerateCache<R>) -> Result<()> {
        let slot = self.slot_mut(layer)?;
        if slot.is_some() {
            return Err(Error::InvalidArgument {
                arg: "layer",
                reason: format!("cache of layer {layer} is already present"),
            });
        }
        *slot = Some(cache);
        Ok(())
    }

    pub fn get(&self, layer: usize) -> Option<&GenerateCache<R>> {
        self.layers.get(layer).and_then(Option::as_ref)
    }

    /// Cursor of `slot`; every layer advances together.
    pub fn cursor(&self, slot: usize) -> Result<usize> {
        self.present().next().map_or(Ok(0), |c| c.cursor(slot))
    }

    /// Fresh request-scoped caches, one per layer, for a prompt batch.
    pub fn make_prefill_caches(&self, batch: usize) -> Vec<PrefillCache<R>> {
        (0..self.layers.len())
            .map(|_| PrefillCache::new(self.config.clone(), batch))
            .collect()
    }

    /// Seed `slot` in every layer from that layer's finished prefill.
    ///
    /// Every layer's write is staged before any is committed, so a prefill
    /// that any layer rejects leaves all layers unchanged.
    pub fn insert_prefill(&mut self, slot: usize, prefills: Vec<PrefillCache<R>>) -> Result<()> {
        if prefills.len() != self.layers.len() {
            return Err(shape_mismatch("prefills", self.layers.len(), prefills.len()));
        }
        if let Some(layer) = self.layers.iter().position(Option::is_none) {
            return Err(Error::InvalidArgument {
                arg: "layer",
                reason: format!("cannot insert while layer {layer} is taken"),
            });
        }
        if let Some(first) = prefills.first() {
            let span = (first.batch(), first.start(), first.len());
            if prefills.iter().any(|p| (p.batch(), p.start(), p.len()) != span) {
                return Err(Error::InvalidArgument {
                    arg: "prefills",
                    reason: "every layer must prefill the same positions".into(),
                });
            }
        }

        let staged = self
            .present()
            .zip(&prefills)
            .map(|(cache, prefill)| cache.stage_insert(slot, prefill))
            .collect::<Result<Vec<_>>>()?;
        for (cache, write) in self.layers.iter_mut().flatten().zip(staged) {
            cache.commit_insert(write);
        }
        tracing::debug!(
            slot,
            layers = prefills.len(),
            tokens = prefills.first().map_or(0, PrefillCache::len),
            "prefill inserted in every layer"
        );
        Ok(())
    }

    /// Evict `slot` from every layer.
    pub fn evict(&mut self, slot: usize) -> Result<()> {
        for layer in 0..self.layers.len() {
            match self.layers[layer].as_mut() {
                Some(cache) => cache.evict(slot)?,
                None => {
                    return Err(Error::InvalidArgument {
                        arg: "layer",
                        reason: format!("cannot evict while layer {layer} is taken"),
                    });
                }
            }
        }
        Ok(())
    }

    fn slot_mut(&mut self, layer: usize) -> Result<&mut Option<GenerateCache<R>>> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer).ok_or_else(|| Error::InvalidArgument {
            arg: "layer",
            reason: format!("layer {layer} out of range for {num_layers} layers"),
        })
    }

    fn present(&self) -> impl Iterator<Item = &GenerateCache<R>> {
        self.layers.iter().flatten()
    }
}
